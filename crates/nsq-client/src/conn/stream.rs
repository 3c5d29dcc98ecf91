// Transport stack for one broker link: TCP, optional TLS, optional compression.
//
// The handshake runs on the unified `ConnStream` so the TLS upgrade can take
// the raw TCP socket back. Once negotiation settles, the stream is split and
// each half is wrapped in its compression codec independently.
use async_compression::Level;
use async_compression::tokio::bufread::DeflateDecoder;
use async_compression::tokio::write::DeflateEncoder;
use bytes::BytesMut;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{Config, TlsMinVersion};
use crate::error::{ClientError, Result};

/// Compression negotiated for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    None,
    Deflate(u32),
    Snappy,
}

/// The stream the handshake runs on, before read/write halves are split.
pub(crate) enum ConnStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Upgrades the raw TCP stream to TLS per the negotiated IDENTIFY response.
pub(crate) async fn upgrade_tls(
    stream: ConnStream,
    config: &Config,
    addr: &str,
) -> Result<ConnStream> {
    let ConnStream::Tcp(tcp) = stream else {
        return Err(ClientError::Protocol("tls upgrade on a tls stream".into()));
    };
    let tls_config = build_tls_client_config(config)?;
    let connector = TlsConnector::from(tls_config);
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ClientError::identify(format!("invalid tls server name {host:?}")))?;
    let tls = connector.connect(server_name, tcp).await?;
    Ok(ConnStream::Tls(Box::new(tls)))
}

fn build_tls_client_config(config: &Config) -> Result<Arc<rustls::ClientConfig>> {
    let versions: &[&rustls::SupportedProtocolVersion] = match config.tls_min_version {
        TlsMinVersion::Tls12 => rustls::ALL_VERSIONS,
        TlsMinVersion::Tls13 => &[&rustls::version::TLS13],
    };
    let builder = rustls::ClientConfig::builder_with_protocol_versions(versions);
    let tls_config = if config.tls_insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            // Skip certificates the store rejects rather than failing outright.
            let _ = roots.add(cert);
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(tls_config))
}

// Dangerous: certificate verifier that accepts any certificate.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Read half of a connection after negotiation, decompressing if required.
pub(crate) enum FrameReader {
    Plain(BufReader<ReadHalf<ConnStream>>),
    Deflate(Box<DeflateDecoder<BufReader<ReadHalf<ConnStream>>>>),
    Snappy(SnappyReader<ReadHalf<ConnStream>>),
}

impl FrameReader {
    pub(crate) fn new(half: ReadHalf<ConnStream>, compression: Compression) -> Self {
        match compression {
            Compression::None => FrameReader::Plain(BufReader::new(half)),
            Compression::Deflate(_) => {
                FrameReader::Deflate(Box::new(DeflateDecoder::new(BufReader::new(half))))
            }
            Compression::Snappy => FrameReader::Snappy(SnappyReader::new(half)),
        }
    }
}

impl AsyncRead for FrameReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FrameReader::Plain(r) => Pin::new(r).poll_read(cx, buf),
            FrameReader::Deflate(r) => Pin::new(r.as_mut()).poll_read(cx, buf),
            FrameReader::Snappy(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

/// Write half of a connection after negotiation, compressing if required.
pub(crate) enum FrameWriter {
    Plain(WriteHalf<ConnStream>),
    Deflate(Box<DeflateEncoder<WriteHalf<ConnStream>>>),
    Snappy(SnappyWriter<WriteHalf<ConnStream>>),
}

impl FrameWriter {
    pub(crate) fn new(half: WriteHalf<ConnStream>, compression: Compression) -> Self {
        match compression {
            Compression::None => FrameWriter::Plain(half),
            Compression::Deflate(level) => FrameWriter::Deflate(Box::new(
                DeflateEncoder::with_quality(half, Level::Precise(level as i32)),
            )),
            Compression::Snappy => FrameWriter::Snappy(SnappyWriter::new(half)),
        }
    }
}

impl AsyncWrite for FrameWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FrameWriter::Plain(w) => Pin::new(w).poll_write(cx, buf),
            FrameWriter::Deflate(w) => Pin::new(w.as_mut()).poll_write(cx, buf),
            FrameWriter::Snappy(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FrameWriter::Plain(w) => Pin::new(w).poll_flush(cx),
            FrameWriter::Deflate(w) => Pin::new(w.as_mut()).poll_flush(cx),
            FrameWriter::Snappy(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FrameWriter::Plain(w) => Pin::new(w).poll_shutdown(cx),
            FrameWriter::Deflate(w) => Pin::new(w.as_mut()).poll_shutdown(cx),
            FrameWriter::Snappy(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

// Snappy framing format chunk types.
const SNAPPY_CHUNK_COMPRESSED: u8 = 0x00;
const SNAPPY_CHUNK_UNCOMPRESSED: u8 = 0x01;
const SNAPPY_CHUNK_STREAM_IDENTIFIER: u8 = 0xff;
const SNAPPY_CHECKSUM_LEN: usize = 4;

/// Decodes the snappy framing format chunk by chunk.
///
/// Chunk checksums are not verified; stream integrity is delegated to
/// TCP/TLS underneath.
pub(crate) struct SnappyReader<R> {
    inner: R,
    decoder: snap::raw::Decoder,
    /// Wire bytes that do not yet form a complete chunk.
    raw: BytesMut,
    /// Decompressed bytes not yet handed to the caller.
    decoded: BytesMut,
}

impl<R> SnappyReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: snap::raw::Decoder::new(),
            raw: BytesMut::with_capacity(8 * 1024),
            decoded: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Consumes one complete chunk out of `raw` if present.
    fn try_decode_chunk(&mut self) -> io::Result<bool> {
        if self.raw.len() < 4 {
            return Ok(false);
        }
        let chunk_type = self.raw[0];
        let len = u32::from_le_bytes([self.raw[1], self.raw[2], self.raw[3], 0]) as usize;
        if self.raw.len() < 4 + len {
            return Ok(false);
        }
        let chunk = self.raw.split_to(4 + len);
        let body = &chunk[4..];
        match chunk_type {
            SNAPPY_CHUNK_STREAM_IDENTIFIER => {}
            SNAPPY_CHUNK_COMPRESSED => {
                if body.len() < SNAPPY_CHECKSUM_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "snappy chunk shorter than its checksum",
                    ));
                }
                let data = self
                    .decoder
                    .decompress_vec(&body[SNAPPY_CHECKSUM_LEN..])
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                self.decoded.extend_from_slice(&data);
            }
            SNAPPY_CHUNK_UNCOMPRESSED => {
                if body.len() < SNAPPY_CHECKSUM_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "snappy chunk shorter than its checksum",
                    ));
                }
                self.decoded.extend_from_slice(&body[SNAPPY_CHECKSUM_LEN..]);
            }
            0x02..=0x7f => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unskippable snappy chunk type {chunk_type:#x}"),
                ));
            }
            // 0x80..=0xfe are reserved skippable chunks.
            _ => {}
        }
        Ok(true)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SnappyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.decoded.is_empty() {
                let n = this.decoded.len().min(buf.remaining());
                buf.put_slice(&this.decoded.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.try_decode_chunk()? {
                continue;
            }
            let mut tmp = [0u8; 8 * 1024];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf))?;
            let filled = tmp_buf.filled();
            if filled.is_empty() {
                // EOF mid-chunk surfaces as a clean zero-byte read; the frame
                // layer above turns a short frame into an error.
                return Poll::Ready(Ok(()));
            }
            this.raw.extend_from_slice(filled);
        }
    }
}

/// Encodes the snappy framing format through a staging buffer.
///
/// Bytes are compressed synchronously into the staging encoder; `poll_flush`
/// finalizes the pending frame and drains it to the socket.
pub(crate) struct SnappyWriter<W> {
    inner: W,
    encoder: snap::write::FrameEncoder<Vec<u8>>,
    staged_pos: usize,
}

impl<W> SnappyWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            encoder: snap::write::FrameEncoder::new(Vec::with_capacity(8 * 1024)),
            staged_pos: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> SnappyWriter<W> {
    fn poll_drain_staged(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let staged = self.encoder.get_mut();
            if self.staged_pos >= staged.len() {
                staged.clear();
                self.staged_pos = 0;
                return Poll::Ready(Ok(()));
            }
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &staged[self.staged_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.staged_pos += n;
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SnappyWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        use std::io::Write;
        let this = self.get_mut();
        this.encoder.write_all(buf)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        use std::io::Write;
        let this = self.get_mut();
        this.encoder.flush()?;
        ready!(this.poll_drain_staged(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        use std::io::Write;
        let this = self.get_mut();
        this.encoder.flush()?;
        ready!(this.poll_drain_staged(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn snappy_reader_decodes_frame_encoder_output() {
        use std::io::Write;
        let mut encoder = snap::write::FrameEncoder::new(Vec::new());
        encoder.write_all(b"hello snappy framing").expect("compress");
        encoder.flush().expect("flush");
        let wire = encoder.into_inner().expect("inner");

        let mut reader = SnappyReader::new(std::io::Cursor::new(wire));
        let mut out = vec![0u8; b"hello snappy framing".len()];
        reader.read_exact(&mut out).await.expect("read");
        assert_eq!(out, b"hello snappy framing");
    }

    #[tokio::test]
    async fn snappy_reader_handles_split_chunks() {
        use std::io::Write;
        let mut encoder = snap::write::FrameEncoder::new(Vec::new());
        encoder.write_all(b"first").expect("compress");
        encoder.flush().expect("flush");
        encoder.write_all(b"second").expect("compress");
        encoder.flush().expect("flush");
        let wire = encoder.into_inner().expect("inner");

        let mut reader = SnappyReader::new(std::io::Cursor::new(wire));
        let mut out = vec![0u8; 11];
        reader.read_exact(&mut out).await.expect("read");
        assert_eq!(out, b"firstsecond");
    }

    #[tokio::test]
    async fn snappy_reader_rejects_unskippable_chunk() {
        let wire = vec![0x20, 0x01, 0x00, 0x00, 0xaa];
        let mut reader = SnappyReader::new(std::io::Cursor::new(wire));
        let mut out = [0u8; 1];
        let err = reader.read_exact(&mut out).await.expect_err("bad chunk");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
