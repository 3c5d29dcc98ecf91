// Async frame IO over the broker byte stream.
use bytes::BytesMut;
use nsq_wire::{Command, FRAME_HEADER_LEN, Frame, FrameType, MAGIC_V2, WireError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClientError, Result};

/// Reads one frame, enforcing `max_frame_bytes` before allocating the payload.
pub(crate) async fn read_frame<R>(stream: &mut R, max_frame_bytes: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let size = u32::from_be_bytes(header[0..4].try_into().expect("4 bytes")) as usize;
    if size < 4 {
        return Err(WireError::ShortFrame(size).into());
    }
    let body_len = size - 4;
    if body_len > max_frame_bytes {
        return Err(WireError::FrameTooLarge { size: body_len, cap: max_frame_bytes }.into());
    }
    let raw_type = u32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));
    let frame_type = FrameType::from_wire(raw_type)?;
    let mut payload = BytesMut::zeroed(body_len);
    stream.read_exact(&mut payload).await?;
    Ok(Frame::new(frame_type, payload.freeze()))
}

/// Writes the protocol magic that precedes all framing.
pub(crate) async fn write_magic<W>(stream: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(MAGIC_V2).await?;
    stream.flush().await?;
    Ok(())
}

/// Encodes a command into `scratch` and writes it out, flushing after.
pub(crate) async fn write_command<W>(
    stream: &mut W,
    command: &Command,
    scratch: &mut BytesMut,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    scratch.clear();
    command.encode_into(scratch);
    stream.write_all(scratch).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads frames until one that is not a heartbeat, answering NOP in between.
///
/// Used during the handshake, where a heartbeat can land between our
/// request and the broker's response.
pub(crate) async fn read_response_frame<S>(
    stream: &mut S,
    max_frame_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Frame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = read_frame(stream, max_frame_bytes).await?;
        if frame.frame_type == FrameType::Response && frame.payload.as_ref() == HEARTBEAT {
            write_command(stream, &Command::Nop, scratch).await?;
            continue;
        }
        return Ok(frame);
    }
}

/// Payload of the broker's periodic liveness probe.
pub(crate) const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Payload of an affirmative response frame.
pub(crate) const OK: &[u8] = b"OK";

/// Expects a `Response` frame carrying `OK`; anything else is an error.
pub(crate) fn expect_ok(frame: &Frame, during: &str) -> Result<()> {
    match frame.frame_type {
        FrameType::Response if frame.payload.as_ref() == OK => Ok(()),
        FrameType::Error => Err(ClientError::identify(format!(
            "{during}: broker error {}",
            String::from_utf8_lossy(&frame.payload)
        ))),
        _ => Err(ClientError::identify(format!(
            "{during}: unexpected response {}",
            String::from_utf8_lossy(&frame.payload)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Cursor;

    #[tokio::test]
    async fn read_frame_rejects_oversize() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 16).await.expect_err("oversize");
        assert!(matches!(
            err,
            ClientError::Wire(WireError::FrameTooLarge { size: 96, cap: 16 })
        ));
    }

    #[tokio::test]
    async fn read_frame_round_trips() {
        let frame = Frame::new(FrameType::Response, Bytes::from_static(b"OK"));
        let encoded = frame.encode();
        let mut cursor = Cursor::new(encoded.to_vec());
        let decoded = read_frame(&mut cursor, 1024).await.expect("frame");
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn read_frame_fails_on_truncation() {
        let frame = Frame::new(FrameType::Message, Bytes::from_static(b"partial"));
        let encoded = frame.encode();
        let mut cursor = Cursor::new(encoded[..encoded.len() - 3].to_vec());
        let err = read_frame(&mut cursor, 1024).await.expect_err("truncated");
        assert!(matches!(err, ClientError::Io(_)));
    }
}
