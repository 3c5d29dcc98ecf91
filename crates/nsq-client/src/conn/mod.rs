//! One broker connection: handshake, frame demultiplexing, acknowledgements.
//!
//! # Purpose
//! Owns a single TCP link to an nsqd. The handshake negotiates features
//! (TLS, compression, heartbeats, auth), subscribes the consumer's
//! (topic, channel), and then splits the stream into a dedicated read loop
//! and a serialized write loop.
//!
//! # Design notes
//! The read loop is the only place a connection's death is announced: it
//! emits `ConnEvent::Closed` exactly once on exit, and every other failure
//! path funnels into it through the per-connection shutdown signal.
pub(crate) mod stream;

use bytes::{Bytes, BytesMut};
use nsq_wire::{
    Command, Frame, FrameType, IdentifyBody, IdentifyResponse, MessageId, WireMessage, error_code,
    is_fatal_error,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::counters::Counters;
use crate::error::{ClientError, Result};
use crate::message::Message;
use crate::wire::frame_io::{
    HEARTBEAT, OK, expect_ok, read_frame, read_response_frame, write_command, write_magic,
};
use stream::{Compression, ConnStream, FrameReader, FrameWriter, upgrade_tls};

/// Depth of the outbound command queue feeding the write loop.
const CMD_QUEUE_DEPTH: usize = 1024;

/// Commands routed through a connection's write loop.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnCommand {
    Rdy(i64),
    Fin(MessageId),
    Req {
        id: MessageId,
        delay: Duration,
        backoff: bool,
    },
    Touch(MessageId),
    Nop,
    /// Begin the graceful CLS drain.
    Close,
}

/// Notifications a connection surfaces to its consumer.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// A message arrived; the controller may need to refresh the RDY grant.
    Received { addr: String },
    /// A message was requeued with backoff accounting.
    Backoff { addr: String },
    /// A message finished cleanly.
    Resume { addr: String },
    Heartbeat { addr: String },
    /// The connection is gone and should be removed from the maps.
    Closed { addr: String },
    /// The consumer's global budget changed; refresh every connection.
    MaxInFlightChanged,
}

/// Capabilities a connection needs from its consumer, passed at construction
/// so the connection never holds an owning reference back to it.
#[derive(Clone)]
pub(crate) struct ConnContext {
    pub(crate) consumer_id: usize,
    pub(crate) topic: String,
    pub(crate) channel: String,
    pub(crate) config: Arc<Config>,
    pub(crate) incoming_tx: mpsc::Sender<Message>,
    pub(crate) events_tx: mpsc::UnboundedSender<ConnEvent>,
    pub(crate) counters: Arc<Counters>,
}

pub(crate) struct Connection {
    addr: String,
    consumer_id: usize,
    cmd_tx: mpsc::Sender<ConnCommand>,
    shutdown_tx: watch::Sender<bool>,
    /// RDY last sent to the broker.
    last_rdy: AtomicI64,
    /// RDY remaining before the broker needs another grant.
    rdy_count: AtomicI64,
    in_flight: AtomicI64,
    /// Server-advertised ceiling for any single RDY.
    max_rdy: AtomicI64,
    /// Negotiated visibility timeout; bounds the close drain.
    msg_timeout: Duration,
    closing: AtomicBool,
    last_msg_at: Mutex<Instant>,
    last_heartbeat_at: Mutex<Instant>,
}

impl Connection {
    /// Dials `addr` and runs the full handshake; on success the read and
    /// write loops are running and the connection is ready for RDY.
    pub(crate) async fn connect(addr: String, ctx: ConnContext) -> Result<Arc<Connection>> {
        let config = Arc::clone(&ctx.config);
        let tcp = timeout(config.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::timeout("tcp connect"))??;
        tcp.set_nodelay(true)?;
        let mut stream = ConnStream::Tcp(tcp);
        let mut scratch = BytesMut::with_capacity(1024);

        timeout(config.write_timeout, write_magic(&mut stream))
            .await
            .map_err(|_| ClientError::timeout("write magic"))??;

        let identify = identify_body(&config);
        let body = serde_json::to_vec(&identify)
            .map_err(|err| ClientError::Protocol(format!("encode identify: {err}")))?;
        timeout(
            config.write_timeout,
            write_command(&mut stream, &Command::Identify(Bytes::from(body)), &mut scratch),
        )
        .await
        .map_err(|_| ClientError::timeout("write identify"))??;

        let frame = timeout(
            config.read_timeout,
            read_response_frame(&mut stream, config.max_frame_bytes, &mut scratch),
        )
        .await
        .map_err(|_| ClientError::timeout("identify response"))??;
        let response = parse_identify_response(&frame)?;
        debug!(
            consumer_id = ctx.consumer_id,
            nsqd = %addr,
            max_rdy_count = response.max_rdy_count,
            tls = response.tls_v1,
            snappy = response.snappy,
            deflate = response.deflate,
            auth_required = response.auth_required,
            "identify negotiated"
        );

        let heartbeat_interval = if response.heartbeat_interval > 0 {
            Duration::from_millis(response.heartbeat_interval as u64)
        } else {
            config.heartbeat_interval
        };
        let msg_timeout = if response.msg_timeout > 0 {
            Duration::from_millis(response.msg_timeout as u64)
        } else {
            config.msg_timeout
        };

        if response.tls_v1 {
            stream = timeout(config.read_timeout, upgrade_tls(stream, &config, &addr))
                .await
                .map_err(|_| ClientError::timeout("tls handshake"))??;
            let frame = timeout(
                config.read_timeout,
                read_response_frame(&mut stream, config.max_frame_bytes, &mut scratch),
            )
            .await
            .map_err(|_| ClientError::timeout("tls upgrade response"))??;
            expect_ok(&frame, "tls upgrade")?;
        }

        let compression = if response.snappy {
            Compression::Snappy
        } else if response.deflate {
            let level = if response.deflate_level > 0 {
                response.deflate_level as u32
            } else {
                config.deflate_level
            };
            Compression::Deflate(level)
        } else {
            Compression::None
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, compression);
        let mut writer = FrameWriter::new(write_half, compression);

        if compression != Compression::None {
            let frame = timeout(
                config.read_timeout,
                read_response_split(&mut reader, &mut writer, config.max_frame_bytes, &mut scratch),
            )
            .await
            .map_err(|_| ClientError::timeout("compression upgrade response"))??;
            expect_ok(&frame, "compression upgrade")?;
        }

        if response.auth_required {
            let secret = config.auth_secret.clone().ok_or_else(|| {
                ClientError::identify("broker requires auth but no auth_secret is configured")
            })?;
            timeout(
                config.write_timeout,
                write_command(&mut writer, &Command::Auth(Bytes::from(secret)), &mut scratch),
            )
            .await
            .map_err(|_| ClientError::timeout("write auth"))??;
            let frame = timeout(
                config.read_timeout,
                read_response_split(&mut reader, &mut writer, config.max_frame_bytes, &mut scratch),
            )
            .await
            .map_err(|_| ClientError::timeout("auth response"))??;
            let auth = parse_auth_response(&frame)?;
            info!(
                consumer_id = ctx.consumer_id,
                nsqd = %addr,
                identity = %auth.identity,
                permissions = auth.permission_count,
                "authenticated"
            );
        }

        timeout(
            config.write_timeout,
            write_command(
                &mut writer,
                &Command::Sub {
                    topic: ctx.topic.clone(),
                    channel: ctx.channel.clone(),
                },
                &mut scratch,
            ),
        )
        .await
        .map_err(|_| ClientError::timeout("write sub"))??;
        let frame = timeout(
            config.read_timeout,
            read_response_split(&mut reader, &mut writer, config.max_frame_bytes, &mut scratch),
        )
        .await
        .map_err(|_| ClientError::timeout("sub response"))??;
        expect_ok(&frame, "subscribe")?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);
        let now = Instant::now();
        let conn = Arc::new(Connection {
            addr: addr.clone(),
            consumer_id: ctx.consumer_id,
            cmd_tx,
            shutdown_tx,
            last_rdy: AtomicI64::new(0),
            rdy_count: AtomicI64::new(0),
            in_flight: AtomicI64::new(0),
            max_rdy: AtomicI64::new(response.max_rdy_count),
            msg_timeout,
            closing: AtomicBool::new(false),
            last_msg_at: Mutex::new(now),
            last_heartbeat_at: Mutex::new(now),
        });

        // The read deadline doubles as the heartbeat watchdog.
        let read_deadline = config.read_timeout.max(2 * heartbeat_interval);
        tokio::spawn(read_loop(Arc::clone(&conn), reader, ctx.clone(), read_deadline));
        tokio::spawn(write_loop(Arc::clone(&conn), writer, cmd_rx, ctx));
        info!(consumer_id = conn.consumer_id, nsqd = %addr, "connected");
        Ok(conn)
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn last_rdy(&self) -> i64 {
        self.last_rdy.load(Ordering::SeqCst)
    }

    pub(crate) fn rdy_count(&self) -> i64 {
        self.rdy_count.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_rdy(&self) -> i64 {
        self.max_rdy.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Sends a new RDY grant and records it.
    pub(crate) async fn set_rdy(&self, count: i64) {
        if self.is_closing() {
            return;
        }
        self.last_rdy.store(count, Ordering::SeqCst);
        self.rdy_count.store(count, Ordering::SeqCst);
        if self.cmd_tx.send(ConnCommand::Rdy(count)).await.is_err() {
            debug!(nsqd = %self.addr, "rdy update dropped; connection closing");
        }
    }

    /// Begins a graceful close: CLS, drain in-flight, tear down.
    pub(crate) async fn close(&self) {
        if self.cmd_tx.send(ConnCommand::Close).await.is_err() {
            self.trigger_shutdown();
        }
    }

    /// Forces both loops to exit without the CLS drain.
    pub(crate) fn trigger_shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn last_message_elapsed(&self) -> Duration {
        self.last_msg_at.lock().expect("last_msg_at lock").elapsed()
    }

    fn last_heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat_at
            .lock()
            .expect("last_heartbeat_at lock")
            .elapsed()
    }

    fn touch_last_msg(&self) {
        *self.last_msg_at.lock().expect("last_msg_at lock") = Instant::now();
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat_at.lock().expect("last_heartbeat_at lock") = Instant::now();
    }
}

fn identify_body(config: &Config) -> IdentifyBody {
    IdentifyBody {
        client_id: config.client_id.clone(),
        hostname: config.hostname.clone(),
        user_agent: config.user_agent.clone(),
        feature_negotiation: true,
        heartbeat_interval: config.heartbeat_interval.as_millis() as i64,
        output_buffer_size: config.output_buffer_size,
        output_buffer_timeout: config.output_buffer_timeout.as_millis() as i64,
        msg_timeout: config.msg_timeout.as_millis() as i64,
        sample_rate: i32::from(config.sample_rate),
        tls_v1: config.tls_v1,
        deflate: config.deflate,
        deflate_level: config.deflate_level as i32,
        snappy: config.snappy,
    }
}

fn parse_identify_response(frame: &Frame) -> Result<IdentifyResponse> {
    match frame.frame_type {
        FrameType::Error => Err(ClientError::identify(format!(
            "broker rejected identify: {}",
            String::from_utf8_lossy(&frame.payload)
        ))),
        FrameType::Response if frame.payload.as_ref() == OK => {
            // Pre-feature-negotiation broker; assume stock limits.
            Ok(IdentifyResponse::default())
        }
        FrameType::Response => serde_json::from_slice(&frame.payload).map_err(|err| {
            ClientError::identify(format!("unparseable identify response: {err}"))
        }),
        FrameType::Message => Err(ClientError::identify(
            "message frame before subscription".to_string(),
        )),
    }
}

fn parse_auth_response(frame: &Frame) -> Result<nsq_wire::AuthResponse> {
    match frame.frame_type {
        FrameType::Error => Err(ClientError::identify(format!(
            "auth rejected: {}",
            String::from_utf8_lossy(&frame.payload)
        ))),
        FrameType::Response => serde_json::from_slice(&frame.payload)
            .map_err(|err| ClientError::identify(format!("unparseable auth response: {err}"))),
        FrameType::Message => Err(ClientError::identify(
            "message frame before subscription".to_string(),
        )),
    }
}

/// Post-split variant of `read_response_frame`: reads with one half, answers
/// heartbeats with the other.
async fn read_response_split(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    max_frame_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Frame> {
    loop {
        let frame = read_frame(reader, max_frame_bytes).await?;
        if frame.frame_type == FrameType::Response && frame.payload.as_ref() == HEARTBEAT {
            write_command(writer, &Command::Nop, scratch).await?;
            continue;
        }
        return Ok(frame);
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut reader: FrameReader,
    ctx: ConnContext,
    read_deadline: Duration,
) {
    let mut shutdown_rx = conn.shutdown_tx.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = timeout(read_deadline, read_frame(&mut reader, ctx.config.max_frame_bytes)) => {
                match result {
                    Err(_) => {
                        warn!(
                            consumer_id = conn.consumer_id,
                            nsqd = %conn.addr,
                            deadline = ?read_deadline,
                            last_heartbeat = ?conn.last_heartbeat_elapsed(),
                            "no frames before the read deadline; assuming missed heartbeats"
                        );
                        break;
                    }
                    Ok(Err(err)) => {
                        if conn.is_closing() {
                            debug!(consumer_id = conn.consumer_id, nsqd = %conn.addr, error = %err, "read ended during close");
                        } else {
                            warn!(consumer_id = conn.consumer_id, nsqd = %conn.addr, error = %err, "read failed");
                        }
                        break;
                    }
                    Ok(Ok(frame)) => frame,
                }
            }
        };
        match frame.frame_type {
            FrameType::Response => {
                if frame.payload.as_ref() == HEARTBEAT {
                    conn.touch_heartbeat();
                    if conn.cmd_tx.send(ConnCommand::Nop).await.is_err() {
                        break;
                    }
                    let _ = ctx.events_tx.send(ConnEvent::Heartbeat {
                        addr: conn.addr.clone(),
                    });
                } else {
                    // OK acks for RDY-less commands and CLOSE_WAIT land here.
                    debug!(
                        nsqd = %conn.addr,
                        response = %String::from_utf8_lossy(&frame.payload),
                        "response"
                    );
                }
            }
            FrameType::Error => {
                let code = error_code(&frame.payload);
                warn!(
                    consumer_id = conn.consumer_id,
                    nsqd = %conn.addr,
                    error = %String::from_utf8_lossy(&frame.payload),
                    "broker error"
                );
                if is_fatal_error(code) {
                    break;
                }
            }
            FrameType::Message => {
                let wire = match WireMessage::decode(frame.payload) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!(nsqd = %conn.addr, error = %err, "undecodable message frame");
                        break;
                    }
                };
                let in_flight = conn.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                conn.rdy_count.fetch_sub(1, Ordering::SeqCst);
                conn.touch_last_msg();
                // Informational only: the broker pushed past its grant.
                if in_flight > conn.last_rdy() + 1 {
                    warn!(
                        nsqd = %conn.addr,
                        in_flight,
                        last_rdy = conn.last_rdy(),
                        "more messages in flight than the last RDY grant"
                    );
                }
                ctx.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("nsq_consumer_messages_received_total").increment(1);
                let message = Message::new(
                    wire,
                    conn.addr.clone(),
                    conn.cmd_tx.clone(),
                    ctx.config.default_requeue_delay,
                    ctx.config.max_requeue_delay,
                );
                if ctx.incoming_tx.send(message).await.is_err() {
                    debug!(nsqd = %conn.addr, "incoming queue closed");
                    break;
                }
                let _ = ctx.events_tx.send(ConnEvent::Received {
                    addr: conn.addr.clone(),
                });
            }
        }
    }
    conn.trigger_shutdown();
    let _ = ctx.events_tx.send(ConnEvent::Closed {
        addr: conn.addr.clone(),
    });
    debug!(consumer_id = conn.consumer_id, nsqd = %conn.addr, "read loop exited");
}

async fn write_loop(
    conn: Arc<Connection>,
    mut writer: FrameWriter,
    mut cmd_rx: mpsc::Receiver<ConnCommand>,
    ctx: ConnContext,
) {
    use tokio::io::AsyncWriteExt;

    let mut shutdown_rx = conn.shutdown_tx.subscribe();
    let mut scratch = BytesMut::with_capacity(1024);
    let drain_deadline = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(drain_deadline);
    let mut draining = false;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = &mut drain_deadline, if draining => {
                warn!(
                    nsqd = %conn.addr,
                    in_flight = conn.in_flight(),
                    "close drain deadline; abandoning in-flight messages"
                );
                break;
            }
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                let wire = match command {
                    ConnCommand::Close => {
                        if draining {
                            continue;
                        }
                        draining = true;
                        conn.closing.store(true, Ordering::SeqCst);
                        drain_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + conn.msg_timeout);
                        Command::Cls
                    }
                    ConnCommand::Rdy(count) => {
                        if draining {
                            continue;
                        }
                        Command::Rdy(count)
                    }
                    ConnCommand::Fin(id) => Command::Fin(id),
                    ConnCommand::Req { id, delay, .. } => Command::Req {
                        id,
                        delay_ms: delay.as_millis() as u64,
                    },
                    ConnCommand::Touch(id) => Command::Touch(id),
                    ConnCommand::Nop => Command::Nop,
                };
                let result = timeout(
                    ctx.config.write_timeout,
                    write_command(&mut writer, &wire, &mut scratch),
                )
                .await
                .map_err(|_| ClientError::timeout("write command"))
                .and_then(|inner| inner);
                if let Err(err) = result {
                    warn!(nsqd = %conn.addr, command = wire.name(), error = %err, "write failed");
                    break;
                }
                match command {
                    ConnCommand::Fin(_) => {
                        conn.in_flight.fetch_sub(1, Ordering::SeqCst);
                        ctx.counters.messages_finished.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("nsq_consumer_messages_finished_total").increment(1);
                        let _ = ctx.events_tx.send(ConnEvent::Resume {
                            addr: conn.addr.clone(),
                        });
                    }
                    ConnCommand::Req { backoff, .. } => {
                        conn.in_flight.fetch_sub(1, Ordering::SeqCst);
                        ctx.counters.messages_requeued.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("nsq_consumer_messages_requeued_total").increment(1);
                        if backoff {
                            let _ = ctx.events_tx.send(ConnEvent::Backoff {
                                addr: conn.addr.clone(),
                            });
                        }
                    }
                    _ => {}
                }
                if draining && conn.in_flight() <= 0 {
                    debug!(nsqd = %conn.addr, "in-flight drained after CLS");
                    break;
                }
            }
        }
    }
    conn.trigger_shutdown();
    let _ = timeout(Duration::from_secs(1), writer.shutdown()).await;
    debug!(consumer_id = conn.consumer_id, nsqd = %conn.addr, "write loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_response_ok_falls_back_to_defaults() {
        let frame = Frame::new(FrameType::Response, Bytes::from_static(b"OK"));
        let resp = parse_identify_response(&frame).expect("defaults");
        assert_eq!(resp.max_rdy_count, 2500);
        assert!(!resp.tls_v1);
    }

    #[test]
    fn identify_response_parses_feature_document() {
        let frame = Frame::new(
            FrameType::Response,
            Bytes::from_static(br#"{"max_rdy_count":1000,"msg_timeout":45000,"auth_required":true}"#),
        );
        let resp = parse_identify_response(&frame).expect("parse");
        assert_eq!(resp.max_rdy_count, 1000);
        assert_eq!(resp.msg_timeout, 45000);
        assert!(resp.auth_required);
    }

    #[test]
    fn identify_error_frame_surfaces_reason() {
        let frame = Frame::new(FrameType::Error, Bytes::from_static(b"E_BAD_BODY invalid"));
        let err = parse_identify_response(&frame).expect_err("error frame");
        assert!(matches!(err, ClientError::Identify { .. }));
        assert!(err.to_string().contains("E_BAD_BODY"));
    }

    #[test]
    fn identify_body_mirrors_config() {
        let mut config = Config::default();
        config.sample_rate = 25;
        config.snappy = true;
        let body = identify_body(&config);
        assert!(body.feature_negotiation);
        assert_eq!(body.sample_rate, 25);
        assert!(body.snappy);
        assert_eq!(body.heartbeat_interval, 30_000);
    }
}
