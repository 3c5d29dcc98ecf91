// Integration tests against an in-process mock nsqd.
use bytes::Bytes;
use nsq_wire::{Frame, FrameType, MessageId, WireMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::{ClientError, Config, Consumer, Handler, Message};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    let mut config = Config::default();
    config.max_in_flight = 10;
    config.heartbeat_interval = Duration::from_secs(5);
    config.read_timeout = Duration::from_secs(10);
    config.msg_timeout = Duration::from_secs(2);
    config.default_requeue_delay = Duration::from_millis(100);
    config.max_requeue_delay = Duration::from_secs(1);
    config.backoff_multiplier = Duration::from_millis(50);
    config.max_backoff_duration = Duration::from_secs(2);
    config.lookupd_poll_interval = Duration::from_millis(200);
    config.lookupd_poll_jitter = 0.0;
    config.rdy_redistribute_interval = Duration::from_millis(100);
    config.low_rdy_idle_timeout = Duration::from_millis(50);
    config
}

struct TestHandler {
    delivered: mpsc::UnboundedSender<Message>,
    fail_next: AtomicUsize,
    hold: Duration,
    gave_up: Arc<AtomicBool>,
}

impl TestHandler {
    fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (delivered, rx) = mpsc::unbounded_channel();
        let handler = Self {
            delivered,
            fail_next: AtomicUsize::new(0),
            hold: Duration::ZERO,
            gave_up: Arc::new(AtomicBool::new(false)),
        };
        (handler, rx)
    }

    fn failing(count: usize) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (handler, rx) = Self::new();
        handler.fail_next.store(count, Ordering::SeqCst);
        (handler, rx)
    }

    fn slow(hold: Duration) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (mut handler, rx) = Self::new();
        handler.hold = hold;
        (handler, rx)
    }
}

impl Handler for TestHandler {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let _ = self.delivered.send(message.clone());
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("induced failure");
        }
        Ok(())
    }

    fn on_giving_up(&self, _message: &Message) {
        self.gave_up.store(true, Ordering::SeqCst);
    }
}

/// Waits until the mock has observed `expected` as a full command line,
/// discarding everything else that arrives first.
async fn wait_for_cmd(rx: &mut mpsc::UnboundedReceiver<String>, expected: &str) {
    timeout(WAIT, async {
        loop {
            let cmd = rx.recv().await.expect("mock command stream closed");
            if cmd == expected {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"));
}

async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

#[tokio::test]
async fn connect_requires_handlers() {
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let err = consumer
        .connect_to_nsqd("127.0.0.1:4150")
        .await
        .expect_err("no handlers");
    assert!(matches!(err, ClientError::NoHandlers));
}

#[tokio::test]
async fn handlers_must_come_before_connect() {
    let mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    let (late, _rx) = TestHandler::new();
    let err = consumer.add_handler(late, 1).expect_err("late handler");
    assert!(matches!(err, ClientError::HandlersAfterConnect));
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn invalid_names_are_rejected() {
    let err = Consumer::new("bad topic", "tests", test_config()).expect_err("bad topic");
    assert!(matches!(err, ClientError::InvalidName(_)));
    let err = Consumer::new("events", "", test_config()).expect_err("bad channel");
    assert!(matches!(err, ClientError::InvalidName(_)));
}

#[tokio::test]
async fn handshake_grants_full_budget_to_single_connection() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");

    wait_for_cmd(&mut mock.cmds, "SUB events tests").await;
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;
    assert_eq!(consumer.stats().connections, 1);
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn budget_splits_across_two_connections() {
    let mut mock_a = MockNsqd::spawn().await;
    let mut mock_b = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");

    consumer.connect_to_nsqd(mock_a.addr.clone()).await.expect("connect a");
    wait_for_cmd(&mut mock_a.cmds, "RDY 10").await;

    consumer.connect_to_nsqd(mock_b.addr.clone()).await.expect("connect b");
    wait_for_cmd(&mut mock_a.cmds, "RDY 5").await;
    wait_for_cmd(&mut mock_b.cmds, "RDY 5").await;
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn duplicate_connect_is_rejected() {
    let mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    let err = consumer
        .connect_to_nsqd(mock.addr.clone())
        .await
        .expect_err("duplicate");
    assert!(matches!(err, ClientError::AlreadyConnected));
    assert_eq!(consumer.stats().connections, 1);
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn delivered_message_is_finished() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, mut delivered) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    mock.push_message(b"0123456789abcdef", 1, b"payload");
    let message = timeout(WAIT, delivered.recv())
        .await
        .expect("delivery")
        .expect("message");
    assert_eq!(message.body().as_ref(), b"payload");
    assert_eq!(message.attempts(), 1);
    assert_eq!(message.nsqd_address(), mock.addr);

    wait_for_cmd(&mut mock.cmds, "FIN 0123456789abcdef").await;
    wait_until("stats settle", || {
        let stats = consumer.stats();
        stats.messages_received == 1 && stats.messages_finished == 1
    })
    .await;
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn handler_failure_backs_off_then_probes_and_recovers() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, mut delivered) = TestHandler::failing(1);
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    // First message fails: REQ with the attempt-scaled delay, then RDY 0.
    mock.push_message(b"aaaaaaaaaaaaaaaa", 1, b"fail me");
    timeout(WAIT, delivered.recv()).await.expect("delivery").expect("message");
    wait_for_cmd(&mut mock.cmds, "REQ aaaaaaaaaaaaaaaa 100").await;
    wait_for_cmd(&mut mock.cmds, "RDY 0").await;

    // After the penalty the controller probes one connection with RDY 1.
    wait_for_cmd(&mut mock.cmds, "RDY 1").await;

    // A successful probe message resolves backoff back to the full budget.
    mock.push_message(b"bbbbbbbbbbbbbbbb", 1, b"probe");
    timeout(WAIT, delivered.recv()).await.expect("delivery").expect("message");
    wait_for_cmd(&mut mock.cmds, "FIN bbbbbbbbbbbbbbbb").await;
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    let stats = consumer.stats();
    assert_eq!(stats.messages_requeued, 1);
    assert_eq!(stats.messages_finished, 1);
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn zero_budget_sends_rdy_zero() {
    let mut mock = MockNsqd::spawn().await;
    let mut config = test_config();
    config.max_in_flight = 0;
    let consumer = Consumer::new("events", "tests", config).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 0").await;
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn change_max_in_flight_refreshes_rdy() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    consumer.change_max_in_flight(4);
    wait_for_cmd(&mut mock.cmds, "RDY 4").await;
    assert_eq!(consumer.max_in_flight(), 4);
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn disconnect_from_unknown_nsqd_errors() {
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let err = consumer
        .disconnect_from_nsqd("127.0.0.1:9999")
        .await
        .expect_err("unknown");
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn disconnect_sends_cls_and_removes_connection() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    consumer.disconnect_from_nsqd(&mock.addr).await.expect("disconnect");
    wait_for_cmd(&mut mock.cmds, "CLS").await;
    wait_until("connection removed", || consumer.stats().connections == 0).await;
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn stop_waits_for_in_flight_messages() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, mut delivered) = TestHandler::slow(Duration::from_millis(200));
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    mock.push_message(b"cccccccccccccccc", 1, b"slow one");
    timeout(WAIT, delivered.recv()).await.expect("delivery").expect("message");
    consumer.stop();
    timeout(WAIT, consumer.stopped()).await.expect("stop completes");

    // The in-flight message was acknowledged during the CLS drain.
    wait_for_cmd(&mut mock.cmds, "FIN cccccccccccccccc").await;
    assert_eq!(consumer.stats().messages_finished, 1);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    consumer.stop();
    consumer.stop();
    timeout(WAIT, consumer.stopped()).await.expect("stop completes");
    let err = consumer
        .connect_to_nsqd("127.0.0.1:4150")
        .await
        .expect_err("stopped");
    assert!(matches!(err, ClientError::Stopped));
}

#[tokio::test]
async fn exhausted_attempts_finish_without_handling() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, mut delivered) = TestHandler::new();
    let gave_up = Arc::clone(&handler.gave_up);
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    // max_attempts is 5; a sixth delivery is dropped on the floor.
    mock.push_message(b"dddddddddddddddd", 6, b"too many");
    wait_for_cmd(&mut mock.cmds, "FIN dddddddddddddddd").await;
    assert!(gave_up.load(Ordering::SeqCst));
    assert!(delivered.try_recv().is_err());
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn heartbeats_are_answered_with_nop() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    mock.send_heartbeat();
    wait_for_cmd(&mut mock.cmds, "NOP").await;
    assert_eq!(consumer.stats().connections, 1);
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn fatal_broker_error_closes_connection() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    mock.send_error("E_INVALID cannot SUB in current state");
    wait_until("connection removed", || consumer.stats().connections == 0).await;
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn per_message_error_keeps_connection_alive() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    mock.send_error("E_FIN_FAILED FIN failed");
    mock.send_heartbeat();
    wait_for_cmd(&mut mock.cmds, "NOP").await;
    assert_eq!(consumer.stats().connections, 1);
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn starvation_reflects_in_flight_pressure() {
    let mut mock = MockNsqd::spawn().await;
    let mut config = test_config();
    config.max_in_flight = 1;
    let consumer = Consumer::new("events", "tests", config).expect("consumer");
    let (handler, mut delivered) = TestHandler::slow(Duration::from_millis(300));
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 1").await;

    assert!(!consumer.is_starved());
    mock.push_message(b"eeeeeeeeeeeeeeee", 1, b"hold");
    timeout(WAIT, delivered.recv()).await.expect("delivery").expect("message");
    assert!(consumer.is_starved());
    wait_for_cmd(&mut mock.cmds, "FIN eeeeeeeeeeeeeeee").await;
    wait_until("pressure released", || !consumer.is_starved()).await;
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn redistribution_rotates_a_scarce_budget() {
    let mut mock_a = MockNsqd::spawn().await;
    let mut mock_b = MockNsqd::spawn().await;
    let mut mock_c = MockNsqd::spawn().await;
    let mut config = test_config();
    config.max_in_flight = 1;
    let consumer = Consumer::new("events", "tests", config).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer
        .connect_to_nsqds([mock_a.addr.clone(), mock_b.addr.clone(), mock_c.addr.clone()])
        .await
        .expect("connect all");

    // With three idle connections and a budget of one, redistribution must
    // reclaim each initial grant (RDY 0) and later rotate the single RDY
    // back to every connection.
    for mock in [&mut mock_a, &mut mock_b, &mut mock_c] {
        wait_for_cmd(&mut mock.cmds, "RDY 1").await;
        wait_for_cmd(&mut mock.cmds, "RDY 0").await;
        wait_for_cmd(&mut mock.cmds, "RDY 1").await;
    }
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn lookupd_discovery_connects_to_producers() {
    let mut mock = MockNsqd::spawn().await;
    let endpoint = spawn_mock_lookupd(mock.addr.clone()).await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqlookupd(endpoint).await.expect("lookupd");

    wait_for_cmd(&mut mock.cmds, "SUB events tests").await;
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;
    wait_until("connected", || consumer.stats().connections == 1).await;
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn last_lookupd_endpoint_cannot_be_removed() {
    let mock = MockNsqd::spawn().await;
    let endpoint = spawn_mock_lookupd(mock.addr.clone()).await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer
        .connect_to_nsqlookupd(endpoint.clone())
        .await
        .expect("lookupd");
    let err = consumer
        .disconnect_from_nsqlookupd(&endpoint)
        .await
        .expect_err("last endpoint");
    assert!(matches!(err, ClientError::LastLookupd));
    consumer.stop();
    consumer.stopped().await;
}

#[tokio::test]
async fn direct_connection_reconnects_after_loss() {
    let mut mock = MockNsqd::spawn().await;
    let consumer = Consumer::new("events", "tests", test_config()).expect("consumer");
    let (handler, _rx) = TestHandler::new();
    consumer.add_handler(handler, 1).expect("add handler");
    consumer.connect_to_nsqd(mock.addr.clone()).await.expect("connect");
    wait_for_cmd(&mut mock.cmds, "RDY 10").await;

    mock.drop_connection();
    wait_until("connection dropped", || consumer.stats().connections == 0).await;

    // Without lookupds the consumer retries direct endpoints on the poll
    // cadence; the mock accepts the new session.
    wait_for_cmd(&mut mock.cmds, "SUB events tests").await;
    wait_until("reconnected", || consumer.stats().connections == 1).await;
    consumer.stop();
    consumer.stopped().await;
}

// --- mock broker -----------------------------------------------------------

enum MockDirective {
    Frame(Frame),
    CloseConn,
}

/// A single-session nsqd stand-in: accepts connections one at a time,
/// answers the handshake, records every command line it sees, and pushes
/// whatever frames the test asks for.
struct MockNsqd {
    addr: String,
    cmds: mpsc::UnboundedReceiver<String>,
    directives: mpsc::UnboundedSender<MockDirective>,
}

impl MockNsqd {
    async fn spawn() -> MockNsqd {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock nsqd");
        let addr = listener.local_addr().expect("local addr").to_string();
        let (cmd_tx, cmds) = mpsc::unbounded_channel();
        let (directives, directive_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(listener, cmd_tx, directive_rx));
        MockNsqd { addr, cmds, directives }
    }

    fn push_message(&self, id: &[u8; 16], attempts: u16, body: &[u8]) {
        let wire = WireMessage {
            timestamp_ns: 1,
            attempts,
            id: MessageId(*id),
            body: Bytes::copy_from_slice(body),
        };
        let frame = Frame::new(FrameType::Message, wire.encode());
        let _ = self.directives.send(MockDirective::Frame(frame));
    }

    fn send_heartbeat(&self) {
        let frame = Frame::new(FrameType::Response, Bytes::from_static(b"_heartbeat_"));
        let _ = self.directives.send(MockDirective::Frame(frame));
    }

    fn send_error(&self, text: &str) {
        let frame = Frame::new(FrameType::Error, Bytes::copy_from_slice(text.as_bytes()));
        let _ = self.directives.send(MockDirective::Frame(frame));
    }

    fn drop_connection(&self) {
        let _ = self.directives.send(MockDirective::CloseConn);
    }
}

async fn serve(
    listener: TcpListener,
    cmd_tx: mpsc::UnboundedSender<String>,
    mut directive_rx: mpsc::UnboundedReceiver<MockDirective>,
) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        serve_conn(socket, &cmd_tx, &mut directive_rx).await;
    }
}

async fn serve_conn(
    mut socket: TcpStream,
    cmd_tx: &mpsc::UnboundedSender<String>,
    directive_rx: &mut mpsc::UnboundedReceiver<MockDirective>,
) {
    let mut magic = [0u8; 4];
    if socket.read_exact(&mut magic).await.is_err() {
        return;
    }
    assert_eq!(&magic, nsq_wire::MAGIC_V2, "client must lead with the protocol magic");
    let (read_half, write_half) = socket.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frames(write_half, out_rx));
    let mut reader_task = tokio::spawn(read_commands(
        BufReader::new(read_half),
        cmd_tx.clone(),
        out_tx.clone(),
    ));
    loop {
        tokio::select! {
            directive = directive_rx.recv() => {
                match directive {
                    Some(MockDirective::Frame(frame)) => {
                        if out_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Some(MockDirective::CloseConn) | None => break,
                }
            }
            _ = &mut reader_task => break,
        }
    }
    reader_task.abort();
    writer_task.abort();
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame.encode()).await.is_err() {
            return;
        }
    }
}

async fn read_commands(
    mut reader: BufReader<OwnedReadHalf>,
    cmd_tx: mpsc::UnboundedSender<String>,
    out_tx: mpsc::UnboundedSender<Frame>,
) {
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let line = String::from_utf8_lossy(&line).into_owned();
        let verb = line.split(' ').next().unwrap_or("").to_string();
        match verb.as_str() {
            "IDENTIFY" | "AUTH" => {
                let mut len_buf = [0u8; 4];
                if reader.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut body = vec![0u8; len];
                if reader.read_exact(&mut body).await.is_err() {
                    return;
                }
                let response = if verb == "IDENTIFY" {
                    serde_json::json!({
                        "max_rdy_count": 2500,
                        "heartbeat_interval": 30_000,
                        "msg_timeout": 5_000,
                    })
                } else {
                    serde_json::json!({"identity": "test", "permission_count": 1})
                };
                let frame = Frame::new(FrameType::Response, Bytes::from(response.to_string()));
                if out_tx.send(frame).is_err() {
                    return;
                }
            }
            "SUB" => {
                let frame = Frame::new(FrameType::Response, Bytes::from_static(b"OK"));
                if out_tx.send(frame).is_err() {
                    return;
                }
            }
            "CLS" => {
                let frame = Frame::new(FrameType::Response, Bytes::from_static(b"CLOSE_WAIT"));
                let _ = out_tx.send(frame);
            }
            _ => {}
        }
        if cmd_tx.send(line).is_err() {
            return;
        }
    }
}

/// A one-endpoint nsqlookupd stand-in that always advertises `nsqd_addr`.
async fn spawn_mock_lookupd(nsqd_addr: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock lookupd");
    let endpoint = format!("http://{}", listener.local_addr().expect("local addr"));
    let (host, port) = nsqd_addr.rsplit_once(':').expect("host:port");
    let body = serde_json::json!({
        "producers": [{
            "broadcast_address": host,
            "tcp_port": port.parse::<u16>().expect("port"),
        }]
    })
    .to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    endpoint
}
