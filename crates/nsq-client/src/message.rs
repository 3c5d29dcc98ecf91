// A delivered message and its acknowledgement capabilities.
use bytes::Bytes;
use nsq_wire::{MessageId, WireMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::conn::ConnCommand;

/// A message delivered to a handler.
///
/// Cheaply cloneable; all clones share one response guard, so FIN/REQ is
/// sent at most once no matter how many copies exist. Acknowledgements are
/// routed to the connection the message arrived on; if that connection has
/// since closed they are dropped and the broker redelivers after its
/// visibility timeout.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

struct MessageInner {
    id: MessageId,
    attempts: u16,
    timestamp_ns: i64,
    body: Bytes,
    nsqd_addr: String,
    responded: AtomicBool,
    auto_response_disabled: AtomicBool,
    cmd_tx: mpsc::Sender<ConnCommand>,
    default_requeue_delay: Duration,
    max_requeue_delay: Duration,
}

impl Message {
    pub(crate) fn new(
        wire: WireMessage,
        nsqd_addr: String,
        cmd_tx: mpsc::Sender<ConnCommand>,
        default_requeue_delay: Duration,
        max_requeue_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                id: wire.id,
                attempts: wire.attempts,
                timestamp_ns: wire.timestamp_ns,
                body: wire.body,
                nsqd_addr,
                responded: AtomicBool::new(false),
                auto_response_disabled: AtomicBool::new(false),
                cmd_tx,
                default_requeue_delay,
                max_requeue_delay,
            }),
        }
    }

    pub fn id(&self) -> MessageId {
        self.inner.id
    }

    /// Delivery attempts so far, starting at 1 for the first delivery.
    pub fn attempts(&self) -> u16 {
        self.inner.attempts
    }

    /// Broker-side produce time, nanoseconds since the unix epoch.
    pub fn timestamp_ns(&self) -> i64 {
        self.inner.timestamp_ns
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    /// Address of the broker this message arrived from.
    pub fn nsqd_address(&self) -> &str {
        &self.inner.nsqd_addr
    }

    /// Opts this message out of the worker's automatic FIN/REQ.
    ///
    /// The handler then owns the response and must call [`Message::finish`]
    /// or [`Message::requeue`] itself, typically after the handler returns.
    pub fn disable_auto_response(&self) {
        self.inner.auto_response_disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_auto_response_disabled(&self) -> bool {
        self.inner.auto_response_disabled.load(Ordering::SeqCst)
    }

    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::SeqCst)
    }

    /// Acknowledges successful processing.
    pub async fn finish(&self) {
        if self.claim_response() {
            self.send(ConnCommand::Fin(self.inner.id)).await;
        }
    }

    /// Returns the message to the queue, counting against backoff.
    ///
    /// With `delay` of `None` the delay scales with the attempt count:
    /// `default_requeue_delay × attempts`, capped at `max_requeue_delay`.
    pub async fn requeue(&self, delay: Option<Duration>) {
        self.requeue_inner(delay, true).await;
    }

    /// Returns the message to the queue without touching backoff state.
    pub async fn requeue_without_backoff(&self, delay: Option<Duration>) {
        self.requeue_inner(delay, false).await;
    }

    /// Extends the server-side visibility timeout.
    pub async fn touch(&self) {
        if self.has_responded() {
            return;
        }
        self.send(ConnCommand::Touch(self.inner.id)).await;
    }

    async fn requeue_inner(&self, delay: Option<Duration>, backoff: bool) {
        if !self.claim_response() {
            return;
        }
        let delay = delay.unwrap_or_else(|| self.scaled_requeue_delay());
        self.send(ConnCommand::Req { id: self.inner.id, delay, backoff }).await;
    }

    fn scaled_requeue_delay(&self) -> Duration {
        let scaled = self
            .inner
            .default_requeue_delay
            .saturating_mul(u32::from(self.inner.attempts.max(1)));
        scaled.min(self.inner.max_requeue_delay)
    }

    /// Flips the responded flag; false means someone already answered.
    fn claim_response(&self) -> bool {
        let already = self.inner.responded.swap(true, Ordering::SeqCst);
        if already {
            debug!(id = %self.inner.id, "duplicate response suppressed");
        }
        !already
    }

    async fn send(&self, command: ConnCommand) {
        if self.inner.cmd_tx.send(command).await.is_err() {
            debug!(
                id = %self.inner.id,
                nsqd = %self.inner.nsqd_addr,
                "connection gone; response dropped, broker will redeliver"
            );
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.inner.id)
            .field("attempts", &self.inner.attempts)
            .field("body_len", &self.inner.body.len())
            .field("nsqd_addr", &self.inner.nsqd_addr)
            .field("responded", &self.has_responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_message(attempts: u16) -> (Message, mpsc::Receiver<ConnCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let wire = WireMessage {
            timestamp_ns: 0,
            attempts,
            id: MessageId(*b"0123456789abcdef"),
            body: Bytes::from_static(b"body"),
        };
        let msg = Message::new(
            wire,
            "127.0.0.1:4150".into(),
            cmd_tx,
            Duration::from_secs(90),
            Duration::from_secs(900),
        );
        (msg, cmd_rx)
    }

    #[tokio::test]
    async fn finish_sends_exactly_once() {
        let (msg, mut cmd_rx) = test_message(1);
        msg.finish().await;
        msg.finish().await;
        msg.requeue(None).await;
        assert!(matches!(cmd_rx.recv().await, Some(ConnCommand::Fin(_))));
        assert!(cmd_rx.try_recv().is_err());
        assert!(msg.has_responded());
    }

    #[tokio::test]
    async fn requeue_delay_scales_with_attempts() {
        let (msg, mut cmd_rx) = test_message(3);
        msg.requeue(None).await;
        match cmd_rx.recv().await {
            Some(ConnCommand::Req { delay, backoff, .. }) => {
                assert_eq!(delay, Duration::from_secs(270));
                assert!(backoff);
            }
            other => panic!("expected REQ, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requeue_delay_is_capped() {
        let (msg, mut cmd_rx) = test_message(100);
        msg.requeue(None).await;
        match cmd_rx.recv().await {
            Some(ConnCommand::Req { delay, .. }) => assert_eq!(delay, Duration::from_secs(900)),
            other => panic!("expected REQ, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn touch_is_ignored_after_response() {
        let (msg, mut cmd_rx) = test_message(1);
        msg.touch().await;
        msg.finish().await;
        msg.touch().await;
        assert!(matches!(cmd_rx.recv().await, Some(ConnCommand::Touch(_))));
        assert!(matches!(cmd_rx.recv().await, Some(ConnCommand::Fin(_))));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn requeue_without_backoff_clears_flag() {
        let (msg, mut cmd_rx) = test_message(1);
        msg.requeue_without_backoff(Some(Duration::from_millis(5))).await;
        match cmd_rx.recv().await {
            Some(ConnCommand::Req { delay, backoff, .. }) => {
                assert_eq!(delay, Duration::from_millis(5));
                assert!(!backoff);
            }
            other => panic!("expected REQ, got {other:?}"),
        }
    }
}
