// Consumer-wide message counters and their public snapshot.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) messages_received: AtomicU64,
    pub(crate) messages_finished: AtomicU64,
    pub(crate) messages_requeued: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self, connections: usize) -> Stats {
        Stats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_finished: self.messages_finished.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            connections,
        }
    }
}

/// Point-in-time view of a consumer's message flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub connections: usize,
}
