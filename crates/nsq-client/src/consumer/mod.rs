//! The consumer: endpoint management, handler workers, lifecycle.
//!
//! # Purpose
//! Aggregates the per-connection machinery behind one public API. Owns the
//! incoming message queue, the handler worker pool, the connection maps,
//! and the background discovery and flow-control tasks.
//!
//! # Design notes
//! Connections report back through an event channel rather than holding a
//! reference to the consumer, so ownership stays a strict tree: consumer →
//! connections → tasks. All map mutation happens under one RwLock with no
//! awaits while it is held.
pub(crate) mod lookup;
pub(crate) mod rdy;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conn::{ConnContext, ConnEvent, Connection};
use crate::counters::{Counters, Stats};
use crate::error::{ClientError, Result};
use crate::message::Message;

/// Labels consumers in log output; never reused within a process.
static CONSUMER_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// A connection is starved when its in-flight count presses against its
/// last RDY grant.
const STARVED_PCT: i64 = 85;

/// Message processing callback.
///
/// Returning `Ok` finishes the message, `Err` requeues it with backoff
/// accounting, unless [`Message::disable_auto_response`] was called.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Called once when a message exhausts `max_attempts`, right before it
    /// is finished and dropped.
    fn on_giving_up(&self, message: &Message) {
        let _ = message;
    }
}

/// A consumer of one (topic, channel) pair across many nsqd connections.
///
/// Handlers must be added before the first connect call. `Consumer` is
/// cheaply cloneable; all clones drive the same subscription.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.inner.topic)
            .field("channel", &self.inner.channel)
            .finish()
    }
}

pub(crate) struct ConsumerInner {
    pub(crate) id: usize,
    pub(crate) topic: String,
    pub(crate) channel: String,
    pub(crate) config: Arc<Config>,
    pub(crate) max_in_flight: AtomicI64,
    pub(crate) conn_map: RwLock<ConnMap>,
    pub(crate) conn_count: AtomicUsize,
    pub(crate) lookupd: Mutex<LookupdState>,
    pub(crate) backoff: Mutex<rdy::BackoffState>,
    pub(crate) counters: Arc<Counters>,
    incoming_tx: Mutex<Option<mpsc::Sender<Message>>>,
    incoming_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    pub(crate) events_tx: mpsc::UnboundedSender<ConnEvent>,
    exit_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    stop_flag: AtomicBool,
    connected_flag: AtomicBool,
    handler_count: AtomicUsize,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) lookup_recheck: Notify,
    conns_drained: Notify,
}

#[derive(Default)]
pub(crate) struct ConnMap {
    conns: HashMap<String, Arc<Connection>>,
    /// Addresses with a handshake in progress; disjoint from `conns`.
    pending: HashSet<String>,
    /// Pending addresses whose disconnect was requested mid-handshake.
    doomed: HashSet<String>,
    /// Every address ever connected to; drives direct reconnects when no
    /// lookupds are configured.
    nsqd_addrs: Vec<String>,
}

#[derive(Default)]
pub(crate) struct LookupdState {
    endpoints: Vec<String>,
    query_index: usize,
    poller_started: bool,
}

impl Consumer {
    /// Validates names and config, freezes the config, and spawns the
    /// flow-control task. No network activity until the first connect.
    pub fn new(topic: impl Into<String>, channel: impl Into<String>, config: Config) -> Result<Self> {
        let topic = topic.into();
        let channel = channel.into();
        if !nsq_wire::is_valid_name(&topic) {
            return Err(ClientError::InvalidName(topic));
        }
        if !nsq_wire::is_valid_name(&channel) {
            return Err(ClientError::InvalidName(channel));
        }
        config.validate()?;
        let config = Arc::new(config);
        let id = CONSUMER_INSTANCES.fetch_add(1, Ordering::Relaxed) + 1;

        let queue_depth = config.max_in_flight.max(1);
        let (incoming_tx, incoming_rx) = mpsc::channel(queue_depth);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);

        let inner = Arc::new(ConsumerInner {
            id,
            topic,
            channel,
            max_in_flight: AtomicI64::new(config.max_in_flight as i64),
            config,
            conn_map: RwLock::new(ConnMap::default()),
            conn_count: AtomicUsize::new(0),
            lookupd: Mutex::new(LookupdState::default()),
            backoff: Mutex::new(rdy::BackoffState::default()),
            counters: Arc::new(Counters::default()),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
            events_tx,
            exit_tx,
            stopped_tx,
            stop_flag: AtomicBool::new(false),
            connected_flag: AtomicBool::new(false),
            handler_count: AtomicUsize::new(0),
            worker_handles: Mutex::new(Vec::new()),
            task_handles: Mutex::new(Vec::new()),
            lookup_recheck: Notify::new(),
            conns_drained: Notify::new(),
        });
        let rdy_task = tokio::spawn(rdy::run_rdy_loop(Arc::clone(&inner), events_rx, exit_rx));
        inner.track_task(rdy_task);
        info!(
            consumer_id = id,
            topic = %inner.topic,
            channel = %inner.channel,
            "consumer created"
        );
        Ok(Self { inner })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Spawns `concurrency` workers running `handler` against the shared
    /// incoming queue. Must be called before any connect.
    pub fn add_handler<H: Handler>(&self, handler: H, concurrency: usize) -> Result<()> {
        if self.inner.stop_flag.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        if self.inner.connected_flag.load(Ordering::SeqCst) {
            return Err(ClientError::HandlersAfterConnect);
        }
        let concurrency = concurrency.max(1);
        let handler = Arc::new(handler);
        let mut handles = self.inner.worker_handles.lock().expect("worker handles lock");
        for _ in 0..concurrency {
            handles.push(tokio::spawn(run_handler_worker(
                Arc::clone(&self.inner),
                Arc::clone(&handler),
            )));
        }
        self.inner.handler_count.fetch_add(concurrency, Ordering::SeqCst);
        Ok(())
    }

    /// Connects directly to one nsqd.
    pub async fn connect_to_nsqd(&self, addr: impl Into<String>) -> Result<()> {
        self.inner.connect_to_nsqd(addr.into()).await
    }

    /// Connects directly to several nsqds; fails on the first error.
    pub async fn connect_to_nsqds(&self, addrs: impl IntoIterator<Item = impl Into<String>>) -> Result<()> {
        for addr in addrs {
            self.inner.connect_to_nsqd(addr.into()).await?;
        }
        Ok(())
    }

    /// Registers a lookupd endpoint and starts the discovery poller on the
    /// first one. Duplicate endpoints are ignored.
    pub async fn connect_to_nsqlookupd(&self, endpoint: impl Into<String>) -> Result<()> {
        self.inner.connect_to_lookupd(endpoint.into())
    }

    pub async fn connect_to_nsqlookupds(
        &self,
        endpoints: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        for endpoint in endpoints {
            self.inner.connect_to_lookupd(endpoint.into())?;
        }
        Ok(())
    }

    /// Closes the connection to `addr` and stops reconnecting to it.
    pub async fn disconnect_from_nsqd(&self, addr: &str) -> Result<()> {
        self.inner.disconnect_from_nsqd(addr).await
    }

    /// Removes a lookupd endpoint; the last one cannot be removed while
    /// the poller is running.
    pub async fn disconnect_from_nsqlookupd(&self, endpoint: &str) -> Result<()> {
        self.inner.disconnect_from_lookupd(endpoint)
    }

    /// Updates the global in-flight budget and refreshes every connection.
    pub fn change_max_in_flight(&self, max_in_flight: usize) {
        self.inner
            .max_in_flight
            .store(max_in_flight as i64, Ordering::SeqCst);
        let _ = self.inner.events_tx.send(ConnEvent::MaxInFlightChanged);
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn stats(&self) -> Stats {
        self.inner
            .counters
            .snapshot(self.inner.conn_count.load(Ordering::SeqCst))
    }

    /// True when some connection's in-flight count presses against its RDY
    /// grant, i.e. raising `max_in_flight` would likely increase throughput.
    pub fn is_starved(&self) -> bool {
        let map = self.inner.conn_map.read().expect("conn map lock");
        map.conns.values().any(|conn| {
            let in_flight = conn.in_flight();
            let threshold = conn.last_rdy() * STARVED_PCT / 100;
            in_flight >= threshold && in_flight > 0 && !conn.is_closing()
        })
    }

    /// Begins shutdown: CLS every connection, drain in-flight messages,
    /// stop workers and background tasks. Idempotent; completion is
    /// observable through [`Consumer::stopped`].
    pub fn stop(&self) {
        if self.inner.stop_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(consumer_id = self.inner.id, "stopping");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            for conn in inner.connections_snapshot() {
                conn.close().await;
            }
            let deadline = tokio::time::Instant::now() + 2 * inner.config.msg_timeout;
            loop {
                let drained = inner.conns_drained.notified();
                if inner.live_endpoint_count() == 0 {
                    break;
                }
                tokio::select! {
                    _ = drained => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(
                            consumer_id = inner.id,
                            "connections did not drain in time; forcing shutdown"
                        );
                        for conn in inner.connections_snapshot() {
                            conn.trigger_shutdown();
                        }
                        break;
                    }
                }
            }
            inner.finish_stop().await;
        });
    }

    /// Resolves once shutdown has fully completed: all connections closed,
    /// all handler workers joined.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stopped_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl ConsumerInner {
    fn track_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().expect("task handles lock").push(handle);
    }

    pub(crate) fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        let map = self.conn_map.read().expect("conn map lock");
        map.conns.values().cloned().collect()
    }

    pub(crate) fn connection(&self, addr: &str) -> Option<Arc<Connection>> {
        let map = self.conn_map.read().expect("conn map lock");
        map.conns.get(addr).cloned()
    }

    fn live_endpoint_count(&self) -> usize {
        let map = self.conn_map.read().expect("conn map lock");
        map.conns.len() + map.pending.len()
    }

    pub(crate) async fn connect_to_nsqd(self: &Arc<Self>, addr: String) -> Result<()> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        if self.handler_count.load(Ordering::SeqCst) == 0 {
            return Err(ClientError::NoHandlers);
        }
        self.connected_flag.store(true, Ordering::SeqCst);
        let incoming_tx = self
            .incoming_tx
            .lock()
            .expect("incoming_tx lock")
            .clone()
            .ok_or(ClientError::Stopped)?;
        {
            let mut map = self.conn_map.write().expect("conn map lock");
            if map.conns.contains_key(&addr) || map.pending.contains(&addr) {
                return Err(ClientError::AlreadyConnected);
            }
            map.pending.insert(addr.clone());
            if !map.nsqd_addrs.contains(&addr) {
                map.nsqd_addrs.push(addr.clone());
            }
        }

        let ctx = ConnContext {
            consumer_id: self.id,
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            config: Arc::clone(&self.config),
            incoming_tx,
            events_tx: self.events_tx.clone(),
            counters: Arc::clone(&self.counters),
        };
        let conn = match Connection::connect(addr.clone(), ctx).await {
            Ok(conn) => conn,
            Err(err) => {
                let mut map = self.conn_map.write().expect("conn map lock");
                map.pending.remove(&addr);
                map.doomed.remove(&addr);
                return Err(err);
            }
        };

        let (doomed, count) = {
            let mut map = self.conn_map.write().expect("conn map lock");
            map.pending.remove(&addr);
            let doomed = map.doomed.remove(&addr) || self.stop_flag.load(Ordering::SeqCst);
            if !doomed {
                map.conns.insert(addr.clone(), Arc::clone(&conn));
            }
            let count = map.conns.len();
            self.conn_count.store(count, Ordering::SeqCst);
            (doomed, count)
        };
        if doomed {
            debug!(nsqd = %addr, "connection no longer wanted; closing");
            conn.close().await;
            return Err(ClientError::NotConnected);
        }
        metrics::gauge!("nsq_consumer_connections").set(count as f64);
        self.update_rdy_all().await;
        Ok(())
    }

    async fn disconnect_from_nsqd(&self, addr: &str) -> Result<()> {
        let conn = {
            let mut map = self.conn_map.write().expect("conn map lock");
            map.nsqd_addrs.retain(|known| known != addr);
            if let Some(conn) = map.conns.get(addr) {
                Some(Arc::clone(conn))
            } else if map.pending.contains(addr) {
                map.doomed.insert(addr.to_string());
                None
            } else {
                return Err(ClientError::NotConnected);
            }
        };
        if let Some(conn) = conn {
            info!(nsqd = %addr, "disconnecting");
            conn.close().await;
        }
        Ok(())
    }

    fn connect_to_lookupd(self: &Arc<Self>, endpoint: String) -> Result<()> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Err(ClientError::Stopped);
        }
        if self.handler_count.load(Ordering::SeqCst) == 0 {
            return Err(ClientError::NoHandlers);
        }
        self.connected_flag.store(true, Ordering::SeqCst);
        let endpoint = normalize_lookupd_endpoint(&endpoint)?;
        let start_poller = {
            let mut state = self.lookupd.lock().expect("lookupd lock");
            if state.endpoints.contains(&endpoint) {
                debug!(endpoint = %endpoint, "lookupd endpoint already registered");
                return Ok(());
            }
            state.endpoints.push(endpoint.clone());
            if state.poller_started {
                false
            } else {
                state.poller_started = true;
                true
            }
        };
        info!(consumer_id = self.id, endpoint = %endpoint, "lookupd endpoint added");
        if start_poller {
            let handle = tokio::spawn(lookup::run_lookup_loop(
                Arc::clone(self),
                self.exit_tx.subscribe(),
            ));
            self.track_task(handle);
        }
        Ok(())
    }

    fn disconnect_from_lookupd(&self, endpoint: &str) -> Result<()> {
        let endpoint = normalize_lookupd_endpoint(endpoint)?;
        let mut state = self.lookupd.lock().expect("lookupd lock");
        let Some(index) = state.endpoints.iter().position(|known| *known == endpoint) else {
            return Err(ClientError::NotConnected);
        };
        if state.endpoints.len() == 1 && state.poller_started {
            return Err(ClientError::LastLookupd);
        }
        state.endpoints.remove(index);
        Ok(())
    }

    pub(crate) fn next_lookupd_endpoint(&self) -> Option<String> {
        let mut state = self.lookupd.lock().expect("lookupd lock");
        if state.endpoints.is_empty() {
            return None;
        }
        let index = state.query_index % state.endpoints.len();
        state.query_index = state.query_index.wrapping_add(1);
        Some(state.endpoints[index].clone())
    }

    /// Removes a dead connection and decides how to get it back: lookupds
    /// re-discover, direct endpoints reconnect on the poll cadence.
    pub(crate) async fn handle_conn_closed(self: &Arc<Self>, addr: &str) {
        let (removed, live, is_direct) = {
            let mut map = self.conn_map.write().expect("conn map lock");
            let removed = map.conns.remove(addr).is_some();
            let count = map.conns.len();
            self.conn_count.store(count, Ordering::SeqCst);
            let is_direct = map.nsqd_addrs.iter().any(|known| known == addr);
            (removed, count + map.pending.len(), is_direct)
        };
        if !removed {
            return;
        }
        info!(consumer_id = self.id, nsqd = %addr, "connection closed");
        metrics::gauge!("nsq_consumer_connections")
            .set(self.conn_count.load(Ordering::SeqCst) as f64);
        if live == 0 {
            self.conns_drained.notify_waiters();
        }
        if self.stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let has_lookupds = !self.lookupd.lock().expect("lookupd lock").endpoints.is_empty();
        if has_lookupds {
            self.lookup_recheck.notify_one();
        } else if is_direct {
            self.spawn_reconnect(addr.to_string());
        }
        self.update_rdy_all().await;
    }

    /// Retries a direct nsqd endpoint on the lookupd poll cadence until it
    /// comes back, is disconnected, or the consumer stops.
    fn spawn_reconnect(self: &Arc<Self>, addr: String) {
        let inner = Arc::clone(self);
        let delay = self.config.lookupd_poll_interval;
        tokio::spawn(async move {
            let mut exit_rx = inner.exit_tx.subscribe();
            loop {
                tokio::select! {
                    _ = exit_rx.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if inner.stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                let still_wanted = inner
                    .conn_map
                    .read()
                    .expect("conn map lock")
                    .nsqd_addrs
                    .iter()
                    .any(|known| *known == addr);
                if !still_wanted {
                    return;
                }
                match inner.connect_to_nsqd(addr.clone()).await {
                    Ok(()) | Err(ClientError::AlreadyConnected) | Err(ClientError::Stopped) => {
                        return;
                    }
                    Err(err) => {
                        warn!(nsqd = %addr, error = %err, "reconnect failed; will retry");
                    }
                }
            }
        });
    }

    async fn finish_stop(&self) {
        let _ = self.exit_tx.send(true);
        // Dropping the consumer's sender closes the incoming queue once the
        // last read loop is gone; workers drain what is left and exit.
        self.incoming_tx.lock().expect("incoming_tx lock").take();
        let workers = std::mem::take(&mut *self.worker_handles.lock().expect("worker handles lock"));
        for handle in workers {
            let _ = handle.await;
        }
        // Background tasks can be mid-handshake; bound the wait and abort
        // whatever is left.
        let tasks = std::mem::take(&mut *self.task_handles.lock().expect("task handles lock"));
        for mut handle in tasks {
            if tokio::time::timeout(2 * self.config.msg_timeout, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        let _ = self.stopped_tx.send(true);
        info!(consumer_id = self.id, "stopped");
    }
}

async fn run_handler_worker<H: Handler>(inner: Arc<ConsumerInner>, handler: Arc<H>) {
    loop {
        let message = {
            let mut rx = inner.incoming_rx.lock().await;
            rx.recv().await
        };
        let Some(message) = message else { break };
        let max_attempts = inner.config.max_attempts;
        if max_attempts > 0 && message.attempts() > max_attempts {
            warn!(
                consumer_id = inner.id,
                id = %message.id(),
                attempts = message.attempts(),
                "giving up after max attempts"
            );
            handler.on_giving_up(&message);
            message.finish().await;
            continue;
        }
        match handler.handle(message.clone()).await {
            Ok(()) => {
                if !message.is_auto_response_disabled() {
                    message.finish().await;
                }
            }
            Err(err) => {
                warn!(
                    consumer_id = inner.id,
                    id = %message.id(),
                    attempts = message.attempts(),
                    error = %err,
                    "handler failed"
                );
                if !message.is_auto_response_disabled() {
                    message.requeue(None).await;
                }
            }
        }
    }
    debug!(consumer_id = inner.id, "handler worker exited");
}

fn normalize_lookupd_endpoint(endpoint: &str) -> Result<String> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ClientError::Config("empty lookupd endpoint".into()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("http://{trimmed}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookupd_endpoints_are_normalized() {
        assert_eq!(
            normalize_lookupd_endpoint("127.0.0.1:4161").expect("normalize"),
            "http://127.0.0.1:4161"
        );
        assert_eq!(
            normalize_lookupd_endpoint("http://lookupd:4161/").expect("normalize"),
            "http://lookupd:4161"
        );
        assert_eq!(
            normalize_lookupd_endpoint("https://lookupd:4161").expect("normalize"),
            "https://lookupd:4161"
        );
        assert!(normalize_lookupd_endpoint("  ").is_err());
    }
}
