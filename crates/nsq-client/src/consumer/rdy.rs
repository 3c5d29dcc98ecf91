//! Flow control: RDY distribution, backoff, and periodic redistribution.
//!
//! # Purpose
//! One task per consumer owns the control plane of message flow. It divides
//! the global `max_in_flight` budget across live connections, runs the
//! shared backoff counter, schedules the post-backoff test probe, and
//! periodically rotates RDY when connections outnumber the budget.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::conn::{ConnEvent, Connection};
use crate::consumer::ConsumerInner;

/// Jitter fraction added on top of each backoff penalty.
const BACKOFF_JITTER: f64 = 0.25;

#[derive(Debug, Default)]
pub(crate) struct BackoffState {
    /// Shared failure counter; > 0 gates all RDY updates.
    pub(crate) counter: u32,
}

/// The per-connection share of the global budget.
///
/// Zero budget pauses consumption entirely; otherwise every connection is
/// guaranteed at least RDY 1 so none is permanently starved.
pub(crate) fn per_conn_budget(max_in_flight: i64, connections: usize) -> i64 {
    if max_in_flight <= 0 {
        return 0;
    }
    let connections = connections.max(1) as i64;
    (max_in_flight / connections).clamp(1, max_in_flight)
}

/// Highest backoff level; deeper failures stop lengthening the penalty.
pub(crate) fn max_backoff_level(max_backoff: Duration) -> u32 {
    let seconds = max_backoff.as_secs_f64().max(1.0);
    (seconds.log2().ceil() as u32).max(1)
}

fn penalty(counter: u32, multiplier: Duration, max_backoff: Duration, rng: &mut StdRng) -> Duration {
    let base = multiplier.mul_f64(2f64.powi(counter as i32));
    let jitter = multiplier.mul_f64(rng.random::<f64>() * BACKOFF_JITTER);
    (base + jitter).min(max_backoff)
}

impl ConsumerInner {
    pub(crate) fn per_conn_max_in_flight(&self) -> i64 {
        per_conn_budget(
            self.max_in_flight.load(Ordering::SeqCst),
            self.conn_count.load(Ordering::SeqCst),
        )
    }

    pub(crate) fn in_backoff(&self) -> bool {
        self.backoff.lock().expect("backoff lock").counter > 0
    }

    pub(crate) fn penalty_duration(&self, rng: &mut StdRng) -> Duration {
        let counter = self.backoff.lock().expect("backoff lock").counter;
        penalty(
            counter,
            self.config.backoff_multiplier,
            self.config.max_backoff_duration,
            rng,
        )
    }

    /// Applies the steady-state refresh rule to one connection.
    ///
    /// A no-op while backing off or closing. Otherwise the grant is
    /// refreshed when the previous one is nearly consumed: none left, less
    /// than a quarter remaining, or the target dropped below the remainder.
    pub(crate) async fn maybe_update_rdy(&self, conn: &Arc<Connection>) {
        if self.in_backoff() {
            debug!(nsqd = %conn.addr(), "rdy update skipped during backoff");
            return;
        }
        let count = self.per_conn_max_in_flight();
        let remain = conn.rdy_count();
        let last = conn.last_rdy();
        if remain <= 1 || remain < last / 4 || (count > 0 && count < remain) {
            self.update_rdy(conn, count).await;
        }
    }

    /// Sends an RDY grant clamped by the server's advertised ceiling.
    pub(crate) async fn update_rdy(&self, conn: &Arc<Connection>, count: i64) {
        if conn.is_closing() {
            return;
        }
        conn.set_rdy(count.min(conn.max_rdy())).await;
    }

    /// Refreshes every connection; called whenever the connection count or
    /// the global budget changes.
    pub(crate) async fn update_rdy_all(&self) {
        for conn in self.connections_snapshot() {
            self.maybe_update_rdy(&conn).await;
        }
    }

    async fn zero_rdy_all(&self) {
        for conn in self.connections_snapshot() {
            self.update_rdy(&conn, 0).await;
        }
    }

    async fn resume_rdy_all(&self) {
        let count = self.per_conn_max_in_flight();
        for conn in self.connections_snapshot() {
            self.update_rdy(&conn, count).await;
        }
    }

    /// Folds a success or failure into the shared backoff counter.
    ///
    /// Returns the penalty to schedule when the consumer is (still) backing
    /// off, or `None` once flow is restored.
    pub(crate) async fn handle_backoff_event(
        &self,
        failure: bool,
        rng: &mut StdRng,
    ) -> Option<Duration> {
        let max_level = max_backoff_level(self.config.max_backoff_duration);
        let (was, now) = {
            let mut state = self.backoff.lock().expect("backoff lock");
            let was = state.counter;
            if failure {
                state.counter = (state.counter + 1).min(max_level);
            } else {
                if state.counter == 0 {
                    return None;
                }
                state.counter -= 1;
            }
            (was, state.counter)
        };
        if now == 0 {
            if was > 0 {
                info!(consumer_id = self.id, "exiting backoff");
                self.resume_rdy_all().await;
            }
            return None;
        }
        let duration = penalty(
            now,
            self.config.backoff_multiplier,
            self.config.max_backoff_duration,
            rng,
        );
        warn!(
            consumer_id = self.id,
            counter = now,
            penalty = ?duration,
            "backing off"
        );
        self.zero_rdy_all().await;
        Some(duration)
    }

    /// Grants RDY 1 to one random connection to sample whether failures
    /// have subsided. Returns a retry delay when no connection is usable.
    pub(crate) async fn send_probe(&self, rng: &mut StdRng) -> Option<Duration> {
        if !self.in_backoff() {
            return None;
        }
        let candidates: Vec<Arc<Connection>> = self
            .connections_snapshot()
            .into_iter()
            .filter(|conn| !conn.is_closing())
            .collect();
        if candidates.is_empty() {
            return Some(self.penalty_duration(rng));
        }
        let choice = &candidates[rng.random_range(0..candidates.len())];
        info!(consumer_id = self.id, nsqd = %choice.addr(), "backoff test probe");
        choice.set_rdy(1).await;
        None
    }

    /// Rotates RDY when connections outnumber the budget or sit idle.
    ///
    /// Without this, whichever connections won the initial grants would hold
    /// the whole budget forever once `connections > max_in_flight`.
    pub(crate) async fn redistribute_rdy(&self, rng: &mut StdRng) {
        if self.in_backoff() {
            return;
        }
        let conns = self.connections_snapshot();
        if conns.is_empty() {
            return;
        }
        let max_in_flight = self.max_in_flight.load(Ordering::SeqCst);
        let idle_timeout = self.config.low_rdy_idle_timeout;
        let over_budget = conns.len() as i64 > max_in_flight;
        // Idle rotation only makes sense with someone to rotate to; a lone
        // connection keeps its grant.
        let any_idle = conns.len() > 1
            && conns
                .iter()
                .any(|c| c.last_rdy() > 0 && c.last_message_elapsed() > idle_timeout);
        if !over_budget && !any_idle {
            return;
        }
        for conn in &conns {
            if conn.last_rdy() > 0 && conn.last_message_elapsed() > idle_timeout {
                debug!(nsqd = %conn.addr(), "idle connection, reclaiming RDY");
                self.update_rdy(conn, 0).await;
            }
        }
        let total: i64 = conns.iter().map(|c| c.last_rdy()).sum();
        let mut available = max_in_flight - total;
        let mut candidates: Vec<Arc<Connection>> = conns
            .iter()
            .filter(|c| c.last_rdy() == 0 && !c.is_closing())
            .cloned()
            .collect();
        while available > 0 && !candidates.is_empty() {
            let idx = rng.random_range(0..candidates.len());
            let conn = candidates.swap_remove(idx);
            debug!(nsqd = %conn.addr(), "redistributing RDY");
            self.update_rdy(&conn, 1).await;
            available -= 1;
        }
    }
}

pub(crate) async fn run_rdy_loop(
    inner: Arc<ConsumerInner>,
    mut events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    mut exit_rx: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_os_rng();
    let interval = inner.config.rdy_redistribute_interval;
    let mut redistribute =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    redistribute.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let backoff_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(backoff_timer);
    let mut timer_armed = false;

    loop {
        tokio::select! {
            _ = exit_rx.changed() => break,
            _ = &mut backoff_timer, if timer_armed => {
                timer_armed = false;
                if let Some(retry) = inner.send_probe(&mut rng).await {
                    backoff_timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + retry);
                    timer_armed = true;
                }
            }
            _ = redistribute.tick() => {
                inner.redistribute_rdy(&mut rng).await;
            }
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnEvent::Received { addr } => {
                        if let Some(conn) = inner.connection(&addr) {
                            inner.maybe_update_rdy(&conn).await;
                        }
                    }
                    ConnEvent::Backoff { addr } => {
                        debug!(nsqd = %addr, "backoff signal");
                        timer_armed = schedule_backoff(
                            &inner, true, &mut rng, backoff_timer.as_mut(),
                        ).await;
                    }
                    ConnEvent::Resume { addr } => {
                        debug!(nsqd = %addr, "resume signal");
                        timer_armed = schedule_backoff(
                            &inner, false, &mut rng, backoff_timer.as_mut(),
                        ).await;
                    }
                    ConnEvent::Heartbeat { addr } => {
                        debug!(nsqd = %addr, "heartbeat");
                    }
                    ConnEvent::Closed { addr } => {
                        inner.handle_conn_closed(&addr).await;
                        // If the probe target died, schedule a fresh probe.
                        if inner.in_backoff() && !timer_armed {
                            let retry = inner.penalty_duration(&mut rng);
                            backoff_timer
                                .as_mut()
                                .reset(tokio::time::Instant::now() + retry);
                            timer_armed = true;
                        }
                    }
                    ConnEvent::MaxInFlightChanged => {
                        inner.update_rdy_all().await;
                    }
                }
            }
        }
    }
    debug!(consumer_id = inner.id, "rdy loop exited");
}

async fn schedule_backoff(
    inner: &Arc<ConsumerInner>,
    failure: bool,
    rng: &mut StdRng,
    timer: std::pin::Pin<&mut tokio::time::Sleep>,
) -> bool {
    match inner.handle_backoff_event(failure, rng).await {
        Some(duration) => {
            timer.reset(tokio::time::Instant::now() + duration);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_divides_evenly() {
        assert_eq!(per_conn_budget(10, 2), 5);
        assert_eq!(per_conn_budget(10, 3), 3);
        assert_eq!(per_conn_budget(9, 10), 1);
    }

    #[test]
    fn budget_floors_at_one_per_connection() {
        assert_eq!(per_conn_budget(1, 3), 1);
        assert_eq!(per_conn_budget(2, 100), 1);
    }

    #[test]
    fn zero_budget_pauses_flow() {
        assert_eq!(per_conn_budget(0, 3), 0);
    }

    #[test]
    fn budget_with_no_connections_is_whole() {
        assert_eq!(per_conn_budget(10, 0), 10);
    }

    #[test]
    fn backoff_level_scales_with_duration() {
        assert_eq!(max_backoff_level(Duration::from_secs(120)), 7);
        assert_eq!(max_backoff_level(Duration::from_secs(2)), 1);
        assert_eq!(max_backoff_level(Duration::from_millis(100)), 1);
    }

    #[test]
    fn penalty_is_exponential_and_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        let multiplier = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        let p1 = penalty(1, multiplier, max, &mut rng);
        assert!(p1 >= Duration::from_millis(200));
        assert!(p1 <= Duration::from_millis(225));
        let p3 = penalty(3, multiplier, max, &mut rng);
        assert!(p3 >= Duration::from_millis(800));
        assert!(p3 <= Duration::from_millis(825));
        assert_eq!(penalty(10, multiplier, max, &mut rng), max);
    }
}
