//! Periodic nsqlookupd polling: discover producers for the subscribed topic.
//!
//! Failure mode philosophy follows the rest of the client: lookupd queries
//! are best-effort, logged and retried on the next tick; only consumer
//! shutdown stops the loop.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::consumer::ConsumerInner;
use crate::error::ClientError;

const LOOKUPD_ACCEPT: &str = "application/vnd.nsq; version=1.0";
const LOOKUPD_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Poll loop: jittered start, then one query per tick or recheck signal.
///
/// The initial sleep is randomized over `poll_interval × poll_jitter` so a
/// fleet of consumers restarting together does not stampede lookupd.
pub(crate) async fn run_lookup_loop(inner: Arc<ConsumerInner>, mut exit_rx: watch::Receiver<bool>) {
    let mut rng = StdRng::from_os_rng();
    let config = Arc::clone(&inner.config);
    let client = match reqwest::Client::builder()
        .timeout(LOOKUPD_REQUEST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "failed to build lookupd http client");
            return;
        }
    };

    let jitter = config
        .lookupd_poll_interval
        .mul_f64(config.lookupd_poll_jitter * rng.random::<f64>());
    tokio::select! {
        _ = exit_rx.changed() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    let interval = config.lookupd_poll_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        query_lookupd(&inner, &client).await;
        tokio::select! {
            _ = exit_rx.changed() => break,
            _ = ticker.tick() => {}
            _ = inner.lookup_recheck.notified() => {
                debug!(consumer_id = inner.id, "lookupd recheck triggered");
            }
        }
    }
    debug!(consumer_id = inner.id, "lookup loop exited");
}

/// One round: query the next endpoint, connect to any new producers.
async fn query_lookupd(inner: &Arc<ConsumerInner>, client: &reqwest::Client) {
    let Some(endpoint) = inner.next_lookupd_endpoint() else {
        return;
    };
    let url = format!("{endpoint}/lookup");
    debug!(consumer_id = inner.id, url = %url, topic = %inner.topic, "querying lookupd");
    let result = client
        .get(&url)
        .query(&[("topic", inner.topic.as_str())])
        .header(reqwest::header::ACCEPT, LOOKUPD_ACCEPT)
        .send()
        .await
        .and_then(|response| response.error_for_status());
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(endpoint = %endpoint, error = %err, "lookupd query failed");
            return;
        }
    };
    let parsed: LookupResponse = match response.json().await {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(endpoint = %endpoint, error = %err, "unparseable lookupd response");
            return;
        }
    };
    for producer in parsed.producers {
        let addr = format!("{}:{}", producer.broadcast_address, producer.tcp_port);
        match inner.connect_to_nsqd(addr.clone()).await {
            Ok(()) => {}
            Err(ClientError::AlreadyConnected) => {}
            Err(ClientError::Stopped) => return,
            Err(err) => {
                warn!(nsqd = %addr, error = %err, "connect to discovered producer failed");
            }
        }
    }
}
