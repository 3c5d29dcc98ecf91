// Test harness subscriber: consumes a (topic, channel) from live brokers.
use anyhow::{Context, Result, bail};
use clap::Parser;
use nsq_client::{Config, Consumer, Handler, Message};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "subscriber")]
#[command(about = "Test harness subscriber for the nsq consumer client")]
struct Args {
    /// nsqd TCP addresses (host:port); repeatable
    #[arg(long = "nsqd")]
    nsqd: Vec<String>,

    /// nsqlookupd HTTP addresses (host:port); repeatable
    #[arg(long = "lookupd")]
    lookupd: Vec<String>,

    /// Topic to subscribe to
    #[arg(long, default_value = "test-topic")]
    topic: String,

    /// Channel to subscribe on
    #[arg(long, default_value = "test-channel")]
    channel: String,

    /// Global in-flight budget
    #[arg(long, default_value = "16")]
    max_in_flight: usize,

    /// Handler worker count
    #[arg(long, default_value = "4")]
    concurrency: usize,

    /// Fail this percentage of messages to exercise backoff (0..=100)
    #[arg(long, default_value = "0")]
    fail_pct: u64,
}

struct LoggingHandler {
    received: AtomicU64,
    fail_pct: u64,
}

impl Handler for LoggingHandler {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let count = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            id = %message.id(),
            attempts = message.attempts(),
            bytes = message.body().len(),
            nsqd = message.nsqd_address(),
            total = count,
            "message"
        );
        if self.fail_pct > 0 && count % 100 < self.fail_pct {
            bail!("induced failure for backoff testing");
        }
        Ok(())
    }

    fn on_giving_up(&self, message: &Message) {
        warn!(id = %message.id(), attempts = message.attempts(), "giving up");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    if args.nsqd.is_empty() && args.lookupd.is_empty() {
        bail!("provide at least one --nsqd or --lookupd address");
    }

    let mut config = Config::from_env();
    config.max_in_flight = args.max_in_flight;
    let consumer = Consumer::new(args.topic.clone(), args.channel.clone(), config)
        .context("create consumer")?;
    consumer.add_handler(
        LoggingHandler {
            received: AtomicU64::new(0),
            fail_pct: args.fail_pct.min(100),
        },
        args.concurrency,
    )?;

    if !args.nsqd.is_empty() {
        consumer
            .connect_to_nsqds(args.nsqd.clone())
            .await
            .context("connect to nsqd")?;
    }
    for endpoint in &args.lookupd {
        consumer
            .connect_to_nsqlookupd(endpoint.clone())
            .await
            .context("connect to lookupd")?;
    }
    info!(
        topic = %args.topic,
        channel = %args.channel,
        max_in_flight = args.max_in_flight,
        "subscribed; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    let stats = consumer.stats();
    info!(
        received = stats.messages_received,
        finished = stats.messages_finished,
        requeued = stats.messages_requeued,
        connections = stats.connections,
        "stopping"
    );
    consumer.stop();
    consumer.stopped().await;
    Ok(())
}
