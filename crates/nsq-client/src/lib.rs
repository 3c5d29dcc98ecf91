//! Consumer client for nsqd: discovery, flow control, concurrent dispatch.
//!
//! A [`Consumer`] subscribes to one (topic, channel) pair, discovers brokers
//! directly or through nsqlookupd, and drives messages through a pool of
//! [`Handler`] workers with at-least-once semantics. Flow is governed by a
//! global `max_in_flight` budget distributed across connections as RDY
//! grants, backed off exponentially on handler failures.
//!
//! ```no_run
//! use nsq_client::{Config, Consumer, Handler, Message};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!     async fn handle(&self, message: Message) -> anyhow::Result<()> {
//!         println!("{} ({} bytes)", message.id(), message.body().len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut config = Config::default();
//! config.max_in_flight = 16;
//! let consumer = Consumer::new("events", "archive", config)?;
//! consumer.add_handler(Printer, 4)?;
//! consumer.connect_to_nsqlookupd("127.0.0.1:4161").await?;
//! consumer.stopped().await;
//! # Ok(())
//! # }
//! ```
mod config;
mod conn;
mod consumer;
mod counters;
mod error;
mod message;
mod wire;

#[cfg(test)]
mod tests;

pub use config::{Config, TlsMinVersion};
pub use consumer::{Consumer, Handler};
pub use counters::Stats;
pub use error::{ClientError, Result};
pub use message::Message;
pub use nsq_wire::MessageId;
