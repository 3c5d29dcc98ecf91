// Consumer configuration: defaults, environment overrides, validation.
use std::time::Duration;

use crate::error::{ClientError, Result};

pub(crate) const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(90);
pub(crate) const DEFAULT_MAX_REQUEUE_DELAY: Duration = Duration::from_secs(15 * 60);
pub(crate) const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2 * 60);
pub(crate) const DEFAULT_BACKOFF_MULTIPLIER: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_LOOKUPD_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_RDY_REDISTRIBUTE_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_LOW_RDY_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard safety cap for any single frame.
///
/// The frame reader allocates a buffer sized by the on-wire length word;
/// the cap bounds what a buggy or hostile peer can make us allocate.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Minimum TLS protocol version offered during the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMinVersion {
    Tls12,
    Tls13,
}

/// Consumer configuration.
///
/// Built with [`Config::default`], optionally adjusted, then validated and
/// frozen when handed to a consumer. Every field has a working default.
#[derive(Debug, Clone)]
pub struct Config {
    pub dial_timeout: Duration,
    /// Requested server heartbeat period; must fit twice into `read_timeout`.
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Per-message visibility timeout requested from the broker; also bounds
    /// how long a closing connection waits for in-flight acks.
    pub msg_timeout: Duration,
    /// Global budget of unacknowledged messages across all connections.
    pub max_in_flight: usize,
    /// Deliveries after which a message is given up on; 0 means unlimited.
    pub max_attempts: u16,
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    pub max_backoff_duration: Duration,
    pub backoff_multiplier: Duration,
    pub lookupd_poll_interval: Duration,
    /// Fraction of the poll interval randomized into the first poll delay.
    pub lookupd_poll_jitter: f64,
    pub rdy_redistribute_interval: Duration,
    pub low_rdy_idle_timeout: Duration,
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub tls_v1: bool,
    pub tls_insecure_skip_verify: bool,
    pub tls_min_version: TlsMinVersion,
    pub deflate: bool,
    /// DEFLATE level 1..=9.
    pub deflate_level: u32,
    pub snappy: bool,
    pub auth_secret: Option<String>,
    /// Percentage of messages the broker should deliver, 0..=99; 0 disables.
    pub sample_rate: u8,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let client_id = hostname
            .split('.')
            .next()
            .unwrap_or(hostname.as_str())
            .to_string();
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            msg_timeout: DEFAULT_MSG_TIMEOUT,
            max_in_flight: 1,
            max_attempts: 5,
            default_requeue_delay: DEFAULT_REQUEUE_DELAY,
            max_requeue_delay: DEFAULT_MAX_REQUEUE_DELAY,
            max_backoff_duration: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            lookupd_poll_interval: DEFAULT_LOOKUPD_POLL_INTERVAL,
            lookupd_poll_jitter: 0.3,
            rdy_redistribute_interval: DEFAULT_RDY_REDISTRIBUTE_INTERVAL,
            low_rdy_idle_timeout: DEFAULT_LOW_RDY_IDLE_TIMEOUT,
            client_id,
            hostname,
            user_agent: concat!("nsq-client/", env!("CARGO_PKG_VERSION")).to_string(),
            tls_v1: false,
            tls_insecure_skip_verify: false,
            tls_min_version: TlsMinVersion::Tls12,
            deflate: false,
            deflate_level: 6,
            snappy: false,
            auth_secret: None,
            sample_rate: 0,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Config {
    /// Defaults with a handful of environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("NSQ_MAX_IN_FLIGHT") {
            config.max_in_flight = value;
        }
        if let Some(value) = read_u64_env("NSQ_LOOKUPD_POLL_INTERVAL_SECS") {
            config.lookupd_poll_interval = Duration::from_secs(value);
        }
        if let Some(value) = read_u64_env("NSQ_MSG_TIMEOUT_SECS") {
            config.msg_timeout = Duration::from_secs(value);
        }
        if let Some(value) = read_bool_env("NSQ_TLS_V1") {
            config.tls_v1 = value;
        }
        if let Some(value) = read_bool_env("NSQ_TLS_INSECURE_SKIP_VERIFY") {
            config.tls_insecure_skip_verify = value;
        }
        if let Some(value) = read_bool_env("NSQ_SNAPPY") {
            config.snappy = value;
        }
        if let Some(value) = read_bool_env("NSQ_DEFLATE") {
            config.deflate = value;
        }
        if let Ok(value) = std::env::var("NSQ_AUTH_SECRET") {
            if !value.is_empty() {
                config.auth_secret = Some(value);
            }
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.deflate && self.snappy {
            return Err(ClientError::Config(
                "deflate and snappy are mutually exclusive".into(),
            ));
        }
        if self.deflate && !(1..=9).contains(&self.deflate_level) {
            return Err(ClientError::Config(format!(
                "deflate_level {} outside 1..=9",
                self.deflate_level
            )));
        }
        if self.sample_rate > 99 {
            return Err(ClientError::Config(format!(
                "sample_rate {} outside 0..=99",
                self.sample_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.lookupd_poll_jitter) {
            return Err(ClientError::Config(format!(
                "lookupd_poll_jitter {} outside 0..=1",
                self.lookupd_poll_jitter
            )));
        }
        if self.backoff_multiplier.is_zero() {
            return Err(ClientError::Config("backoff_multiplier must be > 0".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ClientError::Config("heartbeat_interval must be > 0".into()));
        }
        // The read deadline doubles as the heartbeat watchdog: a connection
        // that misses two heartbeats in a row must trip it.
        if self.read_timeout < 2 * self.heartbeat_interval {
            return Err(ClientError::Config(format!(
                "read_timeout {:?} must be at least twice heartbeat_interval {:?}",
                self.read_timeout, self.heartbeat_interval
            )));
        }
        if self.msg_timeout.is_zero() {
            return Err(ClientError::Config("msg_timeout must be > 0".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ClientError::Config("max_frame_bytes must be > 0".into()));
        }
        Ok(())
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults");
    }

    #[test]
    fn rejects_conflicting_compression() {
        let mut config = Config::default();
        config.deflate = true;
        config.snappy = true;
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let mut config = Config::default();
        config.sample_rate = 100;
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_short_read_timeout() {
        let mut config = Config::default();
        config.read_timeout = Duration::from_secs(10);
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn rejects_bad_deflate_level() {
        let mut config = Config::default();
        config.deflate = true;
        config.deflate_level = 12;
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn max_in_flight_zero_is_allowed() {
        let mut config = Config::default();
        config.max_in_flight = 0;
        config.validate().expect("zero budget pauses consumption");
    }
}
