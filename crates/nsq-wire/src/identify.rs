// IDENTIFY negotiation documents exchanged during the handshake.
use serde::{Deserialize, Serialize};

/// Client capabilities sent as the IDENTIFY body.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyBody {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    /// Always true: we expect a JSON feature document back, not a bare OK.
    pub feature_negotiation: bool,
    /// Requested heartbeat period in milliseconds.
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    /// Output buffer flush interval in milliseconds.
    pub output_buffer_timeout: i64,
    /// Requested per-message visibility timeout in milliseconds.
    pub msg_timeout: i64,
    /// Deliver only this percentage of messages (0 disables sampling).
    pub sample_rate: i32,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
}

/// Server feature document returned for a negotiated IDENTIFY.
///
/// Old brokers that predate feature negotiation answer with a bare `OK`;
/// callers should fall back to [`IdentifyResponse::default`] in that case.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: i64,
    /// Negotiated heartbeat period in milliseconds; <= 0 disables heartbeats.
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    /// Negotiated per-message visibility timeout in milliseconds.
    pub msg_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub auth_required: bool,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            // Matches the broker's stock --max-rdy-count.
            max_rdy_count: 2500,
            heartbeat_interval: 0,
            output_buffer_size: 0,
            output_buffer_timeout: 0,
            msg_timeout: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 0,
            snappy: false,
            sample_rate: 0,
            auth_required: false,
        }
    }
}

/// Response to an AUTH command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub identity: String,
    pub identity_url: String,
    pub permission_count: i64,
}
