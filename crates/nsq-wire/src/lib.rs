// Wire format for the nsqd TCP protocol: frames, commands, message payloads.
pub mod command;
pub mod frame;
pub mod identify;
pub mod message;

pub use command::{Command, is_valid_name};
pub use frame::{FRAME_HEADER_LEN, Frame, FrameType, MAGIC_V2};
pub use identify::{AuthResponse, IdentifyBody, IdentifyResponse};
pub use message::{MSG_HEADER_LEN, MSG_ID_LEN, MessageId, WireMessage};

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),
    #[error("frame too large: {size} bytes (cap {cap})")]
    FrameTooLarge { size: usize, cap: usize },
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame size {0} smaller than the type field")]
    ShortFrame(usize),
    #[error("invalid topic or channel name: {0:?}")]
    InvalidName(String),
    #[error("message payload too short: {0} bytes")]
    ShortMessage(usize),
}

/// Error codes that make the connection unusable.
///
/// Anything outside this list, per-message failures and unknown codes
/// alike, leaves the connection up.
pub fn is_fatal_error(code: &str) -> bool {
    matches!(code, "E_INVALID" | "E_BAD_TOPIC" | "E_BAD_CHANNEL" | "E_AUTH_FAILED")
}

/// Extracts the leading error code token from an error frame payload.
pub fn error_code(payload: &[u8]) -> &str {
    let text = std::str::from_utf8(payload).unwrap_or("");
    text.split_whitespace().next().unwrap_or("")
}
