// Error taxonomy for the consumer runtime.
use nsq_wire::WireError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("consumer has been stopped")]
    Stopped,
    #[error("no handlers registered")]
    NoHandlers,
    #[error("handlers must be added before connecting")]
    HandlersAfterConnect,
    #[error("cannot remove the last lookupd endpoint while polling")]
    LastLookupd,
    #[error("invalid topic or channel name: {0:?}")]
    InvalidName(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("identify failed: {reason}")]
    Identify { reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub(crate) fn identify(reason: impl Into<String>) -> Self {
        ClientError::Identify { reason: reason.into() }
    }

    pub(crate) fn timeout(what: &str) -> Self {
        ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            what.to_string(),
        ))
    }
}
