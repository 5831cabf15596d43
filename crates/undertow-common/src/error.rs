use thiserror::Error;

use undertow_protocol::CodecError;

/// Errors raised while opening a logical connection to the server
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Multiplexed session error: {0}")]
    Session(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpeedLimitError {
    #[error("Invalid speed limit: {0:?}. Use a number with an optional b/kb/mb/gb suffix")]
    Invalid(String),

    #[error("Speed limit overflows: {0:?}")]
    Overflow(String),
}
