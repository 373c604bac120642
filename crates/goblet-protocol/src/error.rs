//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while parsing or producing protocol traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid pkt-line framing.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Request violates the v2 protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown v2 command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The client asked for an object the mirror does not serve.
    #[error("not our ref: {0}")]
    NotOurRef(String),

    /// Fatal message received on the error sideband.
    #[error("remote error: {0}")]
    Remote(String),

    /// Mirror-level failure while materializing a response.
    #[error(transparent)]
    Mirror(#[from] goblet_mirror::MirrorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
