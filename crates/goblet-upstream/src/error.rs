//! Upstream failure taxonomy.

use thiserror::Error;

/// Classified upstream failures.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection, DNS, or TLS failure.
    #[error("upstream network error: {0}")]
    Network(String),

    /// A per-operation deadline elapsed (connect, idle read, or total).
    #[error("upstream timeout: {0}")]
    Timeout(String),

    /// Upstream rejected our credentials (401/403).
    #[error("upstream auth error: HTTP {0}")]
    Auth(u16),

    /// Upstream returned a non-success status.
    #[error("upstream status: HTTP {0}")]
    Status(u16),

    /// Upstream spoke the protocol incorrectly or signaled a fatal error.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// HTTP status carried by the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth(code) | Self::Status(code) => Some(*code),
            _ => None,
        }
    }

    /// Transient failures are worth one more attempt; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Status(code) => *code >= 500,
            _ => false,
        }
    }

    /// Metric label for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Auth(_) => "auth",
            Self::Status(_) => "status",
            Self::Protocol(_) => "protocol",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<goblet_protocol::ProtocolError> for UpstreamError {
    fn from(err: goblet_protocol::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;
