use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuickshareError>;

#[derive(Error, Debug)]
pub enum QuickshareError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Offer rejected by peer: {0}")]
    Rejected(String),

    #[error("No handshake response within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("File operation error: {0}")]
    FileOperation(String),
}

impl QuickshareError {
    /// Whether a caller may reasonably retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuickshareError::Connect { .. }
                | QuickshareError::HandshakeTimeout(_)
                | QuickshareError::Network(_)
        )
    }
}

impl From<serde_json::Error> for QuickshareError {
    fn from(err: serde_json::Error) -> Self {
        QuickshareError::Discovery(format!("Malformed announcement: {}", err))
    }
}
