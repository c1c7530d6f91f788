//! Gateway error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer's outbound channel is gone (disconnect in progress).
    #[error("channel send error")]
    ChannelSend,

    /// Operation referenced a client that is no longer registered.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
