//! Session error types.

use thiserror::Error;

/// Errors surfaced by the venue session.
///
/// Request-shaped failures (transport, venue error replies) are carried as
/// values inside [`crate::ApiResponse`] instead; this enum covers the
/// control-plane operations that return `Result`.
#[derive(Debug, Error)]
pub enum DeribitError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("token refresh failed")]
    RefreshFailed,

    #[error("WebSocket not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, DeribitError>;
