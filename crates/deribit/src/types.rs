//! Venue-facing value types.

use std::time::Instant;

use serde_json::Value;

/// Outcome of one JSON-RPC request.
///
/// Success means the venue's reply body carried no `error` member; `data` is
/// then the raw response object (envelope included). Transport failures and
/// venue error replies both land here as `success = false` with a message —
/// requests never panic or abort the session.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Value,
    pub error_message: Option<String>,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error_message: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error_message: Some(message.into()),
        }
    }

    /// The `result` member of the reply, or `Null` when absent.
    pub fn result(&self) -> &Value {
        self.data.get("result").unwrap_or(&Value::Null)
    }
}

/// Bearer-token state held after a successful credentials or refresh grant.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Instant,
}

/// Instrument families served by `public/get_instruments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    Spot,
    Future,
    Option,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Spot => "spot",
            InstrumentKind::Future => "future",
            InstrumentKind::Option => "option",
        }
    }
}
