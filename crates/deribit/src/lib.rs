//! Deribit JSON-RPC v2 session.
//!
//! One [`ApiClient`] owns both transports to the venue:
//!
//! - one-shot HTTPS POSTs of JSON-RPC envelopes to `/api/v2/<method>`
//!   ([`ApiClient::public_request`] / [`ApiClient::private_request`]), with
//!   the bearer-token lifecycle (credentials grant, expiry check, refresh
//!   grant) handled inside `private_request`;
//! - a persistent WebSocket for subscription push
//!   ([`ApiClient::connect_websocket`] / [`ApiClient::subscribe`]).
//!
//! ## Push dispatch
//!
//! The WebSocket I/O task only classifies inbound frames and enqueues
//! subscription notifications on an in-process queue; a dedicated dispatch
//! task drains the queue and invokes the callback registered for the
//! channel. Slow callbacks therefore never stall the socket read loop, and
//! callbacks run with no client lock held.

pub mod client;
pub mod error;
pub mod types;
pub mod ws;

pub use client::ApiClient;
pub use error::{DeribitError, Result};
pub use types::{ApiResponse, Credentials, InstrumentKind};
pub use ws::ChannelCallback;
