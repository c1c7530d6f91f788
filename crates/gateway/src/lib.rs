//! Local distribution gateway for per-instrument book snapshots.
//!
//! Accepts WebSocket connections from any local peer, tracks per-channel
//! subscriptions, and fans each upstream book update out to exactly the
//! peers subscribed to `orderbook.<instrument>`.
//!
//! ## Architecture
//!
//! ```text
//! upstream push (dispatch worker)
//!         ↓
//! BookRouter::handle_orderbook_update
//!         ↓
//! ClientRegistry (DashMap double index)
//!         ↓
//! WebSocket peers
//! ```
//!
//! ## Low-latency design
//!
//! - Lock-free client registry using DashMap
//! - Messages serialized once per fan-out, not once per peer
//! - Unbounded per-peer channels so a slow peer never blocks the fan-out

pub mod client;
pub mod error;
pub mod protocol;
pub mod router;
pub mod ws_server;

pub use client::{ClientId, ClientRegistry, ClientState};
pub use error::{GatewayError, Result};
pub use protocol::{BookFrame, ClientMessage, ServerMessage};
pub use router::BookRouter;
pub use ws_server::{create_router, serve, AppState};
