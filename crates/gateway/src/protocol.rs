//! Downstream wire protocol.
//!
//! Every frame in both directions is a JSON object with a `type` field.

use orders::OrderBook;
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server
// ============================================================================

/// Message sent from a peer to the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a channel, e.g. `orderbook.BTC-PERPETUAL`.
    Subscribe { channel: String },
    /// Unsubscribe from a channel.
    Unsubscribe { channel: String },
}

// ============================================================================
// Server → Client
// ============================================================================

/// Message sent from the gateway to a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent once per connection.
    Welcome { message: String },
    /// Subscription confirmed. Sent before any snapshot for the channel.
    Subscribed { channel: String },
    /// Unsubscription confirmed.
    Unsubscribed { channel: String },
    /// Per-peer error reply; the connection stays open.
    Error { message: String },
    /// Book snapshot or update for one instrument.
    Orderbook(BookFrame),
}

/// Payload of an `orderbook` frame: `{instrument_name, timestamp,
/// bids:[[price,size],…], asks:[[price,size],…]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookFrame {
    pub instrument_name: String,
    pub timestamp: u64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl From<&OrderBook> for BookFrame {
    fn from(book: &OrderBook) -> Self {
        Self {
            instrument_name: book.instrument_name.clone(),
            timestamp: book.timestamp,
            bids: book.bids.clone(),
            asks: book.asks.clone(),
        }
    }
}

/// Downstream channel carrying books for `instrument`.
pub fn orderbook_channel(instrument: &str) -> String {
    format!("orderbook.{instrument}")
}

/// The instrument named by an `orderbook.<instrument>` channel.
pub fn orderbook_instrument(channel: &str) -> Option<&str> {
    channel.strip_prefix("orderbook.").filter(|s| !s.is_empty())
}
