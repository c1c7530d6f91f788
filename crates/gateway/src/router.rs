//! Book fan-out and snapshot-on-subscribe.

use std::sync::Arc;

use latency::LatencyRegistry;
use orders::{OrderBook, OrderStore};
use tracing::{debug, warn};

use crate::client::{ClientRegistry, ClientState};
use crate::error::Result;
use crate::protocol::{orderbook_channel, BookFrame, ServerMessage};

/// Routes book updates to subscribed peers and serves the initial snapshot
/// when a peer joins an `orderbook.<instrument>` channel.
pub struct BookRouter {
    registry: Arc<ClientRegistry>,
    store: Arc<OrderStore>,
    latency: Arc<LatencyRegistry>,
}

impl BookRouter {
    pub fn new(
        registry: Arc<ClientRegistry>,
        store: Arc<OrderStore>,
        latency: Arc<LatencyRegistry>,
    ) -> Self {
        Self {
            registry,
            store,
            latency,
        }
    }

    /// One-shot snapshot for a fresh subscriber, read through the store
    /// (cached book, or one venue call on a cold cache). A missing book is
    /// logged and skipped; the subscription itself stays valid.
    pub async fn send_snapshot(&self, client: &Arc<ClientState>, instrument: &str) -> Result<()> {
        let Some(book) = self.store.get_orderbook(instrument).await else {
            warn!(%instrument, "no book available for initial snapshot");
            return Ok(());
        };
        client.send(&ServerMessage::Orderbook(BookFrame::from(&book)))?;
        metrics::counter!("gateway_snapshots_sent_total").increment(1);
        Ok(())
    }

    /// Serialize `book` into an `orderbook` frame and fan it out to the
    /// peers subscribed to `orderbook.<instrument>`.
    pub fn handle_orderbook_update(&self, instrument: &str, book: &OrderBook) {
        let tracker = self.latency.tracker("handle_orderbook_update");
        let _timer = tracker.timer();

        let channel = orderbook_channel(instrument);
        debug!(%channel, bids = book.bids.len(), asks = book.asks.len(), "routing book update");
        self.registry
            .broadcast_to_channel(&channel, &ServerMessage::Orderbook(BookFrame::from(book)));
    }
}
