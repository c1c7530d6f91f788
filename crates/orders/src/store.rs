//! Thread-safe caches for open orders, positions, and books.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use deribit::ApiClient;
use latency::LatencyRegistry;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::models::{is_open_status, Order, OrderBook, OrderDirection, OrderType, Position, TimeInForce};

/// Book depth requested on a cache miss.
pub const DEFAULT_BOOK_DEPTH: u32 = 10;

/// Label attached to every order this system places.
const ORDER_LABEL: &str = "deribit-gateway";

/// Order, position, and book caches over the venue session.
///
/// Each cache is its own concurrent map; no operation takes two caches at
/// once. The open-order cache holds exactly the orders whose last-known
/// status is `open` or `untriggered`.
pub struct OrderStore {
    api: Arc<ApiClient>,
    latency: Arc<LatencyRegistry>,
    open_orders: DashMap<String, Order>,
    positions: DashMap<String, Position>,
    books: DashMap<String, OrderBook>,
}

impl OrderStore {
    pub fn new(api: Arc<ApiClient>, latency: Arc<LatencyRegistry>) -> Self {
        Self {
            api,
            latency,
            open_orders: DashMap::new(),
            positions: DashMap::new(),
            books: DashMap::new(),
        }
    }

    /// Submit an order. Returns the venue order id, or an empty string on
    /// precondition violation or venue failure — the cache is untouched in
    /// both cases.
    pub async fn place_order(
        &self,
        instrument_name: &str,
        order_type: OrderType,
        direction: OrderDirection,
        amount: f64,
        price: f64,
        time_in_force: TimeInForce,
    ) -> String {
        let tracker = self.latency.tracker("place_order");
        let _timer = tracker.timer();

        if instrument_name.is_empty() {
            warn!("place_order: instrument name cannot be empty");
            return String::new();
        }
        if amount <= 0.0 {
            warn!(amount, "place_order: amount must be positive");
            return String::new();
        }
        if order_type.has_price() && price <= 0.0 {
            warn!(price, "place_order: price must be positive for limit orders");
            return String::new();
        }

        let mut params = json!({
            "instrument_name": instrument_name,
            "amount": amount,
            "type": order_type.as_str(),
            "side": direction.as_str(),
            "label": ORDER_LABEL,
        });
        if order_type.has_price() {
            params["price"] = json!(price);
            params["time_in_force"] = json!(time_in_force.as_str());
        }

        // The venue routes both sides through private/buy, discriminated by
        // the `side` field.
        let response = self.api.private_request("private/buy", params).await;
        if !response.success {
            warn!(
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "place_order failed"
            );
            return String::new();
        }

        let order = &response.result()["order"];
        let Some(order_id) = order.get("order_id").and_then(Value::as_str) else {
            warn!("place_order: reply carried no order_id");
            return String::new();
        };
        let created_at = order
            .get("creation_timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let order = Order {
            order_id: order_id.to_string(),
            instrument_name: instrument_name.to_string(),
            order_type,
            direction,
            price,
            amount,
            time_in_force,
            status: "open".to_string(),
            created_at,
            last_updated_at: created_at,
        };
        debug!(order_id = %order.order_id, %instrument_name, "order placed");
        self.open_orders.insert(order.order_id.clone(), order);
        order_id.to_string()
    }

    /// Cancel an order; evicts it from the open-order cache on success.
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        let tracker = self.latency.tracker("cancel_order");
        let _timer = tracker.timer();

        if order_id.is_empty() {
            warn!("cancel_order: order id cannot be empty");
            return false;
        }

        let response = self
            .api
            .private_request("private/cancel", json!({ "order_id": order_id }))
            .await;
        if !response.success {
            warn!(
                %order_id,
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "cancel_order failed"
            );
            return false;
        }
        self.open_orders.remove(order_id);
        debug!(%order_id, "order cancelled");
        true
    }

    /// Amend an order's amount and/or price. At least one of the two must
    /// be positive; only the provided fields are sent.
    pub async fn modify_order(&self, order_id: &str, amount: f64, price: f64) -> bool {
        let tracker = self.latency.tracker("modify_order");
        let _timer = tracker.timer();

        if order_id.is_empty() {
            warn!("modify_order: order id cannot be empty");
            return false;
        }
        if amount <= 0.0 && price <= 0.0 {
            warn!("modify_order: either amount or price must be specified");
            return false;
        }

        let mut params = json!({ "order_id": order_id });
        if amount > 0.0 {
            params["amount"] = json!(amount);
        }
        if price > 0.0 {
            params["price"] = json!(price);
        }

        let response = self.api.private_request("private/edit", params).await;
        if !response.success {
            warn!(
                %order_id,
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "modify_order failed"
            );
            return false;
        }

        if let Some(mut order) = self.open_orders.get_mut(order_id) {
            if amount > 0.0 {
                order.amount = amount;
            }
            if price > 0.0 {
                order.price = price;
            }
            order.last_updated_at = Utc::now().timestamp_millis();
        }
        true
    }

    /// Book snapshot, default depth. Cache-first: a cached book is returned
    /// unchanged regardless of age; only a miss reaches the venue. The
    /// cache never self-evicts — staleness is refreshed only by push-driven
    /// updates applied through [`apply_book_update`](Self::apply_book_update).
    pub async fn get_orderbook(&self, instrument_name: &str) -> Option<OrderBook> {
        self.get_orderbook_with_depth(instrument_name, DEFAULT_BOOK_DEPTH)
            .await
    }

    pub async fn get_orderbook_with_depth(
        &self,
        instrument_name: &str,
        depth: u32,
    ) -> Option<OrderBook> {
        let tracker = self.latency.tracker("get_orderbook");
        let _timer = tracker.timer();

        if instrument_name.is_empty() {
            warn!("get_orderbook: instrument name cannot be empty");
            return None;
        }
        if depth == 0 {
            warn!("get_orderbook: depth must be positive");
            return None;
        }

        if let Some(book) = self.books.get(instrument_name) {
            return Some(book.clone());
        }

        let response = self
            .api
            .public_request(
                "public/get_order_book",
                json!({ "instrument_name": instrument_name, "depth": depth }),
            )
            .await;
        if !response.success {
            warn!(
                %instrument_name,
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "get_orderbook failed"
            );
            return None;
        }

        let book = OrderBook::from_venue(instrument_name, response.result())?;
        self.books.insert(instrument_name.to_string(), book.clone());
        Some(book)
    }

    /// Fetch all positions and replace the cached entries wholesale.
    pub async fn get_positions(&self) -> Vec<Position> {
        let response = self.api.private_request("private/get_positions", json!({})).await;
        if !response.success {
            warn!(
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "get_positions failed"
            );
            return Vec::new();
        }

        let positions: Vec<Position> = response
            .result()
            .as_array()
            .map(|entries| entries.iter().filter_map(Position::from_venue).collect())
            .unwrap_or_default();
        for position in &positions {
            self.positions
                .insert(position.instrument_name.clone(), position.clone());
        }
        positions
    }

    /// Position for one instrument, cache-first.
    pub async fn get_position(&self, instrument_name: &str) -> Option<Position> {
        if instrument_name.is_empty() {
            warn!("get_position: instrument name cannot be empty");
            return None;
        }
        if let Some(position) = self.positions.get(instrument_name) {
            return Some(position.clone());
        }

        let response = self
            .api
            .private_request(
                "private/get_position",
                json!({ "instrument_name": instrument_name }),
            )
            .await;
        if !response.success {
            warn!(
                %instrument_name,
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "get_position failed"
            );
            return None;
        }

        let position = Position::from_venue(response.result())?;
        self.positions
            .insert(position.instrument_name.clone(), position.clone());
        Some(position)
    }

    /// Fetch open orders from the venue. Only orders still in an open
    /// status are written back into the cache.
    pub async fn get_open_orders(&self) -> Vec<Order> {
        let response = self
            .api
            .private_request("private/get_open_orders_by_currency", json!({}))
            .await;
        if !response.success {
            warn!(
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "get_open_orders failed"
            );
            return Vec::new();
        }

        let orders: Vec<Order> = response
            .result()
            .as_array()
            .map(|entries| entries.iter().filter_map(Order::from_venue).collect())
            .unwrap_or_default();
        for order in &orders {
            if is_open_status(&order.status) {
                self.open_orders.insert(order.order_id.clone(), order.clone());
            }
        }
        orders
    }

    /// One order by id, cache-first; terminal orders are returned but not
    /// cached.
    pub async fn get_order(&self, order_id: &str) -> Option<Order> {
        if order_id.is_empty() {
            warn!("get_order: order id cannot be empty");
            return None;
        }
        if let Some(order) = self.open_orders.get(order_id) {
            return Some(order.clone());
        }

        let response = self
            .api
            .private_request("private/get_order_state", json!({ "order_id": order_id }))
            .await;
        if !response.success {
            warn!(
                %order_id,
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "get_order failed"
            );
            return None;
        }

        let order = Order::from_venue(response.result())?;
        if is_open_status(&order.status) {
            self.open_orders.insert(order.order_id.clone(), order.clone());
        }
        Some(order)
    }

    /// Apply an upstream order push: upsert while the order is open or
    /// untriggered, evict on any terminal status. This is the only path by
    /// which the open-order cache shrinks without an explicit cancel reply.
    pub fn handle_order_update(&self, update: &Value) {
        let Some(order_id) = update.get("order_id").and_then(Value::as_str) else {
            warn!("order update without order_id");
            return;
        };
        let status = update.get("order_state").and_then(Value::as_str).unwrap_or("");

        if is_open_status(status) {
            match Order::from_venue(update) {
                Some(order) => {
                    self.open_orders.insert(order.order_id.clone(), order);
                }
                None => warn!(%order_id, "unparseable order update"),
            }
        } else {
            self.open_orders.remove(order_id);
        }
    }

    /// Apply an upstream position push: wholesale replace.
    pub fn handle_position_update(&self, update: &Value) {
        match Position::from_venue(update) {
            Some(position) => {
                self.positions
                    .insert(position.instrument_name.clone(), position);
            }
            None => warn!("unparseable position update"),
        }
    }

    /// Insert a book into the cache. Callers that want push-refreshed
    /// `get_orderbook` reads route their market-data callback through this.
    pub fn apply_book_update(&self, book: OrderBook) {
        self.books.insert(book.instrument_name.clone(), book);
    }

    /// Cached book, without read-through.
    pub fn cached_book(&self, instrument_name: &str) -> Option<OrderBook> {
        self.books.get(instrument_name).map(|book| book.clone())
    }

    /// Snapshot of the open-order cache.
    pub fn open_orders(&self) -> Vec<Order> {
        self.open_orders.iter().map(|entry| entry.clone()).collect()
    }

    pub fn open_order(&self, order_id: &str) -> Option<Order> {
        self.open_orders.get(order_id).map(|order| order.clone())
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> OrderStore {
        // Nothing listens on port 9; precondition failures must return
        // before any request is attempted.
        let api = Arc::new(ApiClient::with_base_urls(
            "http://127.0.0.1:9",
            "ws://unused",
            "key",
            "secret",
        ));
        OrderStore::new(api, Arc::new(LatencyRegistry::new()))
    }

    fn open_update(order_id: &str, state: &str) -> Value {
        json!({
            "order_id": order_id,
            "instrument_name": "BTC-PERPETUAL",
            "order_type": "limit",
            "direction": "buy",
            "price": 10000.0,
            "amount": 0.1,
            "time_in_force": "good_til_cancelled",
            "order_state": state,
            "creation_timestamp": 1700000000000i64,
            "last_update_timestamp": 1700000000000i64,
        })
    }

    #[tokio::test]
    async fn place_order_rejects_empty_instrument() {
        let store = store();
        let id = store
            .place_order(
                "",
                OrderType::Limit,
                OrderDirection::Buy,
                0.1,
                10000.0,
                TimeInForce::GoodTilCancelled,
            )
            .await;
        assert!(id.is_empty());
        assert_eq!(store.open_order_count(), 0);
    }

    #[tokio::test]
    async fn place_order_rejects_non_positive_amount() {
        let store = store();
        for amount in [0.0, -1.0] {
            let id = store
                .place_order(
                    "BTC-PERPETUAL",
                    OrderType::Market,
                    OrderDirection::Buy,
                    amount,
                    0.0,
                    TimeInForce::GoodTilCancelled,
                )
                .await;
            assert!(id.is_empty());
        }
        assert_eq!(store.open_order_count(), 0);
    }

    #[tokio::test]
    async fn place_order_rejects_limit_without_price() {
        let store = store();
        let id = store
            .place_order(
                "BTC-PERPETUAL",
                OrderType::Limit,
                OrderDirection::Buy,
                0.1,
                0.0,
                TimeInForce::GoodTilCancelled,
            )
            .await;
        assert!(id.is_empty());
        assert_eq!(store.open_order_count(), 0);
    }

    #[tokio::test]
    async fn modify_order_requires_amount_or_price() {
        let store = store();
        assert!(!store.modify_order("ETH-1", 0.0, 0.0).await);
        assert!(!store.modify_order("", 0.2, 0.0).await);
    }

    #[tokio::test]
    async fn cancel_order_requires_id() {
        let store = store();
        assert!(!store.cancel_order("").await);
    }

    #[tokio::test]
    async fn get_orderbook_rejects_bad_arguments() {
        let store = store();
        assert!(store.get_orderbook("").await.is_none());
        assert!(store
            .get_orderbook_with_depth("BTC-PERPETUAL", 0)
            .await
            .is_none());
    }

    #[test]
    fn order_update_upserts_open_and_evicts_terminal() {
        let store = store();

        store.handle_order_update(&open_update("ETH-1", "open"));
        store.handle_order_update(&open_update("ETH-2", "untriggered"));
        assert_eq!(store.open_order_count(), 2);

        store.handle_order_update(&open_update("ETH-1", "filled"));
        assert_eq!(store.open_order_count(), 1);
        assert!(store.open_order("ETH-1").is_none());

        store.handle_order_update(&open_update("ETH-2", "cancelled"));
        assert_eq!(store.open_order_count(), 0);
    }

    #[test]
    fn open_order_cache_holds_only_open_statuses() {
        let store = store();
        for (id, state) in [
            ("A", "open"),
            ("B", "filled"),
            ("C", "untriggered"),
            ("D", "rejected"),
            ("E", "cancelled"),
        ] {
            store.handle_order_update(&open_update(id, state));
        }
        let orders = store.open_orders();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| is_open_status(&o.status)));
    }

    #[test]
    fn position_update_replaces_wholesale() {
        let store = store();
        store.handle_position_update(&json!({
            "instrument_name": "BTC-PERPETUAL",
            "size": 100.0,
            "average_price": 50000.0,
            "mark_price": 50100.0,
            "estimated_liquidation_price": 40000.0,
            "floating_profit_loss": 0.5,
            "realized_profit_loss": 0.0,
        }));
        store.handle_position_update(&json!({
            "instrument_name": "BTC-PERPETUAL",
            "size": -25.0,
            "average_price": 51000.0,
            "mark_price": 50900.0,
            "estimated_liquidation_price": 60000.0,
            "floating_profit_loss": -0.1,
            "realized_profit_loss": 0.2,
        }));

        let positions: Vec<Position> =
            store.positions.iter().map(|entry| entry.clone()).collect();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, -25.0);
        assert_eq!(positions[0].entry_price, 51000.0);
    }

    #[test]
    fn book_updates_replace_cached_snapshot() {
        let store = store();
        store.apply_book_update(OrderBook {
            instrument_name: "BTC-PERPETUAL".into(),
            bids: vec![(10000.0, 1.0)],
            asks: vec![(10100.0, 1.0)],
            timestamp: 1,
        });
        store.apply_book_update(OrderBook {
            instrument_name: "BTC-PERPETUAL".into(),
            bids: vec![(10050.0, 2.0)],
            asks: vec![(10150.0, 2.0)],
            timestamp: 2,
        });

        let book = store.cached_book("BTC-PERPETUAL").unwrap();
        assert_eq!(book.timestamp, 2);
        assert_eq!(book.best_bid(), Some((10050.0, 2.0)));
    }
}
