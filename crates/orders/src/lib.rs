//! Order, position, and order-book state for the trading system.
//!
//! [`OrderStore`] wraps the venue session with three independent caches:
//! open orders keyed by order id, positions and books keyed by instrument.
//! Reads are cache-first with venue read-through on miss; upstream push
//! events flow in through [`OrderStore::handle_order_update`] and
//! [`OrderStore::handle_position_update`]. Every read returns an owned
//! snapshot, never a view into the cache.

pub mod models;
pub mod store;

pub use models::{Order, OrderBook, OrderDirection, OrderType, Position, TimeInForce};
pub use store::OrderStore;
