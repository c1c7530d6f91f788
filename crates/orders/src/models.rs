//! Domain model and venue-JSON parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Order kinds accepted by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::StopMarket => "stop_market",
            OrderType::StopLimit => "stop_limit",
        }
    }

    pub fn from_venue_str(s: &str) -> Option<Self> {
        match s {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop_market" => Some(OrderType::StopMarket),
            "stop_limit" => Some(OrderType::StopLimit),
            _ => None,
        }
    }

    /// Whether this kind carries a limit price.
    pub fn has_price(&self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    Buy,
    Sell,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Buy => "buy",
            OrderDirection::Sell => "sell",
        }
    }

    pub fn from_venue_str(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(OrderDirection::Buy),
            "sell" => Some(OrderDirection::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-in-force policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    GoodTilCancelled,
    FillOrKill,
    ImmediateOrCancel,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::GoodTilCancelled => "good_til_cancelled",
            TimeInForce::FillOrKill => "fill_or_kill",
            TimeInForce::ImmediateOrCancel => "immediate_or_cancel",
        }
    }

    pub fn from_venue_str(s: &str) -> Option<Self> {
        match s {
            "good_til_cancelled" => Some(TimeInForce::GoodTilCancelled),
            "fill_or_kill" => Some(TimeInForce::FillOrKill),
            "immediate_or_cancel" => Some(TimeInForce::ImmediateOrCancel),
            _ => None,
        }
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order statuses the open-order cache retains.
pub(crate) fn is_open_status(status: &str) -> bool {
    status == "open" || status == "untriggered"
}

/// One order as tracked locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub instrument_name: String,
    pub order_type: OrderType,
    pub direction: OrderDirection,
    pub price: f64,
    pub amount: f64,
    pub time_in_force: TimeInForce,
    pub status: String,
    /// Venue creation timestamp, epoch milliseconds.
    pub created_at: i64,
    pub last_updated_at: i64,
}

impl Order {
    /// Parse the venue's order object (reply `result` or push payload).
    pub fn from_venue(v: &Value) -> Option<Self> {
        let order_id = v.get("order_id")?.as_str()?.to_string();
        let instrument_name = v.get("instrument_name")?.as_str()?.to_string();
        let order_type = v
            .get("order_type")
            .and_then(Value::as_str)
            .and_then(OrderType::from_venue_str)
            .unwrap_or(OrderType::Limit);
        let direction = v
            .get("direction")
            .and_then(Value::as_str)
            .and_then(OrderDirection::from_venue_str)?;
        let time_in_force = v
            .get("time_in_force")
            .and_then(Value::as_str)
            .and_then(TimeInForce::from_venue_str)
            .unwrap_or(TimeInForce::GoodTilCancelled);
        let created_at = v
            .get("creation_timestamp")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Some(Self {
            order_id,
            instrument_name,
            order_type,
            direction,
            price: v.get("price").and_then(Value::as_f64).unwrap_or(0.0),
            amount: v.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
            time_in_force,
            status: v
                .get("order_state")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            created_at,
            last_updated_at: v
                .get("last_update_timestamp")
                .and_then(Value::as_i64)
                .unwrap_or(created_at),
        })
    }
}

/// One position, replaced wholesale on every refresh or push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument_name: String,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liquidation_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

impl Position {
    /// Parse the venue's position object.
    pub fn from_venue(v: &Value) -> Option<Self> {
        let f = |key: &str| v.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        Some(Self {
            instrument_name: v.get("instrument_name")?.as_str()?.to_string(),
            size: f("size"),
            entry_price: f("average_price"),
            mark_price: f("mark_price"),
            liquidation_price: f("estimated_liquidation_price"),
            unrealized_pnl: f("floating_profit_loss"),
            realized_pnl: f("realized_profit_loss"),
        })
    }
}

/// Snapshot of one instrument's book. Bids descending, asks ascending, ties
/// in upstream order; replaced wholesale per update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub instrument_name: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    /// Venue timestamp, epoch milliseconds.
    pub timestamp: u64,
}

impl OrderBook {
    /// Parse a venue book object — either a `public/get_order_book` result
    /// or a `book.<instrument>.100ms` push payload. `instrument` is the
    /// fallback when the object does not name one.
    pub fn from_venue(instrument: &str, v: &Value) -> Option<Self> {
        let bids = parse_levels(v.get("bids"));
        let asks = parse_levels(v.get("asks"));
        if bids.is_empty() && asks.is_empty() && v.get("bids").is_none() && v.get("asks").is_none()
        {
            return None;
        }
        let instrument_name = v
            .get("instrument_name")
            .and_then(Value::as_str)
            .unwrap_or(instrument)
            .to_string();
        Some(Self {
            instrument_name,
            bids,
            asks,
            timestamp: parse_timestamp(v.get("timestamp")),
        })
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.first().copied()
    }
}

/// `[[price, size], …]` level arrays. Malformed entries are skipped.
fn parse_levels(v: Option<&Value>) -> Vec<(f64, f64)> {
    v.and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    let level = level.as_array()?;
                    let price = level.first()?.as_f64()?;
                    let size = level.get(1)?.as_f64()?;
                    Some((price, size))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Venue timestamps arrive as a JSON number or a numeric string depending
/// on the path; accept both.
fn parse_timestamp(v: Option<&Value>) -> u64 {
    match v {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enum_venue_strings_round_trip() {
        for (t, s) in [
            (OrderType::Market, "market"),
            (OrderType::Limit, "limit"),
            (OrderType::StopMarket, "stop_market"),
            (OrderType::StopLimit, "stop_limit"),
        ] {
            assert_eq!(t.as_str(), s);
            assert_eq!(OrderType::from_venue_str(s), Some(t));
        }
        assert_eq!(OrderDirection::from_venue_str("buy"), Some(OrderDirection::Buy));
        assert_eq!(OrderDirection::from_venue_str("sell"), Some(OrderDirection::Sell));
        assert_eq!(
            TimeInForce::from_venue_str("good_til_cancelled"),
            Some(TimeInForce::GoodTilCancelled)
        );
        assert_eq!(
            TimeInForce::from_venue_str("fill_or_kill"),
            Some(TimeInForce::FillOrKill)
        );
        assert_eq!(
            TimeInForce::from_venue_str("immediate_or_cancel"),
            Some(TimeInForce::ImmediateOrCancel)
        );
        assert_eq!(OrderType::from_venue_str("trigger"), None);
    }

    #[test]
    fn order_parses_venue_object() {
        let order = Order::from_venue(&json!({
            "order_id": "ETH-584849853",
            "instrument_name": "BTC-PERPETUAL",
            "order_type": "limit",
            "direction": "buy",
            "price": 10000.0,
            "amount": 0.1,
            "time_in_force": "good_til_cancelled",
            "order_state": "open",
            "creation_timestamp": 1700000000000i64,
            "last_update_timestamp": 1700000000100i64,
        }))
        .unwrap();
        assert_eq!(order.order_id, "ETH-584849853");
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.direction, OrderDirection::Buy);
        assert_eq!(order.status, "open");
        assert_eq!(order.created_at, 1700000000000);
        assert_eq!(order.last_updated_at, 1700000000100);
    }

    #[test]
    fn order_requires_id_and_instrument() {
        assert!(Order::from_venue(&json!({"instrument_name": "BTC-PERPETUAL"})).is_none());
        assert!(Order::from_venue(&json!({"order_id": "x", "direction": "buy"})).is_none());
    }

    #[test]
    fn position_maps_venue_field_names() {
        let position = Position::from_venue(&json!({
            "instrument_name": "BTC-PERPETUAL",
            "size": 100.0,
            "average_price": 50000.0,
            "mark_price": 50100.0,
            "estimated_liquidation_price": 40000.0,
            "floating_profit_loss": 0.002,
            "realized_profit_loss": -0.001,
        }))
        .unwrap();
        assert_eq!(position.entry_price, 50000.0);
        assert_eq!(position.liquidation_price, 40000.0);
        assert_eq!(position.unrealized_pnl, 0.002);
        assert_eq!(position.realized_pnl, -0.001);
    }

    #[test]
    fn book_parses_levels_and_numeric_timestamp() {
        let book = OrderBook::from_venue(
            "BTC-PERPETUAL",
            &json!({
                "timestamp": 1700000000000u64,
                "bids": [[10000.0, 1.0], [9999.5, 2.0]],
                "asks": [[10100.0, 1.5]],
            }),
        )
        .unwrap();
        assert_eq!(book.instrument_name, "BTC-PERPETUAL");
        assert_eq!(book.timestamp, 1700000000000);
        assert_eq!(book.best_bid(), Some((10000.0, 1.0)));
        assert_eq!(book.best_ask(), Some((10100.0, 1.5)));
    }

    #[test]
    fn book_accepts_string_timestamp_and_named_instrument() {
        let book = OrderBook::from_venue(
            "fallback",
            &json!({
                "instrument_name": "ETH-PERPETUAL",
                "timestamp": "1",
                "bids": [[2000.0, 3.0]],
                "asks": [],
            }),
        )
        .unwrap();
        assert_eq!(book.instrument_name, "ETH-PERPETUAL");
        assert_eq!(book.timestamp, 1);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn book_skips_malformed_levels() {
        let book = OrderBook::from_venue(
            "BTC-PERPETUAL",
            &json!({
                "timestamp": 5,
                "bids": [[10000.0, 1.0], ["new"], 42],
                "asks": [["10100", 1.0]],
            }),
        )
        .unwrap();
        assert_eq!(book.bids, vec![(10000.0, 1.0)]);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn payload_without_book_shape_is_rejected() {
        assert!(OrderBook::from_venue("BTC-PERPETUAL", &json!({"foo": 1})).is_none());
    }
}
