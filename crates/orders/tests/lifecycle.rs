//! Order lifecycle and book read-through against an in-process stub venue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use deribit::ApiClient;
use latency::LatencyRegistry;
use orders::{OrderDirection, OrderStore, OrderType, TimeInForce};
use serde_json::{json, Value};

#[derive(Default)]
struct StubVenue {
    book_requests: AtomicU64,
    order_seq: AtomicU64,
}

async fn rpc_handler(
    State(stub): State<Arc<StubVenue>>,
    Path(method): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let params = body.get("params").cloned().unwrap_or(Value::Null);
    let id = body.get("id").cloned().unwrap_or(Value::Null);

    let result = match method.as_str() {
        "public/auth" => json!({
            "access_token": "tok",
            "refresh_token": "ref",
            "expires_in": 900,
        }),
        "private/buy" => {
            let n = stub.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
            json!({
                "order": {
                    "order_id": format!("ETH-{n}"),
                    "creation_timestamp": 1700000000000i64,
                }
            })
        }
        "private/edit" | "private/cancel" => json!({"order": {}}),
        "public/get_order_book" => {
            stub.book_requests.fetch_add(1, Ordering::SeqCst);
            json!({
                "instrument_name": params["instrument_name"],
                "timestamp": 1700000000000u64,
                "bids": [[10000.0, 1.0], [9999.0, 2.0]],
                "asks": [[10100.0, 1.0]],
            })
        }
        _ => json!({}),
    };
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn spawn_store() -> (OrderStore, Arc<StubVenue>) {
    let stub = Arc::new(StubVenue::default());
    let app = Router::new()
        .route("/api/v2/{*method}", post(rpc_handler))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let api = Arc::new(ApiClient::with_base_urls(
        format!("http://{addr}"),
        "ws://unused",
        "key",
        "secret",
    ));
    api.authenticate().await.unwrap();
    (OrderStore::new(api, Arc::new(LatencyRegistry::new())), stub)
}

#[tokio::test]
async fn place_modify_cancel_lifecycle() {
    let (store, _stub) = spawn_store().await;

    let order_id = store
        .place_order(
            "BTC-PERPETUAL",
            OrderType::Limit,
            OrderDirection::Buy,
            0.1,
            10000.0,
            TimeInForce::GoodTilCancelled,
        )
        .await;
    assert_eq!(order_id, "ETH-1");

    let cached = store.open_order(&order_id).unwrap();
    assert_eq!(cached.status, "open");
    assert_eq!(cached.amount, 0.1);
    assert_eq!(cached.price, 10000.0);
    assert_eq!(cached.created_at, 1700000000000);

    assert!(store.modify_order(&order_id, 0.2, 10500.0).await);
    let cached = store.open_order(&order_id).unwrap();
    assert_eq!(cached.amount, 0.2);
    assert_eq!(cached.price, 10500.0);
    assert!(cached.last_updated_at > cached.created_at);

    assert!(store.cancel_order(&order_id).await);
    assert!(store.open_order(&order_id).is_none());
    assert_eq!(store.open_order_count(), 0);
}

#[tokio::test]
async fn modify_with_single_field_patches_only_that_field() {
    let (store, _stub) = spawn_store().await;

    let order_id = store
        .place_order(
            "BTC-PERPETUAL",
            OrderType::Limit,
            OrderDirection::Sell,
            0.5,
            11000.0,
            TimeInForce::ImmediateOrCancel,
        )
        .await;

    assert!(store.modify_order(&order_id, 0.0, 11500.0).await);
    let cached = store.open_order(&order_id).unwrap();
    assert_eq!(cached.amount, 0.5);
    assert_eq!(cached.price, 11500.0);
}

#[tokio::test]
async fn orderbook_read_through_hits_venue_exactly_once() {
    let (store, stub) = spawn_store().await;

    let first = store.get_orderbook("BTC-PERPETUAL").await.unwrap();
    assert_eq!(stub.book_requests.load(Ordering::SeqCst), 1);
    assert_eq!(first.best_bid(), Some((10000.0, 1.0)));
    assert_eq!(first.best_ask(), Some((10100.0, 1.0)));

    // Second read is served from the cache with no upstream call.
    let second = store.get_orderbook("BTC-PERPETUAL").await.unwrap();
    assert_eq!(stub.book_requests.load(Ordering::SeqCst), 1);
    assert_eq!(second.timestamp, first.timestamp);

    // A different instrument misses and fetches.
    store.get_orderbook("ETH-PERPETUAL").await.unwrap();
    assert_eq!(stub.book_requests.load(Ordering::SeqCst), 2);
}
