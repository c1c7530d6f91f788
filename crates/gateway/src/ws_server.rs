//! WebSocket server handler using Axum.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::client::{ClientRegistry, ClientState};
use crate::error::Result;
use crate::protocol::{orderbook_instrument, ClientMessage, ServerMessage};
use crate::router::BookRouter;

const WELCOME_MESSAGE: &str = "Welcome to the Deribit market data gateway";

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub router: Arc<BookRouter>,
}

/// Create the HTTP router: WebSocket upgrade plus a health probe.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Run the gateway on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.registry.health_json()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Drive one peer connection: register, greet, then serve frames until the
/// peer goes away.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let client = Arc::new(ClientState::new(tx));
    let client_id = state.registry.register(client.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    // Forward queued messages to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = client.send(&ServerMessage::Welcome {
        message: WELCOME_MESSAGE.to_string(),
    }) {
        warn!(client = %client_id, error = %e, "failed to send welcome");
    }

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.reset();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&state, &client, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if client.tx.send(Message::Pong(data)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = %client_id, error = %e, "socket error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if client.tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    state.registry.unregister(&client_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);
}

/// Parse and act on one inbound text frame. Anything unparseable gets a
/// per-peer error reply; the connection and its subscriptions are left
/// alone.
async fn handle_text(state: &Arc<AppState>, client: &Arc<ClientState>, text: &str) {
    let request: ClientMessage = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            let _ = client.send(&ServerMessage::Error {
                message: format!("Invalid JSON: {e}"),
            });
            return;
        }
    };

    match request {
        ClientMessage::Subscribe { channel } => {
            if let Err(e) = state.registry.subscribe(&client.id, &channel) {
                let _ = client.send(&ServerMessage::Error {
                    message: format!("Failed to subscribe to channel: {e}"),
                });
                return;
            }
            // Confirmation goes out before any snapshot for the channel.
            let _ = client.send(&ServerMessage::Subscribed {
                channel: channel.clone(),
            });
            counter!("gateway_subscriptions_total").increment(1);

            if let Some(instrument) = orderbook_instrument(&channel) {
                if let Err(e) = state.router.send_snapshot(client, instrument).await {
                    warn!(client = %client.id, %instrument, error = %e, "snapshot send failed");
                }
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            if let Err(e) = state.registry.unsubscribe(&client.id, &channel) {
                let _ = client.send(&ServerMessage::Error {
                    message: format!("Failed to unsubscribe from channel: {e}"),
                });
                return;
            }
            let _ = client.send(&ServerMessage::Unsubscribed { channel });
        }
    }
}
