//! Connected-peer state and the subscription registry.
//!
//! Uses lock-free DashMap indices for high-throughput concurrent access.

use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use latency::LatencyRegistry;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;

/// Unique peer identifier.
pub type ClientId = Uuid;

/// State for a single connected peer. Owned by the registry; never escapes
/// the gateway.
pub struct ClientState {
    /// Unique peer identifier.
    pub id: ClientId,
    /// Channel to the peer's WebSocket write task.
    pub tx: tokio::sync::mpsc::UnboundedSender<Message>,
    /// Channels this peer is subscribed to (inverse index).
    pub subscriptions: DashSet<String>,
    /// Connection timestamp, epoch milliseconds.
    pub connected_at: i64,
}

impl ClientState {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            subscriptions: DashSet::new(),
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Serialize and send one message to this peer.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.send_text(&json)
    }

    pub(crate) fn send_text(&self, json: &str) -> Result<()> {
        self.tx
            .send(Message::Text(json.to_string().into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.subscriptions.iter().map(|c| c.clone()).collect()
    }
}

/// Registry of connected peers with a `channel → peers` forward index and
/// the per-peer channel set as the inverse index. Both indices move
/// together through [`subscribe`](Self::subscribe) /
/// [`unsubscribe`](Self::unsubscribe) / [`unregister`](Self::unregister).
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
    subscriptions: DashMap<String, DashSet<ClientId>>,
    latency: Arc<LatencyRegistry>,
}

impl ClientRegistry {
    pub fn new(latency: Arc<LatencyRegistry>) -> Self {
        Self {
            clients: DashMap::new(),
            subscriptions: DashMap::new(),
            latency,
        }
    }

    /// Register a newly-connected peer.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!(client = %id, "peer connected");
        id
    }

    /// Remove a peer and every subscription it held. Equivalent to
    /// unsubscribing it from all channels and dropping the connection entry.
    pub fn unregister(&self, client_id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(client_id) {
            for channel in client.subscriptions.iter() {
                self.remove_subscriber(&channel, client_id);
            }
            let connected_ms = Utc::now().timestamp_millis() - client.connected_at;
            info!(client = %client_id, connected_ms, "peer disconnected");
        }
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|entry| entry.clone())
    }

    /// Add `client_id` to `channel` in both indices.
    pub fn subscribe(&self, client_id: &ClientId, channel: &str) -> Result<()> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;
        client.subscriptions.insert(channel.to_string());
        self.subscriptions
            .entry(channel.to_string())
            .or_default()
            .insert(*client_id);
        debug!(client = %client_id, %channel, "subscribed");
        Ok(())
    }

    /// Remove `client_id` from `channel` in both indices. Dropping the last
    /// subscriber drops the channel key, restoring the pre-subscribe state.
    pub fn unsubscribe(&self, client_id: &ClientId, channel: &str) -> Result<()> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;
        client.subscriptions.remove(channel);
        self.remove_subscriber(channel, client_id);
        debug!(client = %client_id, %channel, "unsubscribed");
        Ok(())
    }

    fn remove_subscriber(&self, channel: &str, client_id: &ClientId) {
        if let Some(subscribers) = self.subscriptions.get(channel) {
            subscribers.remove(client_id);
        }
        self.subscriptions
            .remove_if(channel, |_, subscribers| subscribers.is_empty());
    }

    /// Peers currently subscribed to `channel` (exact match).
    pub fn subscribers(&self, channel: &str) -> Vec<Arc<ClientState>> {
        match self.subscriptions.get(channel) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.clients.get(&*id).map(|entry| entry.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Send `msg` to every connected peer.
    pub fn broadcast(&self, msg: &ServerMessage) {
        let tracker = self.latency.tracker("broadcast_message");
        let _timer = tracker.timer();

        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast message");
                return;
            }
        };
        let clients: Vec<Arc<ClientState>> =
            self.clients.iter().map(|entry| entry.clone()).collect();
        for client in clients {
            if let Err(e) = client.send_text(&json) {
                debug!(client = %client.id, error = %e, "send failed during broadcast");
            }
        }
    }

    /// Send `msg` to the peers subscribed to `channel`. A channel with no
    /// subscribers is a silent no-op; per-peer send failures never
    /// interrupt the fan-out.
    pub fn broadcast_to_channel(&self, channel: &str, msg: &ServerMessage) {
        let tracker = self.latency.tracker("broadcast_to_channel");
        let _timer = tracker.timer();

        let receivers = self.subscribers(channel);
        if receivers.is_empty() {
            return;
        }
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize channel message");
                return;
            }
        };
        for client in receivers {
            if let Err(e) = client.send_text(&json) {
                debug!(client = %client.id, %channel, error = %e, "send failed during fan-out");
            }
        }
        metrics::counter!("gateway_channel_broadcasts_total").increment(1);
    }

    /// Direct unicast.
    pub fn send(&self, client_id: &ClientId, msg: &ServerMessage) -> Result<()> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;
        client.send(msg)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of channels with at least one subscriber.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// `/health` payload.
    pub(crate) fn health_json(&self) -> String {
        json!({
            "status": "ok",
            "clients": self.client_count(),
            "subscriptions": self.subscription_count(),
        })
        .to_string()
    }
}
