//! Persistent WebSocket channel: connection task, demux, dispatch worker.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::client::ApiClient;
use crate::error::{DeribitError, Result};

/// Callback invoked with the `params.data` payload of each push on a
/// subscribed channel. Runs on the dispatch task with no client lock held,
/// so it must be `Send + Sync` and cheap to clone.
pub type ChannelCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Outbound commands accepted by the connection task.
#[derive(Debug)]
pub(crate) enum WsCommand {
    Send(String),
    Close,
}

/// Classified inbound frame.
#[derive(Debug)]
pub(crate) enum InboundFrame {
    /// Subscription push for a channel.
    Notification { channel: String, data: Value },
    /// Reply to a request sent over the socket.
    Response { id: u64 },
    /// Venue-reported error.
    Error { message: String },
    /// Valid JSON with no recognized shape.
    Other,
}

/// Classify one inbound text frame. `None` means the frame was not JSON;
/// the caller drops it and the session continues.
pub(crate) fn route_frame(text: &str) -> Option<InboundFrame> {
    let value: Value = serde_json::from_str(text).ok()?;

    if value.get("method").and_then(Value::as_str) == Some("subscription") {
        let params = value.get("params")?;
        let channel = params.get("channel").and_then(Value::as_str)?;
        return Some(InboundFrame::Notification {
            channel: channel.to_string(),
            data: params.get("data").cloned().unwrap_or(Value::Null),
        });
    }
    if value.get("id").is_some() && value.get("result").is_some() {
        return Some(InboundFrame::Response {
            id: value.get("id").and_then(Value::as_u64).unwrap_or(0),
        });
    }
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Some(InboundFrame::Error {
            message: message.to_string(),
        });
    }
    Some(InboundFrame::Other)
}

fn tls_connector() -> Result<Connector> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| DeribitError::Tls(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

impl ApiClient {
    /// Establish the persistent channel and start its two workers: the I/O
    /// task driving the socket and the dispatch task invoking subscription
    /// callbacks. No-op when already connected.
    pub fn connect_websocket(self: &Arc<Self>) -> Result<()> {
        if self.ws_connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.command_tx.lock().expect("command lock poisoned") = Some(command_tx);

        // Dispatch worker: drains (channel, payload) pairs so callback cost
        // never stalls the socket read loop.
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<(String, Value)>();
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            while let Some((channel, data)) = dispatch_rx.recv().await {
                let callback = match callbacks.get(&channel) {
                    Some(entry) => Some(entry.value().clone()),
                    None => None,
                };
                match callback {
                    Some(callback) => callback(data),
                    None => debug!(%channel, "push for channel with no callback"),
                }
            }
        });

        let client = self.clone();
        let handle = tokio::spawn(async move {
            client.run_websocket(command_rx, dispatch_tx).await;
        });
        *self.ws_task.lock().expect("task lock poisoned") = Some(handle);
        Ok(())
    }

    /// Send a normal close and join the connection task.
    pub async fn disconnect_websocket(&self) {
        if !self.ws_connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let command_tx = self.command_tx.lock().expect("command lock poisoned").take();
        if let Some(tx) = command_tx {
            let _ = tx.send(WsCommand::Close);
        }
        let handle = self.ws_task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("upstream WebSocket disconnected");
    }

    /// Register `callback` for `channel`, then ask the venue to start
    /// pushing it.
    pub fn subscribe(&self, channel: &str, callback: ChannelCallback) -> Result<()> {
        if !self.is_websocket_connected() {
            return Err(DeribitError::NotConnected);
        }
        self.callbacks.insert(channel.to_string(), callback);
        let request = self.rpc_envelope("public/subscribe", json!({ "channels": [channel] }));
        self.send_ws(request.to_string())
    }

    /// Ask the venue to stop pushing `channel`, then drop the local mapping.
    pub fn unsubscribe(&self, channel: &str) -> Result<()> {
        if !self.is_websocket_connected() {
            return Err(DeribitError::NotConnected);
        }
        let request = self.rpc_envelope("public/unsubscribe", json!({ "channels": [channel] }));
        self.send_ws(request.to_string())?;
        self.callbacks.remove(channel);
        Ok(())
    }

    fn send_ws(&self, text: String) -> Result<()> {
        let command_tx = self.command_tx.lock().expect("command lock poisoned");
        match command_tx.as_ref() {
            Some(tx) => tx
                .send(WsCommand::Send(text))
                .map_err(|_| DeribitError::ChannelSend),
            None => Err(DeribitError::NotConnected),
        }
    }

    /// Connection loop: reconnects with exponential backoff until a close is
    /// requested or the command channel is dropped.
    async fn run_websocket(
        self: Arc<Self>,
        mut command_rx: mpsc::UnboundedReceiver<WsCommand>,
        dispatch_tx: mpsc::UnboundedSender<(String, Value)>,
    ) {
        let mut reconnect_delay = Duration::from_secs(1);

        loop {
            match self.drive_connection(&mut command_rx, &dispatch_tx).await {
                Ok(()) => {
                    info!("upstream WebSocket closed");
                    break;
                }
                Err(e) => {
                    if !self.ws_connected.load(Ordering::SeqCst) {
                        break;
                    }
                    counter!("deribit_ws_disconnects_total").increment(1);
                    warn!(
                        error = %e,
                        delay_s = reconnect_delay.as_secs(),
                        "upstream WebSocket disconnected, reconnecting"
                    );
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(30));
                }
            }
        }
        self.ws_connected.store(false, Ordering::SeqCst);
    }

    async fn drive_connection(
        &self,
        command_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
        dispatch_tx: &mpsc::UnboundedSender<(String, Value)>,
    ) -> Result<()> {
        let url = Url::parse(self.ws_url())?;
        info!(%url, "connecting upstream WebSocket");
        let connector = tls_connector()?;
        let (ws_stream, response) =
            connect_async_tls_with_config(url.as_str(), None, false, Some(connector)).await?;
        debug!(status = ?response.status(), "WebSocket handshake complete");
        let (mut write, mut read) = ws_stream.split();

        // Best-effort auth frame, then replay the registered subscriptions
        // so pushes survive a reconnect.
        if self.is_authenticated() {
            let auth = self.rpc_envelope(
                "public/auth",
                json!({
                    "grant_type": "client_credentials",
                    "client_id": self.api_key,
                    "client_secret": self.api_secret,
                }),
            );
            write.send(Message::Text(auth.to_string())).await?;
        }
        let registered_channels: Vec<String> =
            self.callbacks.iter().map(|entry| entry.key().clone()).collect();
        for channel in &registered_channels {
            let request = self
                .rpc_envelope("public/subscribe", json!({ "channels": [channel] }));
            write.send(Message::Text(request.to_string())).await?;
        }

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            counter!("deribit_ws_messages_total").increment(1);
                            self.handle_frame(&text, dispatch_tx);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "received close frame");
                            return Err(DeribitError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(DeribitError::ConnectionClosed),
                    }
                }
                command = command_rx.recv() => {
                    match command {
                        Some(WsCommand::Send(text)) => {
                            write.send(Message::Text(text)).await?;
                        }
                        Some(WsCommand::Close) | None => {
                            let close = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "disconnect".into(),
                            };
                            let _ = write.send(Message::Close(Some(close))).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Classify one inbound frame. Notifications for registered channels go
    /// to the dispatch queue; everything else is logged and dropped.
    fn handle_frame(&self, text: &str, dispatch_tx: &mpsc::UnboundedSender<(String, Value)>) {
        match route_frame(text) {
            Some(InboundFrame::Notification { channel, data }) => {
                if self.callbacks.contains_key(&channel) {
                    let _ = dispatch_tx.send((channel, data));
                } else {
                    debug!(%channel, "dropping push for unregistered channel");
                }
            }
            Some(InboundFrame::Response { id }) => {
                debug!(id, "response frame (no correlator registered)");
            }
            Some(InboundFrame::Error { message }) => {
                warn!(%message, "venue error frame");
            }
            Some(InboundFrame::Other) => {
                debug!("unrecognized frame shape");
            }
            None => {
                warn!("dropping non-JSON frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_subscription_notifications() {
        let frame = r#"{
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": "book.BTC-PERPETUAL.100ms",
                "data": {"instrument_name": "BTC-PERPETUAL", "bids": [], "asks": []}
            }
        }"#;
        match route_frame(frame) {
            Some(InboundFrame::Notification { channel, data }) => {
                assert_eq!(channel, "book.BTC-PERPETUAL.100ms");
                assert_eq!(data["instrument_name"], "BTC-PERPETUAL");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn routes_response_frames() {
        let frame = r#"{"jsonrpc": "2.0", "id": 7, "result": {"ok": true}}"#;
        match route_frame(frame) {
            Some(InboundFrame::Response { id }) => assert_eq!(id, 7),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn routes_error_frames() {
        let frame = r#"{"jsonrpc": "2.0", "error": {"code": 13004, "message": "invalid_credentials"}}"#;
        match route_frame(frame) {
            Some(InboundFrame::Error { message }) => assert_eq!(message, "invalid_credentials"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn notification_without_channel_is_not_dispatched() {
        let frame = r#"{"method": "subscription", "params": {"data": {}}}"#;
        assert!(route_frame(frame).is_none());
    }

    #[test]
    fn non_json_frames_are_dropped() {
        assert!(route_frame("not json").is_none());
    }

    #[test]
    fn unshaped_json_is_other() {
        match route_frame(r#"{"hello": "world"}"#) {
            Some(InboundFrame::Other) => {}
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn subscribe_requires_connection() {
        let client = Arc::new(ApiClient::new("key", "secret", true));
        let result = client.subscribe("book.BTC-PERPETUAL.100ms", Arc::new(|_| {}));
        assert!(matches!(result, Err(DeribitError::NotConnected)));
    }
}
