//! HTTPS JSON-RPC client and token lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::error::{DeribitError, Result};
use crate::types::{ApiResponse, Credentials, InstrumentKind};
use crate::ws::{ChannelCallback, WsCommand};

const TEST_API_URL: &str = "https://test.deribit.com";
const TEST_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";
const PROD_API_URL: &str = "https://www.deribit.com";
const PROD_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";

/// Authenticated duplex session with the venue.
///
/// Exclusive owner of the credentials and the upstream socket. Cheap to
/// share behind an `Arc`; all methods take `&self`.
pub struct ApiClient {
    api_url: String,
    ws_url: String,
    pub(crate) api_key: String,
    pub(crate) api_secret: String,
    http: reqwest::Client,
    request_id: AtomicU64,
    pub(crate) authenticated: AtomicBool,
    credentials: AsyncMutex<Option<Credentials>>,
    // WebSocket state, driven by the tasks spawned in `ws.rs`.
    pub(crate) ws_connected: AtomicBool,
    pub(crate) callbacks: Arc<DashMap<String, ChannelCallback>>,
    pub(crate) command_tx:
        std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedSender<WsCommand>>>,
    pub(crate) ws_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ApiClient {
    /// Client for the standard venue endpoints. `test_mode` selects the
    /// test environment.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, test_mode: bool) -> Self {
        let (api_url, ws_url) = if test_mode {
            (TEST_API_URL, TEST_WS_URL)
        } else {
            (PROD_API_URL, PROD_WS_URL)
        };
        Self::with_base_urls(api_url, ws_url, api_key, api_secret)
    }

    /// Client against explicit base URLs, for venue-compatible deployments.
    pub fn with_base_urls(
        api_url: impl Into<String>,
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            http: reqwest::Client::new(),
            request_id: AtomicU64::new(1),
            authenticated: AtomicBool::new(false),
            credentials: AsyncMutex::new(None),
            ws_connected: AtomicBool::new(false),
            callbacks: Arc::new(DashMap::new()),
            command_tx: std::sync::Mutex::new(None),
            ws_task: std::sync::Mutex::new(None),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_websocket_connected(&self) -> bool {
        self.ws_connected.load(Ordering::SeqCst)
    }

    /// Build the JSON-RPC envelope for `method`, with a fresh request id.
    pub(crate) fn rpc_envelope(&self, method: &str, params: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        })
    }

    /// One-shot JSON-RPC POST to `/api/v2/<method>`.
    ///
    /// Transport failures and venue error replies both come back as a failed
    /// [`ApiResponse`]; this call never propagates an error upward.
    pub async fn public_request(&self, method: &str, params: Value) -> ApiResponse {
        let url = format!("{}/api/v2/{}", self.api_url, method);
        let envelope = self.rpc_envelope(method, params);

        let response = match self.http.post(&url).json(&envelope).send().await {
            Ok(response) => response,
            Err(e) => return ApiResponse::err(format!("Request failed: {e}")),
        };
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => return ApiResponse::err(format!("Request failed: {e}")),
        };

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown venue error");
            ApiResponse::err(message)
        } else {
            ApiResponse::ok(body)
        }
    }

    /// Exchange the API key pair for bearer tokens via the credentials
    /// grant.
    pub async fn authenticate(&self) -> Result<()> {
        let mut credentials = self.credentials.lock().await;

        let params = json!({
            "grant_type": "client_credentials",
            "client_id": self.api_key,
            "client_secret": self.api_secret,
        });
        let response = self.public_request("public/auth", params).await;
        if !response.success {
            let message = response
                .error_message
                .unwrap_or_else(|| "unknown error".to_string());
            error!(%message, "authentication failed");
            return Err(DeribitError::AuthFailed(message));
        }

        *credentials = Some(Self::parse_grant(response.result())?);
        self.authenticated.store(true, Ordering::SeqCst);
        debug!("authenticated with venue");
        Ok(())
    }

    /// Authenticated JSON-RPC request.
    ///
    /// Refreshes the access token first when it has expired; a failed
    /// refresh flips the session back to unauthenticated so the next call
    /// surfaces the state instead of looping.
    pub async fn private_request(&self, method: &str, params: Value) -> ApiResponse {
        if !self.is_authenticated() {
            return ApiResponse::err("Not authenticated");
        }

        let access_token = {
            let mut credentials = self.credentials.lock().await;
            let expired = credentials
                .as_ref()
                .map(|c| Instant::now() >= c.expires_at)
                .unwrap_or(true);
            if expired {
                if let Err(e) = self.refresh_token(&mut credentials).await {
                    warn!(error = %e, "token refresh failed");
                    self.authenticated.store(false, Ordering::SeqCst);
                    return ApiResponse::err("Failed to refresh token");
                }
            }
            match credentials.as_ref() {
                Some(c) => c.access_token.clone(),
                None => return ApiResponse::err("Not authenticated"),
            }
        };

        let mut params = if params.is_object() { params } else { json!({}) };
        params["access_token"] = Value::String(access_token);
        self.public_request(method, params).await
    }

    /// Refresh-token grant. Caller holds the credentials lock.
    async fn refresh_token(&self, credentials: &mut Option<Credentials>) -> Result<()> {
        let refresh_token = credentials
            .as_ref()
            .map(|c| c.refresh_token.clone())
            .ok_or(DeribitError::NotAuthenticated)?;

        let params = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        let response = self.public_request("public/auth", params).await;
        if !response.success {
            return Err(DeribitError::RefreshFailed);
        }

        *credentials = Some(Self::parse_grant(response.result())?);
        debug!("access token refreshed");
        Ok(())
    }

    fn parse_grant(result: &Value) -> Result<Credentials> {
        let access_token = result
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| DeribitError::AuthFailed("missing access_token".into()))?;
        let refresh_token = result
            .get("refresh_token")
            .and_then(Value::as_str)
            .ok_or_else(|| DeribitError::AuthFailed("missing refresh_token".into()))?;
        let expires_in = result.get("expires_in").and_then(Value::as_u64).unwrap_or(0);
        Ok(Credentials {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        })
    }

    /// Instrument names for a currency and kind, non-expired only.
    pub async fn get_instruments(&self, currency: &str, kind: InstrumentKind) -> Vec<String> {
        let params = json!({
            "currency": currency,
            "kind": kind.as_str(),
            "expired": false,
        });
        let response = self.public_request("public/get_instruments", params).await;
        if !response.success {
            warn!(
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "failed to fetch instruments"
            );
            return Vec::new();
        }
        response
            .result()
            .as_array()
            .map(|instruments| {
                instruments
                    .iter()
                    .filter_map(|i| i.get("instrument_name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
