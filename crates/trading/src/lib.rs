//! Trading system coordinator.
//!
//! [`TradingSystem`] composes the venue session, the order/book store, and
//! the distribution gateway, and owns their lifecycle: the session is built
//! first and torn down last, so the store's and gateway's handles to it
//! stay valid for their whole lifetime.
//!
//! Market-data wiring: each subscribed instrument installs a callback on
//! the session's dispatch worker that parses the push into an
//! [`orders::OrderBook`] and hands it to the gateway's
//! [`gateway::BookRouter`] for fan-out. The callback deliberately does not
//! write the store's book cache — keeping a cache write off the hot path —
//! so `get_orderbook` snapshot reads can serve data older than the last
//! push.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use deribit::{ApiClient, DeribitError};
use gateway::{AppState, BookRouter, ClientRegistry};
use latency::LatencyRegistry;
use orders::{OrderBook, OrderStore};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum TradingError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Deribit(#[from] DeribitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, TradingError>;

/// Runtime configuration for the trading system.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Use the venue's test environment.
    pub test_mode: bool,
    /// Local port for the distribution gateway.
    pub gateway_port: u16,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            test_mode: true,
            gateway_port: 9000,
        }
    }
}

/// Owner of the session, store, and gateway.
pub struct TradingSystem {
    api: Arc<ApiClient>,
    store: Arc<OrderStore>,
    registry: Arc<ClientRegistry>,
    router: Arc<BookRouter>,
    latency: Arc<LatencyRegistry>,
    gateway_port: u16,
    running: AtomicBool,
    stopped: Notify,
    gateway_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    gateway_task: Mutex<Option<JoinHandle<()>>>,
}

impl TradingSystem {
    /// Construct the component graph. Refuses empty credentials; nothing
    /// touches the network until [`start`](Self::start).
    pub fn initialize(config: TradingConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(TradingError::InvalidConfig("api_key is empty".into()));
        }
        if config.api_secret.is_empty() {
            return Err(TradingError::InvalidConfig("api_secret is empty".into()));
        }

        let latency = Arc::new(LatencyRegistry::new());
        let api = Arc::new(ApiClient::new(
            config.api_key,
            config.api_secret,
            config.test_mode,
        ));
        let store = Arc::new(OrderStore::new(api.clone(), latency.clone()));
        let registry = Arc::new(ClientRegistry::new(latency.clone()));
        let router = Arc::new(BookRouter::new(
            registry.clone(),
            store.clone(),
            latency.clone(),
        ));

        Ok(Self {
            api,
            store,
            registry,
            router,
            latency,
            gateway_port: config.gateway_port,
            running: AtomicBool::new(false),
            stopped: Notify::new(),
            gateway_shutdown: Mutex::new(None),
            gateway_task: Mutex::new(None),
        })
    }

    /// Authenticate, open the upstream channel, and start the gateway.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.api.authenticate().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.api.connect_websocket()?;

        let listener = match TcpListener::bind(("0.0.0.0", self.gateway_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.gateway_shutdown.lock().expect("shutdown lock poisoned") = Some(shutdown_tx);

        let state = Arc::new(AppState {
            registry: self.registry.clone(),
            router: self.router.clone(),
        });
        let handle = tokio::spawn(async move {
            if let Err(e) = gateway::serve(listener, state, async {
                let _ = shutdown_rx.await;
            })
            .await
            {
                error!(error = %e, "gateway server error");
            }
        });
        *self.gateway_task.lock().expect("task lock poisoned") = Some(handle);

        info!(port = self.gateway_port, "trading system started");
        Ok(())
    }

    /// Disconnect upstream, stop the gateway, and release `wait()`ers.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.api.disconnect_websocket().await;

        let shutdown = self
            .gateway_shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        let task = self.gateway_task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.stopped.notify_waiters();
        info!("trading system stopped");
    }

    /// Block until [`stop`](Self::stop) completes.
    pub async fn wait(&self) {
        loop {
            let notified = self.stopped.notified();
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Join the venue's book feed for `instrument` and fan each push out to
    /// downstream subscribers of `orderbook.<instrument>`.
    pub fn subscribe_market_data(&self, instrument: &str) -> Result<()> {
        if !self.is_running() {
            return Err(TradingError::NotRunning);
        }

        let router = self.router.clone();
        let latency = self.latency.clone();
        let name = instrument.to_string();
        let callback: deribit::ChannelCallback = Arc::new(move |data: Value| {
            let tracker = latency.tracker("process_orderbook_update");
            let _timer = tracker.timer();
            match OrderBook::from_venue(&name, &data) {
                Some(book) => router.handle_orderbook_update(&name, &book),
                None => warn!(instrument = %name, "unparseable book push"),
            }
        });

        self.api
            .subscribe(&market_data_channel(instrument), callback)?;
        info!(%instrument, "subscribed to market data");
        Ok(())
    }

    /// Leave the venue's book feed for `instrument`.
    pub fn unsubscribe_market_data(&self, instrument: &str) -> Result<()> {
        if !self.is_running() {
            return Err(TradingError::NotRunning);
        }
        self.api.unsubscribe(&market_data_channel(instrument))?;
        info!(%instrument, "unsubscribed from market data");
        Ok(())
    }

    /// Forward an upstream order push into the store.
    pub fn handle_order_update(&self, update: &Value) {
        self.store.handle_order_update(update);
    }

    /// Forward an upstream position push into the store.
    pub fn handle_position_update(&self, update: &Value) {
        self.store.handle_position_update(update);
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn latency(&self) -> &Arc<LatencyRegistry> {
        &self.latency
    }

    /// CSV rendering of all latency trackers.
    pub fn performance_csv(&self) -> String {
        self.latency.to_csv_string()
    }

    /// Write the latency CSV to `path`.
    pub fn export_performance_metrics(&self, path: &str) -> std::io::Result<()> {
        self.latency.export_csv(path)
    }
}

/// Upstream channel carrying 100ms book snapshots for `instrument`.
fn market_data_channel(instrument: &str) -> String {
    format!("book.{instrument}.100ms")
}
