//! Trading system entry point.
//!
//! Usage: `deribit-gateway <api_key> <api_secret> [port]`. Credentials and
//! port may also come from the environment (`DERIBIT_API_KEY`,
//! `DERIBIT_API_SECRET`, `GATEWAY_PORT`), loaded from `.env` when present.

use std::env;
use std::process::ExitCode;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trading::{TradingConfig, TradingSystem};

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let api_key = args.next().or_else(|| env::var("DERIBIT_API_KEY").ok());
    let api_secret = args.next().or_else(|| env::var("DERIBIT_API_SECRET").ok());
    let (Some(api_key), Some(api_secret)) = (api_key, api_secret) else {
        eprintln!("Usage: deribit-gateway <api_key> <api_secret> [port]");
        return ExitCode::FAILURE;
    };
    let gateway_port: u16 = match args
        .next()
        .unwrap_or_else(|| env_or("GATEWAY_PORT", "9000"))
        .parse()
    {
        Ok(port) => port,
        Err(_) => {
            eprintln!("Usage: deribit-gateway <api_key> <api_secret> [port]");
            return ExitCode::FAILURE;
        }
    };
    let test_mode = env_or("DERIBIT_TEST_MODE", "true") != "false";
    let instruments = env_or("INSTRUMENTS", "BTC-PERPETUAL");
    let metrics_port: u16 = match env_or("METRICS_PORT", "9091").parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("METRICS_PORT must be a number");
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  GATEWAY_PORT: {}", gateway_port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!("  DERIBIT_TEST_MODE: {}", test_mode);
    info!("  INSTRUMENTS: {}", instruments);

    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
    {
        warn!(error = %e, "Prometheus exporter not started");
    }

    let config = TradingConfig {
        api_key,
        api_secret,
        test_mode,
        gateway_port,
    };
    let system = match TradingSystem::initialize(config) {
        Ok(system) => system,
        Err(e) => {
            error!(error = %e, "failed to initialize trading system");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = system.start().await {
        error!(error = %e, "failed to start trading system");
        return ExitCode::FAILURE;
    }

    for instrument in instruments.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Err(e) = system.subscribe_market_data(instrument) {
            warn!(%instrument, error = %e, "market data subscription failed");
        }
    }

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = system.wait() => {}
    }

    system.stop().await;

    let metrics_path = env_or("METRICS_EXPORT_PATH", "performance_metrics.csv");
    match system.export_performance_metrics(&metrics_path) {
        Ok(()) => info!(path = %metrics_path, "performance metrics exported"),
        Err(e) => warn!(error = %e, "failed to export performance metrics"),
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
