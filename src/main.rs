// =============================================================================
// marketgate — real-time market-data fan-out gateway
// =============================================================================
//
// One upstream exchange connection per (symbol, stream kind), fanned out to
// any number of downstream WebSocket subscribers, with historical backlogs
// reconciled into each stream on first subscription.
// =============================================================================

mod aggregator;
mod api;
mod app_state;
mod binance;
mod config;
mod format;
mod history;
mod hub;
mod symbols;
mod types;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let debug = config.debug;
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config);

    if debug {
        info!("debug mode enabled");
    }

    // Warm the symbol registry so the first subscriber does not pay for the
    // exchange-info sweep. A failure here is not fatal: the registry retries
    // on demand and reports degraded until a load succeeds.
    let warmup = state.symbols.clone();
    tokio::spawn(async move {
        let symbols = warmup.list_symbols().await;
        if symbols.is_empty() {
            warn!("symbol registry warm-up failed; will retry on demand");
        } else {
            info!(count = symbols.len(), "symbol registry warmed up");
        }
    });

    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "gateway listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "server stopped unexpectedly");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received, closing hubs");

    state.hubs.shutdown_all();
    server.abort();

    info!("marketgate shut down complete");
    Ok(())
}
