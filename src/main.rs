// =============================================================================
// Candle Forge: Main Entry Point
// =============================================================================
//
// Startup failures (config, database, listener binds) abort the process.
// Everything after startup runs until SIGINT/SIGTERM, then stops under the
// configured shutdown deadline.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod app_state;
mod config;
mod health;
mod market_data;
mod persistence;
mod pipeline;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::WindowAggregator;
use crate::app_state::AppState;
use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};
use crate::persistence::SqliteCandleStore;
use crate::pipeline::{Pipeline, ShutdownOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Forge: Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("CANDLE_FORGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = AppConfig::load(&config_path)?;
    config.apply_env_overrides();
    config.validate().context("invalid configuration")?;

    info!(
        symbols = ?config.feed.symbols,
        feed = %config.feed.url,
        db = %config.storage.db_path,
        "configuration ready"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store = Arc::new(
        SqliteCandleStore::open(&config.storage.db_path)
            .with_context(|| format!("failed to open database {}", config.storage.db_path))?,
    );
    let stored = store.count().await.context("failed to count stored candles")?;
    info!(stored, "candle history available");

    // ── 3. Listeners ─────────────────────────────────────────────────────
    let api_listener = TcpListener::bind(&config.api.bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", config.api.bind_addr))?;
    let probe_listener = TcpListener::bind(&config.health.bind_addr)
        .await
        .with_context(|| format!("failed to bind health probe on {}", config.health.bind_addr))?;

    // ── 4. Pipeline ──────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let aggregator = Arc::new(WindowAggregator::new());
    let mut pipeline = Pipeline::spawn(&config, aggregator.clone(), store, shutdown.clone());

    // ── 5. Query surface ─────────────────────────────────────────────────
    let state = Arc::new(AppState::new(aggregator, &config, shutdown.clone()));

    let api_router = api::rest::router(state.clone());
    let token = shutdown.clone();
    pipeline.spawn_stage("api", async move {
        if let Err(e) = api::serve("api", api_listener, api_router, token).await {
            error!(error = %e, "API server error");
        }
    });

    let probe_router = api::probe::router(state);
    let token = shutdown.clone();
    pipeline.spawn_stage("health-probe", async move {
        if let Err(e) = api::serve("health-probe", probe_listener, probe_router, token).await {
            error!(error = %e, "health probe error");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    wait_for_signal().await?;
    warn!("Shutdown signal received, stopping gracefully");

    match pipeline.shutdown(config.shutdown_timeout()).await {
        ShutdownOutcome::Completed => info!("Candle Forge shut down complete."),
        ShutdownOutcome::TimedOut { pending } => {
            warn!(pending = ?pending, "Candle Forge shut down with stages still running")
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl+C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")
}
