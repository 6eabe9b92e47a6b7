// =============================================================================
// Query surface: axum routers and the shared serve loop
// =============================================================================

pub mod probe;
pub mod rest;
pub mod ws;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::types::Candle;

/// Wire shape of a candle pushed to streaming clients and returned by the
/// snapshot endpoint. Times are ms epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub start_time: i64,
    pub end_time: i64,
    pub is_final: bool,
}

impl From<&Candle> for CandleSnapshot {
    fn from(c: &Candle) -> Self {
        Self {
            symbol: c.instrument.clone(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            start_time: ms(c.window_start),
            end_time: ms(c.window_end),
            is_final: c.finalized,
        }
    }
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(server = name, addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{name} server failed"))?;

    info!(server = name, "server stopped");
    Ok(())
}
