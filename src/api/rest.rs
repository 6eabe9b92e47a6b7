// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are read-only. CORS is permissive;
// the service exposes no mutating routes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::api::CandleSnapshot;
use crate::app_state::AppState;
use crate::health::HealthReport;

// =============================================================================
// Router construction
// =============================================================================

/// Build the API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/candles/stream", get(crate::api::ws::stream_handler))
        .route("/api/v1/candles/:symbol", get(current_candle))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    #[serde(flatten)]
    report: HealthReport,
    live_candles: usize,
    late_ticks: u64,
    stream_clients: u64,
    uptime_secs: u64,
}

/// Always 200; the verdict is in the body. The plain probe is the endpoint
/// that maps health onto a status code.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        report: state.health(),
        live_candles: state.aggregator.live_count(),
        late_ticks: state.aggregator.late_tick_count(),
        stream_clients: state.stream_client_count(),
        uptime_secs: state.uptime_secs(),
    })
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn current_candle(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    match state.aggregator.current(&symbol) {
        Some(candle) => (StatusCode::OK, Json(CandleSnapshot::from(&candle))).into_response(),
        None => {
            debug!(symbol = %symbol, "no live candle");
            (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!("no live candle for {symbol}"),
                }),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
