// =============================================================================
// Candle stream: WebSocket push of live candles
// =============================================================================
//
// Clients connect to `/api/v1/candles/stream?symbols=BTCUSDT,ETHUSDT`. Every
// `stream_interval` the handler reads `current()` for each requested symbol
// and pushes one `CandleSnapshot` per symbol that has a live candle. Symbols
// without one are skipped for that round.
//
// The stream ends when the client goes away or the service shuts down.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::CandleSnapshot;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    symbols: Option<String>,
}

fn parse_symbols(raw: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for sym in raw.unwrap_or_default().split(',') {
        let sym = sym.trim().to_uppercase();
        if !sym.is_empty() && !out.contains(&sym) {
            out.push(sym);
        }
    }
    out
}

/// Axum handler for the WebSocket upgrade request.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let symbols = parse_symbols(query.symbols.as_deref());
    if symbols.is_empty() {
        warn!("candle stream rejected: no symbols requested");
        return (StatusCode::BAD_REQUEST, "symbols query parameter is required").into_response();
    }

    info!(symbols = ?symbols, "candle stream accepted, upgrading");
    ws.on_upgrade(move |socket| stream_candles(socket, state, symbols))
        .into_response()
}

async fn stream_candles(socket: WebSocket, state: Arc<AppState>, symbols: Vec<String>) {
    state.stream_clients.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();

    let mut push = interval(state.stream_interval);
    push.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick: the first push happens one interval in.
    push.tick().await;

    let mut sent: u64 = 0;

    'conn: loop {
        tokio::select! {
            _ = push.tick() => {
                for symbol in &symbols {
                    let Some(candle) = state.aggregator.current(symbol) else {
                        continue;
                    };
                    let json = match serde_json::to_string(&CandleSnapshot::from(&candle)) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize candle snapshot");
                            continue;
                        }
                    };
                    if let Err(e) = sender.send(Message::Text(json)).await {
                        debug!(error = %e, "candle stream send failed, disconnecting");
                        break 'conn;
                    }
                    sent += 1;
                }
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "candle stream receive error");
                    break;
                }
                Some(Ok(_)) => {}
            },

            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.stream_clients.fetch_sub(1, Ordering::Relaxed);
    info!(sent, "candle stream closed");
}

// =============================================================================
// Tests
// =============================================================================
