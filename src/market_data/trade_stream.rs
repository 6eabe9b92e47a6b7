// =============================================================================
// Trade Stream: one reconnecting aggTrade reader per instrument
// =============================================================================

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconnect::ReconnectPolicy;
use crate::types::Tick;

/// How a single connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server closed the stream; reconnect.
    Disconnected,
    /// Shutdown was requested.
    Cancelled,
    /// Nobody is consuming ticks any more.
    QueueClosed,
}

/// Counters for one reader over its whole lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub attempts: u32,
    pub connections: u32,
    pub ticks: u64,
    pub skipped: u64,
}

/// Per-instrument websocket endpoint, e.g. `wss://host/ws/btcusdt@aggTrade`.
pub fn stream_url(base: &str, symbol: &str) -> String {
    format!(
        "{}/{}@aggTrade",
        base.trim_end_matches('/'),
        symbol.to_lowercase()
    )
}

// ---------------------------------------------------------------------------
// FeedReader
// ---------------------------------------------------------------------------

pub struct FeedReader {
    symbol: String,
    url: String,
    policy: ReconnectPolicy,
}

impl FeedReader {
    pub fn new(base_url: &str, symbol: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let symbol = symbol.into();
        Self {
            url: stream_url(base_url, &symbol),
            symbol,
            policy,
        }
    }

    /// Connect, read, and reconnect until cancelled or the tick queue closes.
    pub async fn run(self, ticks: mpsc::Sender<Tick>, cancel: CancellationToken) -> FeedStats {
        let mut stats = FeedStats::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            stats.attempts += 1;

            match self.read_connection(&ticks, &cancel, &mut stats).await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::QueueClosed) => {
                    warn!(symbol = %self.symbol, "tick queue closed, stopping feed reader");
                    break;
                }
                Ok(StreamEnd::Disconnected) => {
                    warn!(symbol = %self.symbol, "trade stream ended, reconnecting");
                }
                Err(e) => {
                    error!(
                        symbol = %self.symbol,
                        attempt = stats.attempts,
                        error = %format!("{e:#}"),
                        "trade stream error, reconnecting"
                    );
                }
            }

            if !self.policy.wait(&cancel).await {
                break;
            }
        }

        info!(
            symbol = %self.symbol,
            attempts = stats.attempts,
            connections = stats.connections,
            ticks = stats.ticks,
            skipped = stats.skipped,
            "feed reader stopped"
        );
        stats
    }

    /// One connection's lifetime: dial, then read until it drops.
    async fn read_connection(
        &self,
        ticks: &mpsc::Sender<Tick>,
        cancel: &CancellationToken,
        stats: &mut FeedStats,
    ) -> Result<StreamEnd> {
        info!(url = %self.url, symbol = %self.symbol, "connecting to trade WebSocket");

        let (ws_stream, _response) = tokio::select! {
            res = connect_async(self.url.as_str()) => {
                res.context("failed to connect to trade WebSocket")?
            }
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        };

        stats.connections += 1;
        info!(symbol = %self.symbol, "trade WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            };

            match msg {
                Some(Ok(Message::Text(text))) => match parse_agg_trade(&text) {
                    Ok(tick) => {
                        debug!(symbol = %tick.instrument, price = %tick.price, "tick");
                        // A full queue parks the reader here: backpressure,
                        // not loss.
                        let permit = tokio::select! {
                            res = ticks.reserve() => match res {
                                Ok(permit) => permit,
                                Err(_) => return Ok(StreamEnd::QueueClosed),
                            },
                            _ = cancel.cancelled() => {
                                // Last non-blocking attempt. If the queue is
                                // still full the tick is dropped here.
                                if ticks.try_send(tick).is_ok() {
                                    stats.ticks += 1;
                                } else {
                                    debug!(symbol = %self.symbol, "queue full at shutdown, tick dropped");
                                }
                                return Ok(StreamEnd::Cancelled);
                            }
                        };
                        permit.send(tick);
                        stats.ticks += 1;
                    }
                    Err(e) => {
                        stats.skipped += 1;
                        warn!(symbol = %self.symbol, error = %format!("{e:#}"), "failed to parse aggTrade message");
                    }
                },
                // Ping / Pong / Binary / Close frames carry no trades;
                // tungstenite answers pings on its own.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(e).context("trade WebSocket read error");
                }
                None => return Ok(StreamEnd::Disconnected),
            }
        }
    }
}

/// Run one reader per symbol. The shared sender is dropped once every reader
/// has stopped, which closes the tick queue for the aggregator.
pub async fn run_feeds(
    base_url: String,
    symbols: Vec<String>,
    policy: ReconnectPolicy,
    ticks: mpsc::Sender<Tick>,
    cancel: CancellationToken,
) {
    let handles: Vec<_> = symbols
        .into_iter()
        .map(|symbol| {
            let reader = FeedReader::new(&base_url, symbol.clone(), policy);
            let handle = tokio::spawn(reader.run(ticks.clone(), cancel.clone()));
            (symbol, handle)
        })
        .collect();
    drop(ticks);

    info!(count = handles.len(), "feed readers launched");

    for (symbol, handle) in handles {
        if let Err(e) = handle.await {
            error!(symbol = %symbol, error = %e, "feed reader task failed");
        }
    }
    info!("all feed readers stopped, tick queue closed");
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a Binance aggTrade message.
///
/// Expected shape (the combined-stream `{stream, data}` envelope is also
/// accepted):
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000000 }
/// ```
pub fn parse_agg_trade(text: &str) -> Result<Tick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let instrument = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let price = parse_decimal(&data["p"], "p")?;
    let quantity = parse_decimal(&data["q"], "q")?;

    let trade_time = data["T"].as_i64().context("missing field T")?;
    let event_time =
        DateTime::from_timestamp_millis(trade_time).context("trade time out of range")?;

    if price <= Decimal::ZERO {
        bail!("non-positive price {price}");
    }
    if quantity < Decimal::ZERO {
        bail!("negative quantity {quantity}");
    }

    Ok(Tick {
        instrument,
        price,
        quantity,
        event_time,
    })
}

/// Binance sends numeric values as JSON strings; plain numbers are accepted
/// too.
fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal> {
    let raw = match val {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => bail!("missing field {name}"),
        _ => bail!("field {name} has unexpected JSON type"),
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .with_context(|| format!("failed to parse {name} as decimal: {raw}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn agg_trade(price: &str, qty: &str, t: i64) -> String {
        serde_json::json!({
            "e": "aggTrade", "s": "BTCUSDT", "p": price, "q": qty, "T": t, "m": true
        })
        .to_string()
    }

    /// Local feed: the first `failures` connections are dropped before the
    /// websocket handshake, then every later connection gets `messages` and
    /// is held open until the client leaves.
    async fn spawn_feed(failures: usize, messages: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    drop(stream);
                    continue;
                }
                let messages = messages.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    for m in messages {
                        if ws.send(Message::Text(m)).await.is_err() {
                            return;
                        }
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        (format!("ws://{addr}"), accepted)
    }

    #[test]
    fn stream_url_lowercases_symbol() {
        assert_eq!(
            stream_url("wss://stream.binance.com:9443/ws/", "BTCUSDT"),
            "wss://stream.binance.com:9443/ws/btcusdt@aggTrade"
        );
    }

    #[test]
    fn parse_agg_trade_ok() {
        let tick = parse_agg_trade(&agg_trade("45000.00", "0.001", 1_700_000_000_000)).unwrap();
        assert_eq!(tick.instrument, "BTCUSDT");
        assert_eq!(tick.price, Decimal::from_str("45000.00").unwrap());
        assert_eq!(tick.quantity, Decimal::from_str("0.001").unwrap());
        assert_eq!(tick.event_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn parse_combined_envelope() {
        let text = format!(
            r#"{{"stream":"btcusdt@aggTrade","data":{}}}"#,
            agg_trade("1.5", "2", 1_700_000_000_000)
        );
        let tick = parse_agg_trade(&text).unwrap();
        assert_eq!(tick.quantity, Decimal::from(2));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(parse_agg_trade("not json").is_err());
        assert!(parse_agg_trade(r#"{"s":"BTCUSDT","q":"1","T":1}"#).is_err());
        assert!(parse_agg_trade(&agg_trade("abc", "1", 1)).is_err());
        assert!(parse_agg_trade(&agg_trade("0", "1", 1)).is_err());
        assert!(parse_agg_trade(&agg_trade("1", "-1", 1)).is_err());
    }

    #[tokio::test]
    async fn delivers_ticks_after_failed_dials() {
        let (url, accepted) = spawn_feed(
            3,
            vec![
                agg_trade("100", "1", 1_700_000_000_000),
                agg_trade("101", "2", 1_700_000_001_000),
            ],
        )
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let reader = FeedReader::new(&url, "BTCUSDT", ReconnectPolicy::fixed(Duration::from_millis(20)));
        let task = tokio::spawn(reader.run(tx, cancel.clone()));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.price, Decimal::from(100));
        assert_eq!(second.price, Decimal::from(101));

        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.ticks, 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 4);
        assert!(rx.recv().await.is_none(), "no fabricated ticks");
    }

    #[tokio::test]
    async fn malformed_messages_are_skipped() {
        let (url, _) = spawn_feed(
            0,
            vec![
                "garbage".to_string(),
                agg_trade("nan?", "1", 1),
                agg_trade("42", "1", 1_700_000_000_000),
            ],
        )
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let reader = FeedReader::new(&url, "BTCUSDT", ReconnectPolicy::default());
        let task = tokio::spawn(reader.run(tx, cancel.clone()));

        let tick = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(tick.price, Decimal::from(42));

        cancel.cancel();
        let stats = task.await.unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test]
    async fn full_queue_blocks_without_dropping() {
        let messages: Vec<String> = (0..20)
            .map(|i| agg_trade(&format!("{}", 100 + i), "1", 1_700_000_000_000 + i))
            .collect();
        let (url, _) = spawn_feed(0, messages).await;

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let reader = FeedReader::new(&url, "BTCUSDT", ReconnectPolicy::default());
        let task = tokio::spawn(reader.run(tx, cancel.clone()));

        // Let the reader fill the queue and park on it.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut prices = Vec::new();
        for _ in 0..20 {
            let tick = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            prices.push(tick.price);
        }
        let expected: Vec<Decimal> = (0..20).map(|i| Decimal::from(100 + i)).collect();
        assert_eq!(prices, expected);

        cancel.cancel();
        assert_eq!(task.await.unwrap().ticks, 20);
    }

    #[tokio::test]
    async fn tick_parked_on_full_queue_survives_cancellation() {
        let (url, accepted) = spawn_feed(0, vec![agg_trade("77", "1", 1_700_000_000_000)]).await;

        let (tx, mut rx) = mpsc::channel(1);
        tx.send(Tick {
            instrument: "FILLER".into(),
            price: Decimal::ONE,
            quantity: Decimal::ONE,
            event_time: DateTime::from_timestamp_millis(0).unwrap(),
        })
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let reader = FeedReader::new(&url, "BTCUSDT", ReconnectPolicy::default());
        let task = tokio::spawn(reader.run(tx, cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Let the reader parse the trade and park on the full queue.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Free the slot and cancel without yielding in between: whichever
        // branch the reader wakes on, the parsed tick must reach the queue.
        assert_eq!(rx.recv().await.unwrap().instrument, "FILLER");
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(stats.ticks, 1);
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.price, Decimal::from(77));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_reader_does_not_reconnect() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(1);
        let reader = FeedReader::new("ws://127.0.0.1:9", "BTCUSDT", ReconnectPolicy::default());
        let stats = reader.run(tx, cancel).await;
        assert_eq!(stats.attempts, 0);
    }

    #[tokio::test]
    async fn run_feeds_closes_queue_when_readers_stop() {
        let (tx, mut rx) = mpsc::channel::<Tick>(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_feeds(
            "ws://127.0.0.1:9".to_string(),
            vec!["BTCUSDT".into(), "ETHUSDT".into()],
            ReconnectPolicy::fixed(Duration::from_millis(10)),
            tx,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
