// =============================================================================
// Pipeline Orchestrator
// =============================================================================
//
//   feed readers ──ticks(mpsc)──▶ aggregator ──candles(mpsc)──▶ batched writer
//
// Every stage shares one `CancellationToken`. Shutdown cancels it and then
// joins all stages against a single deadline. Queue closure propagates
// downstream: the feed side drops the tick sender once every reader has
// stopped, and the aggregator drops the candle sender after its final flush.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::WindowAggregator;
use crate::config::{AppConfig, StorageConfig};
use crate::market_data::{run_feeds, ReconnectPolicy};
use crate::persistence::{BatchedWriter, CandleSink, FlushPolicy};
use crate::types::{Candle, Tick};

/// Default deadline for a graceful stop.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every stage returned before the deadline.
    Completed,
    /// These stages were still running at the deadline and were aborted.
    TimedOut { pending: Vec<String> },
}

// =============================================================================
// StageSet
// =============================================================================

/// Named tasks that share one cancellation token.
pub struct StageSet {
    cancel: CancellationToken,
    stages: Vec<(String, JoinHandle<()>)>,
}

impl StageSet {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            stages: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, stage: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(stage = %name, "spawning stage");
        self.stages.push((name, tokio::spawn(stage)));
    }

    /// Cancel the token and wait up to `timeout` for every stage. Stages
    /// still running at the deadline are aborted.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownOutcome {
        info!(
            stages = self.stages.len(),
            timeout_secs = timeout.as_secs_f64(),
            "shutting down pipeline"
        );
        self.cancel.cancel();

        let deadline = Instant::now() + timeout;
        let mut pending = Vec::new();

        for (name, mut handle) in self.stages {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(stage = %name, "stage stopped"),
                Ok(Err(e)) => error!(stage = %name, error = %e, "stage task failed"),
                Err(_) => {
                    handle.abort();
                    pending.push(name);
                }
            }
        }

        if pending.is_empty() {
            info!("pipeline stopped cleanly");
            ShutdownOutcome::Completed
        } else {
            warn!(pending = ?pending, "shutdown deadline exceeded, aborted remaining stages");
            ShutdownOutcome::TimedOut { pending }
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct Pipeline {
    stages: StageSet,
}

impl Pipeline {
    /// Wire the queues and start the feed, aggregator and writer stages.
    pub fn spawn(
        config: &AppConfig,
        aggregator: Arc<WindowAggregator>,
        sink: Arc<dyn CandleSink>,
        cancel: CancellationToken,
    ) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel::<Tick>(config.buffers.tick_chan);
        let (candle_tx, candle_rx) = mpsc::channel::<Candle>(config.buffers.candle_chan);

        let mut stages = StageSet::new(cancel);

        let writer = BatchedWriter::new(sink)
            .with_batch_size(config.storage.batch_size)
            .with_flush_interval(Duration::from_millis(config.storage.flush_interval_ms))
            .with_policy(flush_policy(&config.storage));
        let token = stages.token();
        stages.spawn("writer", async move {
            let stats = writer.run(candle_rx, token).await;
            debug!(?stats, "writer stage finished");
        });

        let token = stages.token();
        stages.spawn("aggregator", async move {
            let reason = aggregator.run(tick_rx, candle_tx, token).await;
            debug!(?reason, "aggregator stage finished");
        });

        let policy = ReconnectPolicy::fixed(Duration::from_millis(config.feed.reconnect_interval_ms))
            .with_jitter(Duration::from_millis(config.feed.reconnect_jitter_ms));
        let token = stages.token();
        stages.spawn(
            "feeds",
            run_feeds(
                config.feed.url.clone(),
                config.feed.symbols.clone(),
                policy,
                tick_tx,
                token,
            ),
        );

        info!(
            symbols = ?config.feed.symbols,
            tick_chan = config.buffers.tick_chan,
            candle_chan = config.buffers.candle_chan,
            "pipeline started"
        );
        Self { stages }
    }

    /// Run an extra stage (e.g. an HTTP server) under the same token and
    /// shutdown deadline.
    pub fn spawn_stage<F>(&mut self, name: impl Into<String>, stage: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.stages.spawn(name, stage);
    }

    pub async fn shutdown(self, timeout: Duration) -> ShutdownOutcome {
        self.stages.shutdown(timeout).await
    }
}

fn flush_policy(storage: &StorageConfig) -> FlushPolicy {
    if storage.retry_attempts == 0 {
        FlushPolicy::DropOnFailure
    } else {
        FlushPolicy::RetryWithBackoff {
            attempts: storage.retry_attempts,
            backoff: Duration::from_millis(storage.retry_backoff_ms),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::WallClock;
    use crate::persistence::SqliteCandleStore;
    use chrono::{DateTime, TimeZone, Utc};
    use futures_util::{SinkExt, StreamExt};
    use rust_decimal::Decimal;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    struct FixedClock(DateTime<Utc>);

    impl WallClock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[tokio::test]
    async fn cooperative_stages_complete() {
        let mut stages = StageSet::new(CancellationToken::new());
        for name in ["a", "b"] {
            let token = stages.token();
            stages.spawn(name, async move { token.cancelled().await });
        }

        let outcome = stages.shutdown(Duration::from_secs(1)).await;
        assert_eq!(outcome, ShutdownOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_stage_times_out_and_is_named() {
        let mut stages = StageSet::new(CancellationToken::new());
        let token = stages.token();
        stages.spawn("polite", async move { token.cancelled().await });
        stages.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = Instant::now();
        let outcome = stages.shutdown(SHUTDOWN_TIMEOUT).await;
        assert_eq!(
            outcome,
            ShutdownOutcome::TimedOut {
                pending: vec!["stuck".to_string()]
            }
        );
        assert!(started.elapsed() >= SHUTDOWN_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(3600));
    }

    #[test]
    fn zero_retries_selects_drop_policy() {
        let mut storage = StorageConfig::default();
        assert_eq!(flush_policy(&storage), FlushPolicy::DropOnFailure);

        storage.retry_attempts = 3;
        storage.retry_backoff_ms = 250;
        assert_eq!(
            flush_policy(&storage),
            FlushPolicy::RetryWithBackoff {
                attempts: 3,
                backoff: Duration::from_millis(250)
            }
        );
    }

    /// Feed that sends `messages` on every connection and holds it open.
    async fn spawn_feed(messages: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
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
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn ticks_flow_through_to_storage_on_shutdown() {
        let window = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t0 = window.timestamp_millis();
        let messages = [("100", 0), ("110", 10_000), ("90", 20_000)]
            .into_iter()
            .map(|(p, dt)| {
                serde_json::json!({"e": "aggTrade", "s": "BTCUSDT", "p": p, "q": "1", "T": t0 + dt})
                    .to_string()
            })
            .collect();

        let mut config = AppConfig::default();
        config.feed.url = spawn_feed(messages).await;
        config.feed.symbols = vec!["BTCUSDT".into()];

        // The wall clock never passes the window end, so only the shutdown
        // flush can finalize the candle.
        let clock = Arc::new(FixedClock(window + chrono::Duration::seconds(30)));
        let aggregator = Arc::new(WindowAggregator::with_clock(clock, Duration::from_millis(50)));
        let store = Arc::new(SqliteCandleStore::open_in_memory().unwrap());

        let pipeline = Pipeline::spawn(
            &config,
            aggregator.clone(),
            store.clone(),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if aggregator.current("BTCUSDT").map(|c| c.volume) == Some(Decimal::from(3)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("ticks never reached the aggregator");
        assert_eq!(store.count().await.unwrap(), 0);

        let outcome = pipeline.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome, ShutdownOutcome::Completed);

        let stored = store.load("BTCUSDT", window).await.unwrap().unwrap();
        assert_eq!(stored.open, Decimal::from(100));
        assert_eq!(stored.high, Decimal::from(110));
        assert_eq!(stored.low, Decimal::from(90));
        assert_eq!(stored.close, Decimal::from(90));
        assert_eq!(stored.volume, Decimal::from(3));
        assert!(aggregator.current("BTCUSDT").is_none());
    }
}
