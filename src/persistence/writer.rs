//! Batched writer stage: finalized candles in, bulk upserts out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::CandleSink;
use crate::types::Candle;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// What to do when a flush fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Log and drop the batch. Persistence is best effort.
    #[default]
    DropOnFailure,
    /// Retry the same batch up to `attempts` more times, sleeping `backoff`
    /// between tries, then drop it.
    RetryWithBackoff { attempts: u32, backoff: Duration },
}

impl FlushPolicy {
    fn total_attempts(&self) -> u32 {
        match self {
            Self::DropOnFailure => 1,
            Self::RetryWithBackoff { attempts, .. } => attempts + 1,
        }
    }

    fn backoff(&self) -> Duration {
        match self {
            Self::DropOnFailure => Duration::ZERO,
            Self::RetryWithBackoff { backoff, .. } => *backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub received: u64,
    pub flushes: u64,
    pub persisted: u64,
    pub failed_flushes: u64,
    pub dropped: u64,
}

pub struct BatchedWriter {
    sink: Arc<dyn CandleSink>,
    batch_size: usize,
    flush_interval: Duration,
    policy: FlushPolicy,
}

impl BatchedWriter {
    pub fn new(sink: Arc<dyn CandleSink>) -> Self {
        Self {
            sink,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            policy: FlushPolicy::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_policy(mut self, policy: FlushPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Consume `candles` until the queue closes.
    ///
    /// Cancellation flushes whatever is already batched right away, then
    /// keeps reading until the aggregator closes the queue after its own
    /// shutdown flush. A final flush always runs before returning.
    pub async fn run(self, mut candles: mpsc::Receiver<Candle>, cancel: CancellationToken) -> WriterStats {
        info!(
            backend = self.sink.backend_type(),
            batch_size = self.batch_size,
            flush_ms = self.flush_interval.as_millis() as u64,
            "persistence worker started"
        );

        let mut stats = WriterStats::default();
        let mut batch: Vec<Candle> = Vec::with_capacity(self.batch_size);
        let mut draining = false;

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe = candles.recv() => match maybe {
                    Some(candle) => {
                        stats.received += 1;
                        batch.push(candle);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch, &mut stats).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch, &mut stats).await;
                    }
                }
                _ = cancel.cancelled(), if !draining => {
                    draining = true;
                    debug!(pending = batch.len(), "cancellation received, flushing and draining");
                    self.flush(&mut batch, &mut stats).await;
                }
            }
        }

        if !batch.is_empty() {
            let n = batch.len();
            self.flush(&mut batch, &mut stats).await;
            info!(count = n, "persisted final batch");
        }

        info!(
            received = stats.received,
            flushes = stats.flushes,
            persisted = stats.persisted,
            failed_flushes = stats.failed_flushes,
            dropped = stats.dropped,
            "persistence worker stopped"
        );
        stats
    }

    async fn flush(&self, batch: &mut Vec<Candle>, stats: &mut WriterStats) {
        if batch.is_empty() {
            return;
        }

        let attempts = self.policy.total_attempts();
        for attempt in 1..=attempts {
            match self.sink.persist_batch(batch).await {
                Ok(inserted) => {
                    stats.flushes += 1;
                    stats.persisted += inserted as u64;
                    info!(batch = batch.len(), inserted, "persisted candles");
                    batch.clear();
                    return;
                }
                Err(e) => {
                    error!(attempt, attempts, error = %e, "persistence error");
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff()).await;
                    }
                }
            }
        }

        stats.failed_flushes += 1;
        stats.dropped += batch.len() as u64;
        warn!(dropped = batch.len(), "dropping candle batch after failed flush");
        batch.clear();
    }
}
