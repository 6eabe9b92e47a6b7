// =============================================================================
// Window Aggregator: ticks in, finalized one-minute candles out
// =============================================================================
//
// Two separate clocks are in play:
//   - the *wall clock* (`WallClock`) decides when a window has expired;
//   - the *event clock* (tick `event_time`) drives `last_activity_time`,
//     which feeds the health checks.
// =============================================================================

mod store;

pub use store::{CandleStore, TickOutcome};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{Candle, Tick};

/// Default cadence of the finalize sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Source of "now" for window expiry.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Why the aggregator loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    InputClosed,
}

pub struct WindowAggregator {
    store: CandleStore,
    clock: Arc<dyn WallClock>,
    sweep_interval: Duration,
}

impl Default for WindowAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowAggregator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), SWEEP_INTERVAL)
    }

    pub fn with_clock(clock: Arc<dyn WallClock>, sweep_interval: Duration) -> Self {
        Self {
            store: CandleStore::new(),
            clock,
            sweep_interval,
        }
    }

    // -------------------------------------------------------------------------
    // Mutating path (aggregator loop only)
    // -------------------------------------------------------------------------

    pub fn process_tick(&self, tick: &Tick) -> TickOutcome {
        let outcome = self.store.apply_tick(tick);
        match outcome {
            TickOutcome::Opened => debug!(
                instrument = %tick.instrument,
                event_time = %tick.event_time,
                "opened candle"
            ),
            TickOutcome::Late => warn!(
                instrument = %tick.instrument,
                event_time = %tick.event_time,
                skipped = self.store.late_ticks(),
                "dropping tick for an already finalized window"
            ),
            TickOutcome::Updated => {}
        }
        outcome
    }

    /// Finalize every live candle whose window ended before `now`.
    pub fn finalize_expired(&self, now: DateTime<Utc>) -> Vec<Candle> {
        self.store.take_expired(now)
    }

    /// Finalize every live candle, elapsed or not.
    pub fn finalize_all(&self) -> Vec<Candle> {
        self.store.take_all()
    }

    // -------------------------------------------------------------------------
    // Query surface (any task)
    // -------------------------------------------------------------------------

    /// Snapshot of the in-progress candle for `instrument`. Never finalized.
    pub fn current(&self, instrument: &str) -> Option<Candle> {
        self.store.current(instrument)
    }

    /// Event time of the most recent tick, `None` before the first tick.
    pub fn last_activity_time(&self) -> Option<DateTime<Utc>> {
        self.store.last_activity()
    }

    pub fn live_count(&self) -> usize {
        self.store.len()
    }

    pub fn late_tick_count(&self) -> u64 {
        self.store.late_ticks()
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Consume `ticks` until cancellation or input closure, emitting
    /// finalized candles on `candles`. `candles` is dropped on return, which
    /// closes the downstream queue.
    pub async fn run(
        self: Arc<Self>,
        mut ticks: mpsc::Receiver<Tick>,
        candles: mpsc::Sender<Candle>,
        cancel: CancellationToken,
    ) -> StopReason {
        info!(sweep_ms = self.sweep_interval.as_millis() as u64, "aggregator started");

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                maybe = ticks.recv() => match maybe {
                    Some(tick) => {
                        self.process_tick(&tick);
                    }
                    None => break StopReason::InputClosed,
                },
                _ = sweep.tick() => {
                    let expired = self.finalize_expired(self.clock.now());
                    if !expired.is_empty() && !emit(&candles, expired).await {
                        warn!("candle queue closed during sweep, stopping aggregator");
                        break StopReason::InputClosed;
                    }
                }
                _ = cancel.cancelled() => break StopReason::Cancelled,
            }
        };

        if reason == StopReason::Cancelled {
            // Ticks that were already queued still belong in their candles.
            let mut drained = 0usize;
            while let Ok(tick) = ticks.try_recv() {
                self.process_tick(&tick);
                drained += 1;
            }
            if drained > 0 {
                debug!(drained, "applied queued ticks before shutdown flush");
            }
        }

        let remaining = self.finalize_all();
        let count = remaining.len();
        if !emit(&candles, remaining).await {
            warn!(count, "candle queue closed, shutdown flush incomplete");
        }
        info!(reason = ?reason, flushed = count, "aggregator stopped");
        reason
    }
}

/// Send each candle downstream, blocking on a full queue. Returns `false` if
/// the receiver is gone.
async fn emit(candles: &mpsc::Sender<Candle>, batch: Vec<Candle>) -> bool {
    for candle in batch {
        info!(
            key = %candle.key(),
            end = %candle.window_end.to_rfc3339(),
            "finalized candle"
        );
        if candles.send(candle).await.is_err() {
            return false;
        }
    }
    true
}
