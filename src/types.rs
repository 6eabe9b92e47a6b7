// =============================================================================
// Shared types used across the Candle Forge pipeline
// =============================================================================

use chrono::{DateTime, Duration, DurationRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Width of every aggregation window.
pub const WINDOW_SECS: i64 = 60;

/// The aggregation window as a `chrono::Duration`.
pub fn window_duration() -> Duration {
    Duration::seconds(WINDOW_SECS)
}

/// Truncate `ts` down to the start of the window that contains it.
pub fn window_start_for(ts: DateTime<Utc>) -> DateTime<Utc> {
    // duration_trunc only fails for out-of-range timestamps; fall back to
    // integer arithmetic on the millisecond epoch in that case.
    ts.duration_trunc(window_duration()).unwrap_or_else(|_| {
        let ms = ts.timestamp_millis();
        let start = ms - ms.rem_euclid(WINDOW_SECS * 1_000);
        DateTime::from_timestamp_millis(start).unwrap_or(ts)
    })
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// A single trade observed on the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub event_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WindowKey
// ---------------------------------------------------------------------------

/// Identity of a candle for its entire lifecycle.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WindowKey {
    pub instrument: String,
    pub window_start: DateTime<Utc>,
}

impl WindowKey {
    pub fn for_tick(tick: &Tick) -> Self {
        Self {
            instrument: tick.instrument.clone(),
            window_start: window_start_for(tick.event_time),
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.window_start.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// OHLCV summary of every tick within one window for one instrument.
///
/// While `finalized == false` the candle lives in the aggregator's store and
/// is updated in place. Once finalized it is an immutable snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub finalized: bool,
}

impl Candle {
    /// Open a new candle from the first tick seen for `key`.
    pub fn open_with(key: &WindowKey, tick: &Tick) -> Self {
        Self {
            instrument: key.instrument.clone(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.quantity,
            window_start: key.window_start,
            window_end: key.window_start + window_duration(),
            finalized: false,
        }
    }

    /// Fold a later tick of the same window into the candle.
    pub fn apply(&mut self, tick: &Tick) {
        if tick.price > self.high {
            self.high = tick.price;
        }
        if tick.price < self.low {
            self.low = tick.price;
        }
        self.close = tick.price;
        self.volume += tick.quantity;
    }

    pub fn key(&self) -> WindowKey {
        WindowKey {
            instrument: self.instrument.clone(),
            window_start: self.window_start,
        }
    }
}
