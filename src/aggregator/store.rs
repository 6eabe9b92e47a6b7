use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{Candle, Tick, WindowKey};

// ---------------------------------------------------------------------------
// CandleStore -- live (non-finalized) candles keyed by window
// ---------------------------------------------------------------------------

/// What `apply_tick` did with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Opened,
    Updated,
    /// The tick's window is at or before the newest window already finalized
    /// for its instrument. Dropped.
    Late,
}

#[derive(Default)]
struct Inner {
    live: HashMap<WindowKey, Candle>,
    /// Per instrument, the latest `window_start` already finalized.
    finalized_through: HashMap<String, DateTime<Utc>>,
    /// Event time of the most recent tick seen. Not wall clock.
    last_activity: Option<DateTime<Utc>>,
    late_ticks: u64,
}

impl Inner {
    fn mark_finalized(&mut self, candles: &[Candle]) {
        for c in candles {
            let mark = self
                .finalized_through
                .entry(c.instrument.clone())
                .or_insert(c.window_start);
            if c.window_start > *mark {
                *mark = c.window_start;
            }
        }
    }
}

/// Owned store of in-progress candles.
///
/// Concurrency contract: exactly one logical writer (the aggregator loop)
/// calls the mutating methods (`apply_tick`, `take_expired`, `take_all`);
/// any number of readers may call `current` / `last_activity` / `len`
/// concurrently. Mutations hold the write lock for the whole operation so a
/// reader never observes a half-finalized sweep. Readers always receive
/// clones, never references into the map.
#[derive(Default)]
pub struct CandleStore {
    inner: RwLock<Inner>,
}

impl CandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `tick` into the candle of its window, creating it if needed.
    /// A window that was already finalized is never reopened.
    pub fn apply_tick(&self, tick: &Tick) -> TickOutcome {
        let key = WindowKey::for_tick(tick);
        let mut inner = self.inner.write();
        inner.last_activity = Some(tick.event_time);

        if let Some(mark) = inner.finalized_through.get(&key.instrument) {
            if key.window_start <= *mark {
                inner.late_ticks += 1;
                return TickOutcome::Late;
            }
        }

        match inner.live.get_mut(&key) {
            Some(candle) => {
                candle.apply(tick);
                TickOutcome::Updated
            }
            None => {
                let candle = Candle::open_with(&key, tick);
                inner.live.insert(key, candle);
                TickOutcome::Opened
            }
        }
    }

    /// Remove and return every candle whose window ended before `now`,
    /// marked finalized, ordered by window start then instrument.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<Candle> {
        let mut inner = self.inner.write();
        let expired: Vec<WindowKey> = inner
            .live
            .iter()
            .filter(|(_, c)| c.window_end < now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut out: Vec<Candle> = expired
            .iter()
            .filter_map(|k| inner.live.remove(k))
            .map(finalize)
            .collect();
        inner.mark_finalized(&out);
        sort_for_emission(&mut out);
        out
    }

    /// Remove and return every live candle regardless of its window.
    pub fn take_all(&self) -> Vec<Candle> {
        let mut inner = self.inner.write();
        let mut out: Vec<Candle> = inner.live.drain().map(|(_, c)| finalize(c)).collect();
        inner.mark_finalized(&out);
        sort_for_emission(&mut out);
        out
    }

    /// Most recent live candle for `instrument`, if any.
    pub fn current(&self, instrument: &str) -> Option<Candle> {
        let inner = self.inner.read();
        inner
            .live
            .values()
            .filter(|c| c.instrument == instrument)
            .max_by_key(|c| c.window_start)
            .cloned()
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_activity
    }

    /// Ticks dropped because their window was already finalized.
    pub fn late_ticks(&self) -> u64 {
        self.inner.read().late_ticks
    }

    pub fn len(&self) -> usize {
        self.inner.read().live.len()
    }
}

fn finalize(mut candle: Candle) -> Candle {
    candle.finalized = true;
    candle
}

fn sort_for_emission(candles: &mut [Candle]) {
    candles.sort_by(|a, b| {
        a.window_start
            .cmp(&b.window_start)
            .then_with(|| a.instrument.cmp(&b.instrument))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn tick(sym: &str, price: i64, qty: i64, ts: DateTime<Utc>) -> Tick {
        Tick {
            instrument: sym.into(),
            price: Decimal::from(price),
            quantity: Decimal::from(qty),
            event_time: ts,
        }
    }

    #[test]
    fn ticks_in_same_window_share_a_candle() {
        let store = CandleStore::new();
        assert_eq!(
            store.apply_tick(&tick("BTCUSDT", 100, 1, at(12, 0, 0))),
            TickOutcome::Opened
        );
        assert_eq!(
            store.apply_tick(&tick("BTCUSDT", 101, 1, at(12, 0, 30))),
            TickOutcome::Updated
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn boundary_splits_windows() {
        let store = CandleStore::new();
        store.apply_tick(&tick("BTCUSDT", 100, 1, at(12, 0, 59)));
        store.apply_tick(&tick("BTCUSDT", 105, 2, at(12, 1, 1)));
        assert_eq!(store.len(), 2);

        let all = store.take_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].window_start - all[0].window_start, Duration::minutes(1));
        assert_eq!(all[0].close, Decimal::from(100));
        assert_eq!(all[1].open, Decimal::from(105));
        assert_eq!(all[1].volume, Decimal::from(2));
    }

    #[test]
    fn instruments_are_partitioned() {
        let store = CandleStore::new();
        store.apply_tick(&tick("BTCUSDT", 100, 1, at(12, 0, 0)));
        store.apply_tick(&tick("ETHUSDT", 5, 1, at(12, 0, 1)));
        assert_eq!(store.current("BTCUSDT").unwrap().high, Decimal::from(100));
        assert_eq!(store.current("ETHUSDT").unwrap().high, Decimal::from(5));
        assert!(store.current("SOLUSDT").is_none());
    }

    #[test]
    fn current_prefers_latest_window() {
        let store = CandleStore::new();
        store.apply_tick(&tick("BTCUSDT", 100, 1, at(12, 0, 10)));
        store.apply_tick(&tick("BTCUSDT", 200, 1, at(12, 1, 10)));
        let c = store.current("BTCUSDT").unwrap();
        assert_eq!(c.window_start, at(12, 1, 0));
        assert!(!c.finalized);
    }

    #[test]
    fn take_expired_only_removes_elapsed_windows() {
        let store = CandleStore::new();
        store.apply_tick(&tick("BTCUSDT", 100, 1, at(12, 0, 10)));
        store.apply_tick(&tick("BTCUSDT", 200, 1, at(12, 1, 10)));

        // window_end of the first candle is 12:01:00; exactly at the end it is
        // not yet past.
        assert!(store.take_expired(at(12, 1, 0)).is_empty());

        let expired = store.take_expired(at(12, 1, 30));
        assert_eq!(expired.len(), 1);
        assert!(expired[0].finalized);
        assert_eq!(expired[0].window_start, at(12, 0, 0));
        assert_eq!(store.len(), 1);

        // Already removed: a second sweep returns nothing for that key.
        assert!(store.take_expired(at(12, 1, 30)).is_empty());
    }

    #[test]
    fn take_all_empties_store() {
        let store = CandleStore::new();
        store.apply_tick(&tick("BTCUSDT", 1, 1, at(12, 0, 0)));
        store.apply_tick(&tick("ETHUSDT", 1, 1, at(12, 0, 0)));
        let all = store.take_all();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.finalized));
        assert_eq!(store.len(), 0);
        assert!(store.current("BTCUSDT").is_none());
    }

    #[test]
    fn last_activity_follows_event_time() {
        let store = CandleStore::new();
        assert!(store.last_activity().is_none());
        store.apply_tick(&tick("BTCUSDT", 1, 1, at(9, 30, 0)));
        assert_eq!(store.last_activity(), Some(at(9, 30, 0)));
    }

    #[test]
    fn finalized_window_is_never_reopened() {
        let store = CandleStore::new();
        store.apply_tick(&tick("BTCUSDT", 100, 1, at(12, 0, 10)));
        assert_eq!(store.take_expired(at(12, 1, 1)).len(), 1);

        // Same window, and an even older one, arrive after finalization.
        assert_eq!(
            store.apply_tick(&tick("BTCUSDT", 50, 1, at(12, 0, 30))),
            TickOutcome::Late
        );
        assert_eq!(
            store.apply_tick(&tick("BTCUSDT", 40, 1, at(11, 59, 0))),
            TickOutcome::Late
        );
        assert_eq!(store.late_ticks(), 2);
        assert_eq!(store.len(), 0);
        assert!(store.take_expired(at(12, 1, 2)).is_empty());

        // Later windows and other instruments are unaffected.
        assert_eq!(
            store.apply_tick(&tick("BTCUSDT", 60, 1, at(12, 1, 5))),
            TickOutcome::Opened
        );
        assert_eq!(
            store.apply_tick(&tick("ETHUSDT", 3, 1, at(12, 0, 30))),
            TickOutcome::Opened
        );
    }

    #[test]
    fn shutdown_flush_also_sets_watermark() {
        let store = CandleStore::new();
        store.apply_tick(&tick("BTCUSDT", 100, 1, at(12, 0, 10)));
        assert_eq!(store.take_all().len(), 1);
        assert_eq!(
            store.apply_tick(&tick("BTCUSDT", 101, 1, at(12, 0, 20))),
            TickOutcome::Late
        );
    }
}
