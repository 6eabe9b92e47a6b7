// =============================================================================
// Shared state for the query surface
// =============================================================================
//
// Handed to every axum handler as `State<Arc<AppState>>`. The aggregator is
// the only piece of pipeline state exposed here, and only through its
// read-only query methods.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::WindowAggregator;
use crate::config::AppConfig;
use crate::health::{self, HealthReport};

pub struct AppState {
    pub aggregator: Arc<WindowAggregator>,

    /// Staleness threshold for both health endpoints.
    pub data_timeout: Duration,

    /// Poll cadence of the candle stream.
    pub stream_interval: Duration,

    /// Cancelled on process shutdown; open streams end when it fires.
    pub shutdown: CancellationToken,

    /// Currently connected streaming clients.
    pub stream_clients: AtomicU64,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        aggregator: Arc<WindowAggregator>,
        config: &AppConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            aggregator,
            data_timeout: config.data_timeout(),
            stream_interval: Duration::from_millis(config.api.stream_interval_ms),
            shutdown,
            stream_clients: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn health(&self) -> HealthReport {
        health::evaluate(
            self.aggregator.last_activity_time(),
            Utc::now(),
            self.data_timeout,
        )
    }

    pub fn stream_client_count(&self) -> u64 {
        self.stream_clients.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
