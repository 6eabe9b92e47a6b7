// =============================================================================
// Configuration: JSON file + environment overrides
// =============================================================================
//
// Every field carries `#[serde(default)]` so that a partial (or empty) file
// still yields a complete configuration. Environment variables win over the
// file; see `apply_env_overrides`.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "candle_forge.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_feed_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_reconnect_interval_ms() -> u64 {
    1_000
}

fn default_tick_chan() -> usize {
    1_000
}

fn default_candle_chan() -> usize {
    500
}

fn default_db_path() -> String {
    "data/candles.db".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_stream_interval_ms() -> u64 {
    1_000
}

fn default_health_bind_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_data_timeout_secs() -> u64 {
    300
}

fn default_shutdown_timeout_secs() -> u64 {
    crate::pipeline::SHUTDOWN_TIMEOUT.as_secs()
}

// =============================================================================
// Sections
// =============================================================================

/// Upstream trade feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Base websocket URL; the per-instrument path is appended.
    #[serde(default = "default_feed_url")]
    pub url: String,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Fixed wait between connection attempts.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Upper bound of random jitter added to each wait. 0 disables it.
    #[serde(default)]
    pub reconnect_jitter_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            symbols: default_symbols(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            reconnect_jitter_ms: 0,
        }
    }
}

/// Capacities of the bounded inter-stage queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_tick_chan")]
    pub tick_chan: usize,

    #[serde(default = "default_candle_chan")]
    pub candle_chan: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            tick_chan: default_tick_chan(),
            candle_chan: default_candle_chan(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Extra attempts per failed flush. 0 drops the batch on first failure.
    #[serde(default)]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            retry_attempts: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind_addr")]
    pub bind_addr: String,

    /// Poll cadence of the candle streaming endpoint.
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_api_bind_addr(),
            stream_interval_ms: default_stream_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Listener for the plain 200/503 probe.
    #[serde(default = "default_health_bind_addr")]
    pub bind_addr: String,

    /// Maximum tolerated gap since the last tick before reporting unhealthy.
    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_health_bind_addr(),
            data_timeout_secs: default_data_timeout_secs(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub buffers: BufferConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            buffers: BufferConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            health: HealthConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`.
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged. A file that exists but cannot be parsed is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config JSON from {}", path.display()))?;

        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Apply `CANDLE_FORGE_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(syms) = lookup("CANDLE_FORGE_SYMBOLS") {
            self.feed.symbols = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(url) = lookup("CANDLE_FORGE_FEED_URL") {
            self.feed.url = url;
        }
        if let Some(db) = lookup("CANDLE_FORGE_DB_PATH") {
            self.storage.db_path = db;
        }
        if let Some(addr) = lookup("CANDLE_FORGE_BIND_ADDR") {
            self.api.bind_addr = addr;
        }
        if let Some(addr) = lookup("CANDLE_FORGE_HEALTH_ADDR") {
            self.health.bind_addr = addr;
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.feed.symbols.is_empty() {
            bail!("feed.symbols must name at least one instrument");
        }
        if self.buffers.tick_chan == 0 || self.buffers.candle_chan == 0 {
            bail!("queue capacities must be non-zero");
        }
        if self.storage.batch_size == 0 {
            bail!("storage.batch_size must be non-zero");
        }
        if self.storage.flush_interval_ms == 0 || self.api.stream_interval_ms == 0 {
            bail!("intervals must be non-zero");
        }
        Ok(())
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.health.data_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
