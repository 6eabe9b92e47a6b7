//! Durable storage for finalized candles.
//!
//! The aggregator and feed stages never see storage directly: the batched
//! writer talks to a [`CandleSink`], and the failure policy lives in the
//! writer, not in the sink.

pub mod sqlite;
pub mod writer;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Candle;

pub use sqlite::SqliteCandleStore;
pub use writer::{BatchedWriter, FlushPolicy};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: rusqlite::Error,
    },

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Write contract for finalized candles.
///
/// `persist_batch` must be idempotent on `(instrument, window_start)`:
/// persisting a candle that is already stored is a successful no-op.
#[async_trait]
pub trait CandleSink: Send + Sync {
    /// Persist `candles` as a single unit. Returns the number of rows that
    /// were newly inserted.
    async fn persist_batch(&self, candles: &[Candle]) -> Result<usize, StorageError>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}
