//! SQLite backend for finalized candles.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::{CandleSink, StorageError};
use crate::types::Candle;

/// Ordered schema migrations. Index + 1 is the version stored in
/// `PRAGMA user_version`.
const MIGRATIONS: &[&str] = &[include_str!("migrations/0001_create_candlesticks.sql")];

const INSERT_SQL: &str = "INSERT INTO candlesticks
     (instrument, open, high, low, close, volume, window_start, window_end, inserted_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT (instrument, window_start) DO NOTHING";

pub struct SqliteCandleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCandleStore {
    /// Open (or create) the database at `path` and bring its schema up to
    /// date. Any failure here is fatal for startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "SQLite candle store ready");
        Ok(store)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StorageError> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of stored candles.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<i64, StorageError> {
            let conn = conn.lock();
            let n = conn.query_row("SELECT COUNT(*) FROM candlesticks", [], |row| row.get(0))?;
            Ok(n)
        })
        .await?
    }
}

#[async_trait]
impl CandleSink for SqliteCandleStore {
    async fn persist_batch(&self, candles: &[Candle]) -> Result<usize, StorageError> {
        if candles.is_empty() {
            return Ok(0);
        }
        let conn = Arc::clone(&self.conn);
        let rows = candles.to_vec();
        tokio::task::spawn_blocking(move || insert_batch(&mut conn.lock(), &rows)).await?
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

fn insert_batch(conn: &mut Connection, candles: &[Candle]) -> Result<usize, StorageError> {
    let inserted_at = Utc::now().timestamp_millis();
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare_cached(INSERT_SQL)?;
        for c in candles {
            inserted += stmt.execute(params![
                c.instrument,
                c.open.to_string(),
                c.high.to_string(),
                c.low.to_string(),
                c.close.to_string(),
                c.volume.to_string(),
                c.window_start.timestamp_millis(),
                c.window_end.timestamp_millis(),
                inserted_at,
            ])?;
        }
    }
    tx.commit()?;
    debug!(batch = candles.len(), inserted, "candle batch committed");
    Ok(inserted)
}

fn run_migrations(conn: &mut Connection) -> Result<(), StorageError> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|source| StorageError::Migration { version, source })?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(version, "applied schema migration");
    }
    Ok(())
}
