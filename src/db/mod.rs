//! Queue store: SQLite connection pool, migrations, and health check.
//!
//! Every worker process opens its own pool against the same database file.
//! WAL mode lets readers proceed while one writer holds the lock; the busy
//! timeout turns write contention into claim latency instead of errors.

pub mod stats;
pub mod tasks;
pub mod workers;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::{Error, Result};

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Database handle. Owns the connection pool.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Connect using a URL such as `sqlite://tasks.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?;
        if url.contains(":memory:") {
            return Self::connect_memory(options).await;
        }
        Self::connect_with(options.create_if_missing(true)).await
    }

    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    /// Private in-memory database (for testing). Single connection so every
    /// query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect_memory(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    async fn connect_memory(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Timestamp encoding
// ---------------------------------------------------------------------------

/// Fixed-width UTC RFC 3339, so text order matches time order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid {column} timestamp {raw:?}: {e}")))
}

pub(crate) fn decode_opt_ts(column: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| decode_ts(column, &s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_timestamps_sort_chronologically() {
        let a = Utc::now();
        let b = a + chrono::Duration::microseconds(1);
        let c = a + chrono::Duration::seconds(10);
        assert!(encode_ts(a) < encode_ts(b));
        assert!(encode_ts(b) < encode_ts(c));
        assert_eq!(encode_ts(a).len(), encode_ts(c).len());
    }

    #[test]
    fn timestamps_round_trip_at_microsecond_precision() {
        let ts = Utc::now();
        let back = decode_ts("created_at", &encode_ts(ts)).unwrap();
        assert_eq!(back.timestamp_micros(), ts.timestamp_micros());
    }

    #[tokio::test]
    async fn in_memory_database_migrates_and_answers() {
        let db = Db::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.health_check().await.unwrap();
    }
}
