//! Connection pool setup.
//!
//! The pool is the sole path to the database file: bounded capacity,
//! blocking acquisition with a timeout, and scoped release (handles return
//! their connection when dropped). After `close()` further acquisitions
//! fail while in-flight handles still release cleanly.

use std::cmp;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use dht_core::StorageError;

/// How long an acquisition may wait before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool capacity: `max(4, hardware_concurrency)`.
#[allow(clippy::cast_possible_truncation)]
pub fn pool_capacity() -> u32 {
    cmp::max(4, num_cpus::get() as u32)
}

/// Open (creating if missing) the archive file and build the pool around it.
///
/// Foreign keys are enabled per connection; the blob cascade in the
/// download tables depends on it. WAL keeps readers unblocked during the
/// long write transactions of message ingest.
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool, StorageError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Storage(format!("creating {}: {e}", parent.display())))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(pool_capacity())
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::Storage(e.to_string()))
}

/// In-memory pool for tests.
///
/// A single connection so every query sees the same database; SQLite gives
/// each new in-memory connection its own empty file otherwise.
pub async fn create_memory_pool() -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::Storage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_has_a_floor_of_four() {
        assert!(pool_capacity() >= 4);
    }

    #[tokio::test]
    async fn memory_pool_shares_one_database() {
        let pool = create_memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (x) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquisition() {
        let pool = create_memory_pool().await.unwrap();
        pool.close().await;
        assert!(pool.acquire().await.is_err());
    }
}
