//! Storage layer for checkline.
//!
//! This module provides the `SQLite`-backed local persistent store: the
//! submission queue with its attachment blobs, the audit timeline, and the
//! crash-recovery snapshots of in-progress checklists.

mod lease;
pub mod migrations;
mod queue;
pub mod schema;
mod snapshots;
mod timeline;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use lease::DrainLease;

/// How long a write waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Local persistent store for queued submissions.
///
/// Provides durable storage using `SQLite` with support for:
/// - Atomic enqueue of a submission together with its photo blobs
/// - FIFO listing of deliverable submissions
/// - Status transitions written together with their timeline event
/// - Crash-recovery snapshots of in-progress checklists
///
/// The connection sits behind a mutex so one store can be shared between
/// the sync orchestrator and the UI; each operation holds it for a single
/// transaction. Several processes may open the same file; writes take the
/// database lock up front and only the holder of the [`DrainLease`] delivers.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening queue database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // FULL sync: a queued submission must survive power loss, not just a crash.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )?;

        migrations::initialize_schema(&conn)?;

        info!("Queue database opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the connection for one operation.
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("queue database lock poisoned"))
    }

    /// Get queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn()?;

        let count_status = |status: &str| -> Result<u64> {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM submissions WHERE status = ?1",
                [status],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or(0))
        };
        let pending = count_status("pending")?;
        let syncing = count_status("syncing")?;
        let failed = count_status("error")?;

        let (attachments, attachment_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM attachments",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let timeline_events: i64 =
            conn.query_row("SELECT COUNT(*) FROM timeline_events", [], |row| row.get(0))?;

        let oldest: Option<String> = conn
            .query_row(
                "SELECT finalized_at FROM submissions ORDER BY finalized_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let oldest_finalized = oldest
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            pending,
            syncing,
            failed,
            attachments: u64::try_from(attachments).unwrap_or(0),
            attachment_bytes: u64::try_from(attachment_bytes).unwrap_or(0),
            timeline_events: u64::try_from(timeline_events).unwrap_or(0),
            oldest_finalized,
            db_size_bytes,
        })
    }
}

/// Begin a transaction that takes the write lock immediately.
///
/// A deferred transaction that reads before writing can fail outright when
/// another process commits in between; an immediate one waits its turn.
pub(crate) fn write_tx(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Run a store operation on the blocking thread pool.
///
/// Keeps `SQLite` I/O off the async executor so a drain pass suspends at
/// every durable-store access instead of stalling other tasks.
///
/// # Errors
///
/// Returns the operation's error, or [`Error::Internal`] if the blocking task panicked.
pub async fn blocking<T, F>(storage: &Arc<Storage>, op: F) -> Result<T>
where
    F: FnOnce(&Storage) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let storage = Arc::clone(storage);
    tokio::task::spawn_blocking(move || op(&storage))
        .await
        .map_err(|e| Error::internal(format!("store task failed: {e}")))?
}

/// Statistics about the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Submissions waiting for a first attempt.
    pub pending: u64,
    /// Submissions with an attempt in progress.
    pub syncing: u64,
    /// Submissions whose last attempt failed.
    pub failed: u64,
    /// Queued photos.
    pub attachments: u64,
    /// Total size of queued photos.
    pub attachment_bytes: u64,
    /// Timeline events recorded, including those of delivered submissions.
    pub timeline_events: u64,
    /// Finalize time of the oldest queued submission.
    pub oldest_finalized: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// Format a timestamp with fixed width so lexical order matches time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp inside a row mapper.
pub(crate) fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Build a conversion error for an unrecognised enum value in a column.
pub(crate) fn invalid_column(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {what}: {value}").into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory();
        assert!(storage.is_ok());
    }

    #[test]
    fn test_path() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.path().to_string_lossy(), ":memory:");
    }

    #[test]
    fn test_stats_empty() {
        let storage = Storage::open_in_memory().unwrap();
        let stats = storage.stats().unwrap();

        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.attachments, 0);
        assert!(stats.oldest_finalized.is_none());
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested_path = dir.path().join("nested/deeper/queue.db");

        let storage = Storage::open(&nested_path).unwrap();
        assert!(nested_path.exists());
        assert_eq!(storage.path(), nested_path);
    }

    #[test]
    fn test_open_file_based_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("queue.db")).unwrap();

        let stats = storage.stats().unwrap();
        assert!(stats.db_size_bytes > 0);
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let (fa, fb) = (format_timestamp(&a), format_timestamp(&b));
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(parse_timestamp(0, &fa).unwrap(), a);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp(3, "yesterday").is_err());
    }

    #[tokio::test]
    async fn test_blocking_runs_operation() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let stats = blocking(&storage, |s| s.stats()).await.unwrap();
        assert_eq!(stats.pending, 0);
    }
}
