//! Persistent single-writer store on embedded SQLite.
//!
//! One writer connection guarded by a mutex is the crate's single write
//! serialization point; a second read-only connection serves lookups while a
//! write transaction is open (WAL). Contending writers do not queue blindly:
//! `transaction` takes the lock with `try_lock` and surfaces [`StoreError::Busy`]
//! so callers retry with bounded backoff instead of piling up behind a stuck
//! writer. All I/O runs on the blocking pool, keeping the async runtime free
//! during disk access.
//!
//! Corruption is terminal: detected at open via `PRAGMA quick_check`, or in
//! flight via SQLite's corruption codes, after which the store refuses new
//! writes until an operator intervenes.

/// Schema creation and column backfill
pub mod migrations;
/// Row types
pub mod models;
/// SQL query functions
pub mod queries;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info, warn};

use crate::error::CoreError;
use crate::query::Query;
use self::models::{QueryRecord, QueryStatus, StoreStats, User};

/// Initial backoff when a write hits a busy store.
const WRITE_RETRY_BASE_MS: u64 = 50;
/// Backoff ceiling for busy-store retries.
const WRITE_RETRY_MAX_MS: u64 = 1_000;
/// Retry attempts before a busy store error is surfaced.
const WRITE_RETRY_ATTEMPTS: usize = 5;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another write transaction holds the write lock right now.
    #[error("store is busy, another write transaction is active")]
    Busy,
    /// The database file failed an integrity check.
    #[error("store corrupt: {0}")]
    Corrupt(String),
    /// A connection mutex was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    LockPoisoned,
    /// The blocking task running the operation was cancelled or panicked.
    #[error("store task failed: {0}")]
    Join(String),
    /// Any other SQLite failure.
    #[error("sqlite error: {0}")]
    Other(#[source] rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        if let rusqlite::Error::SqliteFailure(inner, _) = &err {
            match inner.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => return Self::Busy,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    return Self::Corrupt(err.to_string())
                }
                _ => {}
            }
        }
        Self::Other(err)
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy => Self::StoreBusy,
            StoreError::Corrupt(msg) => Self::StoreCorrupt(msg),
            StoreError::LockPoisoned | StoreError::Join(_) => Self::Internal(err.to_string()),
            StoreError::Other(inner) => Self::StoreFailed(inner.to_string()),
        }
    }
}

/// Handle to the embedded database.
///
/// Exclusively owned by whoever constructs it; components receive an
/// explicit `Arc<Store>`, never an ambient global.
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    poisoned: Arc<AtomicBool>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if missing) and migrate the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] when the file is not a healthy SQLite
    /// database; this is fatal and must reach the operator.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let writer = Connection::open(&path)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;

        let verdict: String = writer.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(StoreError::Corrupt(verdict));
        }

        migrations::run(&writer)?;

        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        info!(path = %path.display(), "database opened");
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            poisoned: Arc::new(AtomicBool::new(false)),
            path,
        })
    }

    /// Whether the store has seen corruption and refuses writes.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Database file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read-only operation on the blocking pool.
    pub async fn with_read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let reader = Arc::clone(&self.reader);
        run_blocking(move || {
            let conn = reader.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&conn)
        })
        .await
    }

    /// Run a write operation inside a scoped immediate transaction.
    ///
    /// The write lock is released on every exit path: commit on success,
    /// rollback when the closure or the commit fails. If another write
    /// transaction is active the call fails fast with [`StoreError::Busy`]
    /// instead of queueing; combine with [`Store::with_busy_retry`] for the
    /// bounded-backoff behavior the dispatcher uses.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_poisoned() {
            return Err(StoreError::Corrupt(
                "store previously reported corruption, writes are halted".into(),
            ));
        }

        let writer = Arc::clone(&self.writer);
        let result = run_blocking(move || {
            let mut conn = match writer.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Err(StoreError::Busy),
                Err(TryLockError::Poisoned(_)) => return Err(StoreError::LockPoisoned),
            };
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await;

        if let Err(StoreError::Corrupt(msg)) = &result {
            self.poisoned.store(true, Ordering::Release);
            error!(error = %msg, "store corruption detected, halting writes");
        }
        result
    }

    /// Retry a store operation while it keeps reporting a busy writer.
    ///
    /// Exponential backoff with jitter, capped attempts; any other error
    /// breaks out immediately.
    pub async fn with_busy_retry<T, F, Fut>(operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let strategy = ExponentialBackoff::from_millis(WRITE_RETRY_BASE_MS)
            .max_delay(Duration::from_millis(WRITE_RETRY_MAX_MS))
            .map(jitter)
            .take(WRITE_RETRY_ATTEMPTS);

        RetryIf::spawn(strategy, operation, |err: &StoreError| {
            matches!(err, StoreError::Busy)
        })
        .await
    }

    /// Create the user on first contact or refresh its activity bookkeeping,
    /// returning the row as stored.
    pub async fn touch_user(
        &self,
        user_id: i64,
        username: Option<String>,
        first_name: Option<String>,
    ) -> Result<User, StoreError> {
        self.transaction(move |tx| {
            let now = Utc::now();
            queries::touch_user(tx, user_id, username.as_deref(), first_name.as_deref(), now)?;
            queries::get_user(tx, user_id)?.ok_or_else(|| {
                StoreError::Other(rusqlite::Error::QueryReturnedNoRows)
            })
        })
        .await
    }

    /// Fetch a user without writing anything.
    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        self.with_read(move |conn| queries::get_user(conn, user_id)).await
    }

    /// Open a pending query record for a dispatched lookup and persist the
    /// audit copy of the user's rate window in the same transaction.
    pub async fn begin_lookup(
        &self,
        user_id: i64,
        query: &Query,
        window: Duration,
    ) -> Result<i64, StoreError> {
        let query = query.clone();
        self.transaction(move |tx| {
            let now = Utc::now();
            queries::record_window(tx, user_id, window, now)?;
            queries::insert_query(tx, user_id, &query, now)
        })
        .await
    }

    /// Finalize a pending record as successful, storing the payload inline
    /// (not-found results finalize successful with no payload).
    pub async fn complete_lookup(&self, id: i64, result: Option<Value>) -> Result<(), StoreError> {
        self.finalize(id, QueryStatus::Success, result).await
    }

    /// Finalize a pending record as failed.
    pub async fn fail_lookup(&self, id: i64) -> Result<(), StoreError> {
        self.finalize(id, QueryStatus::Failed, None).await
    }

    async fn finalize(
        &self,
        id: i64,
        status: QueryStatus,
        result: Option<Value>,
    ) -> Result<(), StoreError> {
        let finalized = self
            .transaction(move |tx| {
                queries::finalize_query(tx, id, status, result.as_ref(), Utc::now())
            })
            .await?;
        if !finalized {
            warn!(record_id = id, "query record was already finalized");
        }
        Ok(())
    }

    /// Fetch one query record.
    pub async fn record_by_id(&self, id: i64) -> Result<Option<QueryRecord>, StoreError> {
        self.with_read(move |conn| queries::query_by_id(conn, id)).await
    }

    /// Recent query records for a user, newest first.
    pub async fn list_by_user(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<QueryRecord>, StoreError> {
        self.with_read(move |conn| queries::list_by_user(conn, user_id, limit))
            .await
    }

    /// Soft-disable or re-enable a user. Returns false for unknown users.
    pub async fn set_disabled(&self, user_id: i64, disabled: bool) -> Result<bool, StoreError> {
        self.transaction(move |tx| queries::set_disabled(tx, user_id, disabled))
            .await
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_read(queries::stats).await
    }

    /// Write a consistent snapshot of the database to `dest`.
    ///
    /// Blocks until the writer is quiescent (no open write transaction) and
    /// copies via `VACUUM INTO`, so the snapshot never contains a
    /// half-applied transaction. `dest` must not already exist.
    pub async fn backup_to(&self, dest: PathBuf) -> Result<(), StoreError> {
        let writer = Arc::clone(&self.writer);
        run_blocking(move || {
            let conn = writer.lock().map_err(|_| StoreError::LockPoisoned)?;
            let target = dest.to_string_lossy().into_owned();
            conn.execute("VACUUM INTO ?1", rusqlite::params![target])?;
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
}

/// Periodically snapshot the database into `dir`.
///
/// Each snapshot is a fresh timestamped file; failures are logged and the
/// task keeps going. Aborting the returned handle stops the cadence.
pub fn spawn_backup_task(store: Arc<Store>, dir: PathBuf, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the first backup waits a full period
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stamp = Utc::now().format("%Y%m%d-%H%M%S");
            let dest = dir.join(format!("osint-backup-{stamp}.db"));
            match store.backup_to(dest.clone()).await {
                Ok(()) => info!(path = %dest.display(), "database backup written"),
                Err(e) => warn!(error = %e, "database backup failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryKind;
    use serde_json::json;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("datatrace-test-{}.db", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_open_touch_and_read_back() {
        let store = Store::open(temp_db_path()).expect("open");

        let user = store
            .touch_user(7, Some("alice".into()), None)
            .await
            .expect("touch");
        assert_eq!(user.user_id, 7);
        assert_eq!(user.query_count, 1);

        let fetched = store.get_user(7).await.expect("read").expect("exists");
        assert_eq!(fetched, user);
    }

    #[tokio::test]
    async fn test_lookup_lifecycle_round_trip() {
        let store = Store::open(temp_db_path()).expect("open");
        store.touch_user(7, None, None).await.expect("user");

        let query = Query::parse(QueryKind::Email, "alice@example.com").expect("valid");
        let id = store
            .begin_lookup(7, &query, Duration::from_secs(60))
            .await
            .expect("begin");
        store
            .complete_lookup(id, Some(json!({"name": "Alice"})))
            .await
            .expect("complete");

        let records = store.list_by_user(7, 10).await.expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, QueryStatus::Success);
        assert_eq!(records[0].result, Some(json!({"name": "Alice"})));

        let same = store
            .record_by_id(id)
            .await
            .expect("by id")
            .expect("exists");
        assert_eq!(same, records[0]);
    }

    #[tokio::test]
    async fn test_corrupt_file_fails_open() {
        let path = temp_db_path();
        std::fs::write(&path, b"definitely not a sqlite database, not even close")
            .expect("write garbage");

        match Store::open(&path) {
            Err(StoreError::Corrupt(_)) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backup_produces_openable_snapshot() {
        let store = Store::open(temp_db_path()).expect("open");
        store.touch_user(7, None, None).await.expect("user");

        let dest = temp_db_path();
        store.backup_to(dest.clone()).await.expect("backup");

        let snapshot = Store::open(&dest).expect("snapshot opens");
        let user = snapshot.get_user(7).await.expect("read").expect("exists");
        assert_eq!(user.user_id, 7);
    }

    #[tokio::test]
    async fn test_busy_error_converts_to_core_taxonomy() {
        let core: CoreError = StoreError::Busy.into();
        assert!(matches!(core, CoreError::StoreBusy));
        let core: CoreError = StoreError::Corrupt("bad page".into()).into();
        assert!(matches!(core, CoreError::StoreCorrupt(_)));
    }
}
