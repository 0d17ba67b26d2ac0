pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Write attempts before a busy database surfaces as an error.
const BUSY_RETRIES: u32 = 3;

/// Single-connection database wrapper.
///
/// Uses `Mutex` because `rusqlite::Connection` is `Send` but not `Sync`
/// (it contains internal `RefCell`s), so `RwLock` cannot be used.
/// WAL mode is still set for crash safety and to keep the door open for a
/// reader/writer pool later.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self::init(conn)?;
        info!("database opened at {}", path.display());
        Ok(db)
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection for read-only queries (SELECT).
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Acquire the connection for write queries. Busy/locked failures are
    /// retried with a short jittered sleep before surfacing, so callers stay
    /// single-shot and never re-apply their own effects.
    pub fn with_conn_mut<F, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let conn = self
                    .conn
                    .lock()
                    .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
                f(&conn)
            };
            match result {
                Err(e) if attempt < BUSY_RETRIES && is_busy(&e) => {
                    attempt += 1;
                    let jitter = rand::random::<u64>() % 25;
                    warn!(attempt, "database busy, retrying");
                    std::thread::sleep(Duration::from_millis(10 + jitter));
                }
                other => return other,
            }
        }
    }
}

/// True for SQLITE_BUSY / SQLITE_LOCKED, the retryable kinds.
fn is_busy(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// True when `err` is a unique/foreign-key constraint violation, the
/// conflict kind handlers map to a user-facing `ERROR` reply.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Current unix timestamp in seconds; the single clock for persisted rows.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Extension trait for optional query results.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
