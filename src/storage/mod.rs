//! Storage layer facade.
//!
//! - **[`sqlite`]**: schema, pragmas, migrations, and every SQL statement.
//! - [`Database`]: the shared handle the history store and the city catalog
//!   go through. Calls run on the blocking pool of an explicit [`IoContext`].

pub mod sqlite;

use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tracing::{debug, warn};

pub use sqlite::SqliteStorage;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Calls slower than this are logged at warn level.
const SLOW_CALL_THRESHOLD: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("schema_version missing")]
    MissingSchemaVersion,

    #[error("Database worker failed: {0}")]
    Worker(#[from] JoinError),
}

/// Execution context for blocking store I/O.
///
/// Wraps the runtime whose blocking pool runs SQLite calls, so callers pick
/// the pool explicitly instead of relying on whatever runtime is ambient.
#[derive(Clone, Debug)]
pub struct IoContext {
    handle: Handle,
}

impl IoContext {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Context bound to the runtime we are currently running on.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub async fn run_blocking<F, T>(&self, f: F) -> std::result::Result<T, JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn_blocking(f).await
    }
}

/// Shared, mutex-guarded catalog database.
#[derive(Clone)]
pub struct Database {
    storage: Arc<Mutex<SqliteStorage>>,
    io: IoContext,
}

impl Database {
    pub fn new(storage: SqliteStorage, io: IoContext) -> Self {
        Self {
            storage: Arc::new(Mutex::new(storage)),
            io,
        }
    }

    pub fn open(path: &Path, io: IoContext) -> Result<Self> {
        Ok(Self::new(SqliteStorage::open(path)?, io))
    }

    pub fn open_in_memory(io: IoContext) -> Result<Self> {
        Ok(Self::new(SqliteStorage::open_in_memory()?, io))
    }

    pub fn io(&self) -> &IoContext {
        &self.io
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// The connection lock is held for the whole of `f`, so everything `f`
    /// does is atomic with respect to other calls. `reason` shows up in logs.
    pub async fn call<F, T>(&self, reason: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        self.io
            .run_blocking(move || {
                let start = Instant::now();
                let mut guard = storage.lock();
                let out = f(&mut guard);
                drop(guard);
                let elapsed = start.elapsed();
                if elapsed > SLOW_CALL_THRESHOLD {
                    warn!(
                        reason = reason,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow database call"
                    );
                } else {
                    debug!(
                        reason = reason,
                        elapsed_us = elapsed.as_micros() as u64,
                        ok = out.is_ok(),
                        "database call"
                    );
                }
                out
            })
            .await?
    }

    /// Synchronous access, for setup code that is not on the runtime.
    pub fn lock(&self) -> MutexGuard<'_, SqliteStorage> {
        self.storage.lock()
    }
}
