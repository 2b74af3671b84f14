//! Durable SQLite store for executions, agents, webhook config, and the
//! dead-letter queue.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.  PRAGMA
//! integrity_check runs at open; returns an error if it fails.
//!
//! # Concurrency
//! The connection is owned by a single `Store` value, shared across async
//! tasks behind a `tokio::sync::Mutex` (see [`SharedStore`]).  Row-level
//! read-modify-write (execution updates) runs inside one transaction.
//!
//! # Retries
//! Transient `busy`/`locked` failures are retried internally with a capped
//! exponential backoff (3 retries, 50ms base, 2x growth).  Validation,
//! constraint, and not-found errors surface immediately.

use crate::backoff::Backoff;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod agents;
mod dlq;
mod executions;
mod webhook;

pub use executions::{ExecutionFilter, ExecutionSort, ExecutionStats};
pub use webhook::ExecutionWebhook;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored data corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True for failures worth retrying (another writer holds the database).
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Shared async handle to the store.
pub type SharedStore = Arc<tokio::sync::Mutex<Store>>;

/// The durable SQLite store for the control plane.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(Store { conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Store { conn })
    }

    /// Wrap a store for shared async use.
    pub fn into_shared(self) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Run `op`, retrying transient busy/locked failures with capped backoff.
    pub(crate) fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut delays = Backoff::new(Duration::from_millis(50), Duration::from_millis(400)).take(3);
        loop {
            match op(self) {
                Err(e) if e.is_transient() => match delays.next() {
                    Some(delay) => std::thread::sleep(delay),
                    None => return Err(e),
                },
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Open helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=250;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Column codecs shared by the table modules
// ---------------------------------------------------------------------------

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn ts_from_sql(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{text}': {e}")))
}

pub(crate) fn opt_ts_from_sql(text: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    text.as_deref().map(ts_from_sql).transpose()
}
