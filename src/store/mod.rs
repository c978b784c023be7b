//! Persistence layer: a pooled SQLite handle plus the repository and the
//! workflow store built on top of it.
//!
//! Every write is an `ON CONFLICT` upsert keyed by the idempotency keys of
//! the domain records, so re-running any refresh is safe. Audit and
//! validation-report writes are best-effort and never fail a primary
//! operation.

pub mod repository;
pub mod workflow_store;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

mod embedded {
    refinery::embed_migrations!("migrations");
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("migration: {0}")]
    Migration(#[from] refinery::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{entity} {id} is terminal and cannot be updated")]
    TerminalState { entity: &'static str, id: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared connection handle. SQLite calls are short; a mutexed connection is
/// the serialisation point for all writers.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", "5000").ok();
        embedded::migrations::runner().run(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock().expect("database lock poisoned");
        Ok(f(&conn)?)
    }

    pub fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        Ok(f(&mut conn)?)
    }
}

// ---------------------------------------------------------------------------
// TEXT column codecs
// ---------------------------------------------------------------------------

pub(crate) fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn date_from_sql(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn ts_from_sql(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
