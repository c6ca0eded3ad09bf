//! Shared plumbing for the SQLite-backed result caches.

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tradelog_core::{Result, TradelogError};

/// Format of every timestamp column. Lexicographic order matches time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DAY_SECS: u64 = 86_400;

/// Summary of a persistent cache, with the most accessed rows.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PersistentCacheStats<E> {
    /// Number of rows, stale ones included.
    pub total_entries: usize,
    /// Rows still inside the staleness window.
    pub recent_entries: usize,
    /// Rough size of the cached payloads in bytes.
    pub approx_size_bytes: u64,
    /// Most accessed rows, highest count first.
    pub top_entries: Vec<E>,
}

/// Hex SHA-256 of the key material.
pub(crate) fn cache_key(material: &str) -> String {
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}

/// Timestamp `age` before now; rows created after it are fresh.
pub(crate) fn cutoff(age: Duration) -> String {
    let at = TimeDelta::from_std(age)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    timestamp(at)
}

pub(crate) const fn days(days: u32) -> Duration {
    Duration::from_secs(days as u64 * DAY_SECS)
}

pub(crate) fn db_err(e: rusqlite::Error) -> TradelogError {
    TradelogError::Database(e.to_string())
}

/// One SQLite file holding one cache table.
///
/// Every operation opens its own short-lived connection, so the store can be
/// shared freely between threads.
#[derive(Debug)]
pub(crate) struct SqliteStore {
    path: PathBuf,
    table: &'static str,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Creates parent directories and the schema, then returns the store.
    pub(crate) fn open(
        path: impl AsRef<Path>,
        table: &'static str,
        schema: &str,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TradelogError::io(parent, e))?;
        }

        let store = Self {
            path,
            table,
            busy_timeout,
        };
        store.connect()?.execute_batch(schema).map_err(db_err)?;
        debug!(table, path = %store.path.display(), "Persistent cache schema initialized");
        Ok(store)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(db_err)?;
        conn.busy_timeout(self.busy_timeout).map_err(db_err)?;
        Ok(conn)
    }

    pub(crate) fn total_entries(&self) -> Result<usize> {
        self.count(&format!("SELECT COUNT(*) FROM {}", self.table), [])
    }

    pub(crate) fn recent_entries(&self, max_age: Duration) -> Result<usize> {
        self.count(
            &format!("SELECT COUNT(*) FROM {} WHERE created_at > ?1", self.table),
            params![cutoff(max_age)],
        )
    }

    fn count(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        let count: i64 = self
            .connect()?
            .query_row(sql, params, |row| row.get(0))
            .map_err(db_err)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Deletes rows created more than `days` days ago.
    pub(crate) fn clear_older_than(&self, days_old: u32) -> Result<usize> {
        let conn = self.connect()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE created_at < ?1", self.table),
            params![cutoff(days(days_old))],
        )
        .map_err(db_err)
    }

    pub(crate) fn clear_all(&self) -> Result<usize> {
        let conn = self.connect()?;
        conn.execute(&format!("DELETE FROM {}", self.table), [])
            .map_err(db_err)
    }
}
