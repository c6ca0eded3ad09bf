//! A single pooled SQLite connection and its bookkeeping.

use rusqlite::{Connection, Params, Row};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use tradelog_core::{PoolConfig, Result, TradelogError};

pub(crate) fn db_err(e: rusqlite::Error) -> TradelogError {
    TradelogError::Database(e.to_string())
}

/// One column as reported by `PRAGMA table_info`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    /// Zero-based column position.
    pub cid: i64,
    /// Column name.
    pub name: String,
    /// Declared type, possibly empty.
    pub data_type: String,
    /// Whether the column is `NOT NULL`.
    pub not_null: bool,
    /// Default value expression, if any.
    pub default_value: Option<String>,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

/// A SQLite connection owned by a [`ConnectionPool`](crate::ConnectionPool).
pub struct DatabaseConnection {
    conn: Connection,
    id: u64,
    db_path: PathBuf,
    created_at: Instant,
    last_used: Instant,
    query_count: u64,
}

impl fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("id", &self.id)
            .field("db_path", &self.db_path)
            .field("query_count", &self.query_count)
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

impl DatabaseConnection {
    /// Opens a connection and applies the configured pragmas.
    ///
    /// Pragma failures are logged and otherwise ignored.
    pub(crate) fn open(id: u64, db_path: &Path, config: &PoolConfig) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        apply_pragmas(&conn, db_path, config);
        let now = Instant::now();
        debug!(id, db_path = %db_path.display(), "Opened database connection");
        Ok(Self {
            conn,
            id,
            db_path: db_path.to_path_buf(),
            created_at: now,
            last_used: now,
            query_count: 0,
        })
    }

    /// Pool-local connection number.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Database file this connection is open on.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// When the connection was opened.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last handed out or returned.
    #[must_use]
    pub const fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Time since [`last_used`](Self::last_used).
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Statements run through this wrapper.
    #[must_use]
    pub const fn query_count(&self) -> u64 {
        self.query_count
    }

    /// The underlying rusqlite connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Checks the connection before it goes back to the idle queue.
    ///
    /// A connection left inside an open transaction is not reusable.
    pub(crate) fn is_valid(&self) -> bool {
        self.conn.is_autocommit()
            && self
                .conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok()
    }

    pub(crate) fn close(self) {
        let id = self.id;
        if let Err((_, e)) = self.conn.close() {
            warn!(id, error = %e, "Failed to close database connection cleanly");
        }
    }

    /// Runs one statement and returns the number of changed rows.
    ///
    /// # Errors
    /// Returns an error if SQLite rejects the statement.
    pub fn execute(&mut self, sql: &str, params: impl Params) -> Result<usize> {
        self.query_count += 1;
        self.conn.execute(sql, params).map_err(db_err)
    }

    /// Runs a query and maps every row with `f`.
    ///
    /// # Errors
    /// Returns an error if SQLite rejects the query or `f` fails on a row.
    pub fn query<T, F>(&mut self, sql: &str, params: impl Params, f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query_count += 1;
        let mut stmt = self.conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, f)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Runs `sql` once per parameter set inside one transaction and returns
    /// the total number of changed rows.
    ///
    /// # Errors
    /// Returns an error, after rolling back, if any statement fails.
    pub fn execute_many<P, I>(&mut self, sql: &str, param_sets: I) -> Result<usize>
    where
        P: Params,
        I: IntoIterator<Item = P>,
    {
        self.query_count += 1;
        let tx = self.conn.transaction().map_err(db_err)?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(sql).map_err(db_err)?;
            for params in param_sets {
                changed += stmt.execute(params).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(changed)
    }

    /// Runs a semicolon-separated script.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.query_count += 1;
        self.conn.execute_batch(sql).map_err(db_err)
    }

    /// Describes the columns of `table`. Unknown tables yield an empty list.
    ///
    /// # Errors
    /// Returns an error if the pragma cannot run.
    pub fn table_info(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.query_count += 1;
        let mut columns = Vec::new();
        self.conn
            .pragma(None, "table_info", table, |row| {
                columns.push(ColumnInfo {
                    cid: row.get(0)?,
                    name: row.get(1)?,
                    data_type: row.get(2)?,
                    not_null: row.get(3)?,
                    default_value: row.get(4)?,
                    primary_key: row.get::<_, i64>(5)? > 0,
                });
                Ok(())
            })
            .map_err(db_err)?;
        Ok(columns)
    }
}

fn apply_pragmas(conn: &Connection, db_path: &Path, config: &PoolConfig) {
    let log_failure = |pragma: &str, e: rusqlite::Error| {
        warn!(db_path = %db_path.display(), pragma, error = %e, "Failed to apply pragma");
    };

    if let Err(e) = conn.busy_timeout(config.busy_timeout) {
        log_failure("busy_timeout", e);
    }
    if let Err(e) = conn.pragma_update_and_check(None, "journal_mode", &config.journal_mode, |row| {
        row.get::<_, String>(0)
    }) {
        log_failure("journal_mode", e);
    }
    if let Err(e) = conn.pragma_update(None, "synchronous", &config.synchronous) {
        log_failure("synchronous", e);
    }
    if let Err(e) = conn.pragma_update(None, "cache_size", config.cache_size) {
        log_failure("cache_size", e);
    }
    if let Err(e) = conn.pragma_update(None, "temp_store", &config.temp_store) {
        log_failure("temp_store", e);
    }
    if let Err(e) = conn.pragma_update_and_check(None, "mmap_size", config.mmap_size, |row| {
        row.get::<_, i64>(0)
    }) {
        log_failure("mmap_size", e);
    }
    if let Err(e) = conn.pragma_update(None, "foreign_keys", config.foreign_keys) {
        log_failure("foreign_keys", e);
    }
}
