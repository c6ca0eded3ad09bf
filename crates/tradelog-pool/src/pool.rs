//! Bounded SQLite connection pool with validated return and idle reaping.

use crate::connection::{ColumnInfo, DatabaseConnection};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rusqlite::{Params, Row};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use tradelog_core::{PerformanceMonitor, PoolConfig, Result, TradelogError};

/// Snapshot of a pool's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, idle and checked out.
    pub total_connections: usize,
    /// Connections currently checked out.
    pub active_connections: usize,
    /// Connections waiting in the idle queue.
    pub idle_connections: usize,
    /// Connections that failed to open.
    pub connection_errors: u64,
    /// Statements run through the pool's helpers.
    pub total_queries: u64,
    /// Statements slower than the configured threshold.
    pub slow_queries: u64,
    /// Configured capacity.
    pub max_connections: usize,
    /// Database file the pool serves.
    pub db_path: String,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<DatabaseConnection>,
    active: usize,
    total: usize,
    next_id: u64,
    closed: bool,
}

struct PoolInner {
    db_path: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    stopped: Mutex<bool>,
    wake: Condvar,
    connection_errors: AtomicU64,
    total_queries: AtomicU64,
    slow_queries: AtomicU64,
    monitor: PerformanceMonitor,
}

impl PoolInner {
    fn display_path(&self) -> String {
        self.db_path.display().to_string()
    }

    /// Takes back a checked-out connection, keeping it only if it is healthy.
    fn release(&self, mut conn: DatabaseConnection) {
        let valid = conn.is_valid();
        let discard = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            if state.closed || !valid || state.idle.len() >= self.config.max_connections {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            } else {
                conn.touch();
                state.idle.push_back(conn);
                None
            }
        };
        self.available.notify_one();

        if let Some(conn) = discard {
            if valid {
                trace!(id = conn.id(), "Closing returned connection");
            } else {
                debug!(id = conn.id(), db_path = %self.db_path.display(), "Discarding invalid connection");
            }
            conn.close();
        }
    }

    fn reap_idle(&self) -> usize {
        let expired: Vec<DatabaseConnection> = {
            let mut state = self.state.lock();
            let idle = mem::take(&mut state.idle);
            let (expired, keep): (Vec<_>, Vec<_>) = idle
                .into_iter()
                .partition(|conn| conn.idle_for() > self.config.idle_timeout);
            state.idle = keep.into();
            state.total = state.total.saturating_sub(expired.len());
            expired
        };
        let reaped = expired.len();
        for conn in expired {
            conn.close();
        }
        reaped
    }
}

/// A fixed-capacity pool of connections to one SQLite database.
///
/// [`get_connection`](Self::get_connection) hands out a [`PooledConnection`]
/// guard that returns the connection when dropped, on every exit path.
/// Returned connections are checked and dropped if unusable. Idle connections
/// unused for longer than `idle_timeout` are closed by a background thread.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db_path", &self.inner.db_path)
            .field("max_connections", &self.inner.config.max_connections)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates a pool for `db_path`. No connection is opened until one is requested.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the reaper thread
    /// cannot be started.
    pub fn new(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            db_path: db_path.as_ref().to_path_buf(),
            config,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            connection_errors: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            monitor: PerformanceMonitor::new(),
        });

        let reaper = if inner.config.reap_interval.is_zero() {
            None
        } else {
            Some(spawn_reaper(Arc::clone(&inner))?)
        };

        info!(
            db_path = %inner.db_path.display(),
            max_connections = inner.config.max_connections,
            "Created connection pool"
        );
        Ok(Self {
            inner,
            reaper: Mutex::new(reaper),
        })
    }

    /// Database file the pool serves.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    /// Configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Per-operation timings of the pool's query helpers.
    #[must_use]
    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.inner.monitor
    }

    /// Checks out a connection, waiting up to `timeout` (or the configured
    /// acquire timeout) for one to become free.
    ///
    /// # Errors
    /// Returns [`TradelogError::PoolExhausted`] if none frees up in time,
    /// [`TradelogError::PoolClosed`] after [`close`](Self::close), or a
    /// database error if a new connection cannot be opened.
    pub fn get_connection(&self, timeout: Option<Duration>) -> Result<PooledConnection> {
        let inner = &self.inner;
        let timeout = timeout.unwrap_or(inner.config.acquire_timeout);
        let deadline = Instant::now().checked_add(timeout);
        let mut state = inner.state.lock();

        loop {
            if state.closed {
                return Err(TradelogError::PoolClosed(inner.display_path()));
            }

            if let Some(mut conn) = state.idle.pop_front() {
                state.active += 1;
                conn.touch();
                trace!(id = conn.id(), "Reusing idle connection");
                return Ok(PooledConnection::new(conn, Arc::clone(inner)));
            }

            if state.total < inner.config.max_connections {
                return self.open_connection(&mut state);
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    db_path = %inner.db_path.display(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    max_connections = inner.config.max_connections,
                    "Connection pool exhausted"
                );
                return Err(TradelogError::PoolExhausted {
                    db_path: inner.display_path(),
                    timeout,
                });
            }
            match deadline {
                Some(deadline) => {
                    inner.available.wait_until(&mut state, deadline);
                }
                // Unrepresentable deadline: wait until a release or close wakes us.
                None => inner.available.wait(&mut state),
            }
        }
    }

    /// Reserves a slot, opens a connection without holding the lock, and
    /// gives the slot back if opening fails.
    fn open_connection(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<PooledConnection> {
        let inner = &self.inner;
        state.total += 1;
        state.active += 1;
        state.next_id += 1;
        let id = state.next_id;

        let opened = MutexGuard::unlocked(state, || {
            DatabaseConnection::open(id, &inner.db_path, &inner.config)
        });
        match opened {
            Ok(conn) => Ok(PooledConnection::new(conn, Arc::clone(inner))),
            Err(e) => {
                state.total -= 1;
                state.active -= 1;
                inner.connection_errors.fetch_add(1, Ordering::Relaxed);
                inner.available.notify_one();
                error!(db_path = %inner.db_path.display(), error = %e, "Failed to open database connection");
                Err(e)
            }
        }
    }

    fn timed<T>(&self, operation: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let threshold = self.inner.config.slow_query_threshold;
        let started = Instant::now();
        let result = self.inner.monitor.measure(operation, threshold, f);
        self.inner.total_queries.fetch_add(1, Ordering::Relaxed);
        if started.elapsed() > threshold {
            self.inner.slow_queries.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Runs one statement on a pooled connection.
    ///
    /// # Errors
    /// Returns an error if no connection is available or SQLite rejects the statement.
    #[instrument(skip(self, params), fields(db_path = %self.inner.db_path.display()))]
    pub fn execute(&self, sql: &str, params: impl Params) -> Result<usize> {
        let mut conn = self.get_connection(None)?;
        self.timed("execute", || conn.execute(sql, params))
    }

    /// Runs a query on a pooled connection and maps every row with `f`.
    ///
    /// # Errors
    /// Returns an error if no connection is available or the query fails.
    #[instrument(skip(self, params, f), fields(db_path = %self.inner.db_path.display()))]
    pub fn query<T, F>(&self, sql: &str, params: impl Params, f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.get_connection(None)?;
        self.timed("query", || conn.query(sql, params, f))
    }

    /// Runs `sql` once per parameter set inside one transaction.
    ///
    /// # Errors
    /// Returns an error if no connection is available or any statement fails.
    #[instrument(skip(self, param_sets), fields(db_path = %self.inner.db_path.display()))]
    pub fn execute_many<P, I>(&self, sql: &str, param_sets: I) -> Result<usize>
    where
        P: Params,
        I: IntoIterator<Item = P>,
    {
        let mut conn = self.get_connection(None)?;
        self.timed("execute_many", || conn.execute_many(sql, param_sets))
    }

    /// Runs a semicolon-separated script on a pooled connection.
    ///
    /// # Errors
    /// Returns an error if no connection is available or any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let mut conn = self.get_connection(None)?;
        self.timed("execute_batch", || conn.execute_batch(sql))
    }

    /// Describes the columns of `table`.
    ///
    /// # Errors
    /// Returns an error if no connection is available or the pragma fails.
    pub fn table_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.get_connection(None)?;
        conn.table_info(table)
    }

    /// Closes idle connections unused for longer than `idle_timeout` and
    /// returns how many were closed. The reaper thread calls this periodically.
    pub fn reap_idle(&self) -> usize {
        self.inner.reap_idle()
    }

    /// Returns the current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_connections: state.total,
            active_connections: state.active,
            idle_connections: state.idle.len(),
            connection_errors: self.inner.connection_errors.load(Ordering::Relaxed),
            total_queries: self.inner.total_queries.load(Ordering::Relaxed),
            slow_queries: self.inner.slow_queries.load(Ordering::Relaxed),
            max_connections: self.inner.config.max_connections,
            db_path: self.inner.display_path(),
        }
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Stops the reaper, closes idle connections and refuses further checkouts.
    ///
    /// Connections still checked out are closed when their guard drops.
    /// Query counters are reset. Calling `close` again is harmless.
    #[instrument(skip(self), fields(db_path = %self.inner.db_path.display()))]
    pub fn close(&self) {
        {
            let mut stopped = self.inner.stopped.lock();
            *stopped = true;
            self.inner.wake.notify_all();
        }
        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(db_path = %self.inner.db_path.display(), "Pool reaper thread panicked");
            }
        }

        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = mem::take(&mut state.idle);
            state.total = state.total.saturating_sub(idle.len());
            idle
        };
        self.inner.available.notify_all();

        let closed = idle.len();
        for conn in idle {
            conn.close();
        }
        self.inner.connection_errors.store(0, Ordering::Relaxed);
        self.inner.total_queries.store(0, Ordering::Relaxed);
        self.inner.slow_queries.store(0, Ordering::Relaxed);
        self.inner.monitor.reset();
        info!(closed, "Closed connection pool");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_reaper(inner: Arc<PoolInner>) -> Result<JoinHandle<()>> {
    let file = inner
        .db_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("pool-reaper-{file}");
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_reaper(&inner))
        .map_err(|e| TradelogError::Thread {
            name,
            reason: e.to_string(),
        })
}

fn run_reaper(inner: &PoolInner) {
    let interval = inner.config.reap_interval;
    loop {
        {
            let mut stopped = inner.stopped.lock();
            if !*stopped {
                inner.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }

        match catch_unwind(AssertUnwindSafe(|| inner.reap_idle())) {
            Ok(0) => {}
            Ok(reaped) => debug!(db_path = %inner.db_path.display(), reaped, "Reaped idle connections"),
            Err(_) => error!(db_path = %inner.db_path.display(), "Idle reaping panicked, reaper keeps running"),
        }
    }
    trace!(db_path = %inner.db_path.display(), "Pool reaper stopped");
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to [`DatabaseConnection`]. Dropping the guard returns the
/// connection to its pool.
pub struct PooledConnection {
    conn: Option<DatabaseConnection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    const fn new(conn: DatabaseConnection, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Deref for PooledConnection {
    type Target = DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        // invariant: only `Drop` takes the connection out.
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // invariant: only `Drop` takes the connection out.
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn pool(max_connections: usize) -> (TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig::default()
            .with_max_connections(max_connections)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_idle_reaping(Duration::from_secs(300), Duration::ZERO);
        let pool = ConnectionPool::new(dir.path().join("trades.db"), config).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_connection_is_reused() {
        let (_dir, pool) = pool(2);
        let first_id = pool.get_connection(None).unwrap().id();
        let second_id = pool.get_connection(None).unwrap().id();
        assert_eq!(first_id, second_id);

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_exhaustion_returns_error() {
        let (_dir, pool) = pool(1);
        let held = pool.get_connection(None).unwrap();

        let started = Instant::now();
        let err = pool
            .get_connection(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(err.is_pool_exhausted());
        assert!(started.elapsed() >= Duration::from_millis(50));

        drop(held);
        assert!(pool.get_connection(Some(Duration::from_millis(50))).is_ok());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let (_dir, pool) = pool(1);
        let pool = Arc::new(pool);
        let held = pool.get_connection(None).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_connection(Some(Duration::from_secs(5))).map(|c| c.id()))
        };
        thread::sleep(Duration::from_millis(50));
        let held_id = held.id();
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), held_id);
    }

    #[test]
    fn test_unbounded_timeout_does_not_panic() {
        let (_dir, pool) = pool(1);
        let pool = Arc::new(pool);
        let held = pool.get_connection(Some(Duration::MAX)).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_connection(Some(Duration::MAX)).map(|c| c.id()))
        };
        thread::sleep(Duration::from_millis(50));
        let held_id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), held_id);

        let held = pool.get_connection(None).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get_connection(Some(Duration::MAX)).map(|c| c.id()))
        };
        thread::sleep(Duration::from_millis(50));
        pool.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(TradelogError::PoolClosed(_))
        ));
        drop(held);
    }

    #[test]
    fn test_reap_idle_keeps_fresh_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig::default()
            .with_max_connections(3)
            .with_idle_reaping(Duration::from_millis(40), Duration::ZERO);
        let pool = ConnectionPool::new(dir.path().join("trades.db"), config).unwrap();

        let first = pool.get_connection(None).unwrap();
        let second = pool.get_connection(None).unwrap();
        drop(first);
        thread::sleep(Duration::from_millis(80));
        drop(second);

        assert_eq!(pool.reap_idle(), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(pool.get_connection(None).unwrap().id(), 2);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let (_dir, pool) = pool(3);
        let pool = Arc::new(pool);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (pool, in_use, peak) = (Arc::clone(&pool), Arc::clone(&in_use), Arc::clone(&peak));
                thread::spawn(move || {
                    for _ in 0..20 {
                        let conn = pool.get_connection(Some(Duration::from_secs(10))).unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(pool.stats().active_connections <= 3);
                        thread::sleep(Duration::from_millis(1));
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        drop(conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert!(stats.total_connections <= 3);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_connection_returned_after_panic() {
        let (_dir, pool) = pool(2);
        pool.get_connection(None).unwrap();
        assert_eq!(pool.stats().idle_connections, 1);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut conn = pool.get_connection(None).unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
            panic!("failure inside scope");
        }));
        assert!(result.is_err());

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_connection_returned_after_early_error() {
        let (_dir, pool) = pool(2);
        let run = || -> Result<()> {
            let mut conn = pool.get_connection(None)?;
            conn.execute("SELECT * FROM missing_table", [])?;
            Ok(())
        };
        assert!(run().is_err());
        assert_eq!(pool.stats().idle_connections, 1);
        assert_eq!(pool.stats().active_connections, 0);
    }

    #[test]
    fn test_invalid_connection_discarded() {
        let (_dir, pool) = pool(2);
        {
            let mut conn = pool.get_connection(None).unwrap();
            conn.execute_batch("BEGIN").unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.idle_connections, 0);

        let mut conn = pool.get_connection(None).unwrap();
        assert_eq!(conn.id(), 2);
        assert_eq!(conn.execute("CREATE TABLE t (id INTEGER)", []).unwrap(), 0);
    }

    #[test]
    fn test_idle_reaper_closes_stale_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig::default()
            .with_idle_reaping(Duration::from_millis(20), Duration::from_millis(10));
        let pool = ConnectionPool::new(dir.path().join("trades.db"), config).unwrap();

        drop(pool.get_connection(None).unwrap());
        assert_eq!(pool.stats().idle_connections, 1);

        thread::sleep(Duration::from_millis(200));
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[test]
    fn test_query_helpers_and_stats() {
        let (_dir, pool) = pool(2);
        pool.execute_batch("CREATE TABLE trades (id INTEGER PRIMARY KEY, strike INTEGER)")
            .unwrap();
        pool.execute_many("INSERT INTO trades (strike) VALUES (?1)", [[6000], [6100]])
            .unwrap();
        let strikes: Vec<i64> = pool
            .query("SELECT strike FROM trades ORDER BY strike", [], |row| row.get(0))
            .unwrap();
        assert_eq!(strikes, vec![6000, 6100]);
        assert_eq!(pool.execute("DELETE FROM trades", []).unwrap(), 2);
        assert_eq!(pool.table_info("trades").unwrap().len(), 2);

        let stats = pool.stats();
        assert_eq!(stats.total_queries, 4);
        assert_eq!(stats.slow_queries, 0);
        assert_eq!(pool.monitor().stats("query").unwrap().successful_calls, 1);
    }

    #[test]
    fn test_close_refuses_checkouts() {
        let (_dir, pool) = pool(2);
        let held = pool.get_connection(None).unwrap();
        drop(pool.get_connection(None).unwrap());

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get_connection(None),
            Err(TradelogError::PoolClosed(_))
        ));

        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.idle_connections, 0);
        pool.close();
    }
}
