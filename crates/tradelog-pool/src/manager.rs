//! One connection pool per database file.

use crate::pool::ConnectionPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tradelog_core::{PoolConfig, Result, TradelogError};

/// Registry of [`ConnectionPool`]s keyed by database path.
#[derive(Debug, Default)]
pub struct ConnectionPoolManager {
    pools: Mutex<HashMap<PathBuf, Arc<ConnectionPool>>>,
    default_config: PoolConfig,
}

impl ConnectionPoolManager {
    /// Creates a manager whose implicitly created pools use `default_config`.
    #[must_use]
    pub fn new(default_config: PoolConfig) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            default_config,
        }
    }

    /// Configuration used by [`get_or_create_pool`](Self::get_or_create_pool).
    #[must_use]
    pub const fn default_config(&self) -> &PoolConfig {
        &self.default_config
    }

    /// Creates and registers a pool for `db_path`.
    ///
    /// # Errors
    /// Returns [`TradelogError::PoolAlreadyExists`] if the path already has a
    /// pool, or any error from [`ConnectionPool::new`].
    pub fn create_pool(
        &self,
        db_path: impl AsRef<Path>,
        config: PoolConfig,
    ) -> Result<Arc<ConnectionPool>> {
        let db_path = db_path.as_ref();
        let mut pools = self.pools.lock();
        if pools.contains_key(db_path) {
            return Err(TradelogError::PoolAlreadyExists(
                db_path.display().to_string(),
            ));
        }
        let pool = Arc::new(ConnectionPool::new(db_path, config)?);
        pools.insert(db_path.to_path_buf(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Returns the pool for `db_path`, if one is registered.
    #[must_use]
    pub fn get_pool(&self, db_path: impl AsRef<Path>) -> Option<Arc<ConnectionPool>> {
        self.pools.lock().get(db_path.as_ref()).cloned()
    }

    /// Returns the pool for `db_path`, creating it with the default
    /// configuration if needed.
    ///
    /// # Errors
    /// Returns any error from [`ConnectionPool::new`].
    pub fn get_or_create_pool(&self, db_path: impl AsRef<Path>) -> Result<Arc<ConnectionPool>> {
        let db_path = db_path.as_ref();
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(db_path) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(ConnectionPool::new(db_path, self.default_config.clone())?);
        pools.insert(db_path.to_path_buf(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Closes and unregisters the pool for `db_path`. Returns false if there was none.
    pub fn remove_pool(&self, db_path: impl AsRef<Path>) -> bool {
        let removed = self.pools.lock().remove(db_path.as_ref());
        match removed {
            Some(pool) => {
                pool.close();
                info!(db_path = %db_path.as_ref().display(), "Removed connection pool");
                true
            }
            None => false,
        }
    }

    /// Returns the registered database paths, sorted.
    #[must_use]
    pub fn list_pools(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.pools.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Closes and unregisters every pool.
    pub fn close_all(&self) {
        let pools: Vec<_> = self.pools.lock().drain().collect();
        let count = pools.len();
        for (_, pool) in pools {
            pool.close();
        }
        if count > 0 {
            info!(count, "Closed all connection pools");
        }
    }
}

impl Drop for ConnectionPoolManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> PoolConfig {
        PoolConfig::default()
            .with_max_connections(2)
            .with_idle_reaping(Duration::from_secs(300), Duration::ZERO)
    }

    #[test]
    fn test_pools_are_keyed_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionPoolManager::new(config());
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");

        let first = manager.get_or_create_pool(&a).unwrap();
        let again = manager.get_or_create_pool(&a).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        manager.create_pool(&b, config().with_max_connections(4)).unwrap();
        assert_eq!(manager.get_pool(&b).unwrap().config().max_connections, 4);
        assert_eq!(manager.list_pools(), vec![a.clone(), b]);

        let err = manager.create_pool(&a, config()).unwrap_err();
        assert!(matches!(err, TradelogError::PoolAlreadyExists(_)));
    }

    #[test]
    fn test_remove_and_close_all() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionPoolManager::new(config());
        let path = dir.path().join("trades.db");
        let pool = manager.get_or_create_pool(&path).unwrap();

        assert!(manager.remove_pool(&path));
        assert!(!manager.remove_pool(&path));
        assert!(pool.is_closed());
        assert!(manager.get_pool(&path).is_none());

        let other = manager.get_or_create_pool(dir.path().join("other.db")).unwrap();
        manager.close_all();
        assert!(other.is_closed());
        assert!(manager.list_pools().is_empty());
    }
}
