//! Named registry of in-memory caches.

use crate::memory::{CacheKey, CacheValue, SmartCache};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};
use tradelog_core::{CacheConfig, Result, TradelogError};

/// Owns a set of [`SmartCache`] instances keyed by name.
///
/// Caches are handed out as `Arc`s so callers can keep using one after it has
/// been removed from the manager; removal closes it either way.
pub struct CacheManager<K = String, V = serde_json::Value>
where
    K: CacheKey,
    V: CacheValue,
{
    caches: Mutex<HashMap<String, Arc<SmartCache<K, V>>>>,
}

impl<K: CacheKey, V: CacheValue> Default for CacheManager<K, V> {
    fn default() -> Self {
        Self {
            caches: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for CacheManager<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("caches", &self.list_caches())
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> CacheManager<K, V> {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a cache.
    ///
    /// # Errors
    /// Returns [`TradelogError::CacheAlreadyExists`] if `name` is taken, or any
    /// error from [`SmartCache::named`].
    #[instrument(skip(self, config))]
    pub fn create_cache(&self, name: &str, config: CacheConfig) -> Result<Arc<SmartCache<K, V>>> {
        let mut caches = self.caches.lock();
        if caches.contains_key(name) {
            return Err(TradelogError::CacheAlreadyExists(name.to_string()));
        }
        let cache = Arc::new(SmartCache::named(name, config)?);
        caches.insert(name.to_string(), Arc::clone(&cache));
        info!(cache = name, "Created cache");
        Ok(cache)
    }

    /// Returns the cache registered under `name`.
    #[must_use]
    pub fn get_cache(&self, name: &str) -> Option<Arc<SmartCache<K, V>>> {
        self.caches.lock().get(name).cloned()
    }

    /// Returns the cache registered under `name`, creating it with `config` if
    /// it does not exist yet.
    ///
    /// # Errors
    /// Returns any error from [`SmartCache::named`].
    pub fn get_or_create(&self, name: &str, config: CacheConfig) -> Result<Arc<SmartCache<K, V>>> {
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(name) {
            return Ok(Arc::clone(cache));
        }
        let cache = Arc::new(SmartCache::named(name, config)?);
        caches.insert(name.to_string(), Arc::clone(&cache));
        info!(cache = name, "Created cache");
        Ok(cache)
    }

    /// Closes and unregisters the cache, returning false if it did not exist.
    pub fn remove_cache(&self, name: &str) -> bool {
        let removed = self.caches.lock().remove(name);
        match removed {
            Some(cache) => {
                cache.close();
                info!(cache = name, "Removed cache");
                true
            }
            None => false,
        }
    }

    /// Returns the registered cache names, sorted.
    #[must_use]
    pub fn list_caches(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes and unregisters every cache.
    pub fn close_all(&self) {
        let caches: Vec<_> = self.caches.lock().drain().collect();
        for (name, cache) in caches {
            cache.close();
            info!(cache = %name, "Closed cache");
        }
    }
}

impl<K: CacheKey, V: CacheValue> Drop for CacheManager<K, V> {
    fn drop(&mut self) {
        self.close_all();
    }
}
