//! Application context owning every cache, pool and service.

use crate::registry::ServiceRegistry;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tradelog_cache::{ApiPriceCache, CacheManager, SmartCache, TradeResultsCache};
use tradelog_core::{AppConfig, Result};
use tradelog_pool::{ConnectionPool, ConnectionPoolManager};

/// Registry name of the [`CacheManager`].
pub const CACHE_MANAGER_SERVICE: &str = "cache_manager";
/// Registry name of the [`ConnectionPoolManager`].
pub const POOL_MANAGER_SERVICE: &str = "pool_manager";
/// Registry name of the [`ApiPriceCache`].
pub const API_PRICE_CACHE_SERVICE: &str = "api_price_cache";
/// Registry name of the [`TradeResultsCache`].
pub const TRADE_RESULTS_CACHE_SERVICE: &str = "trade_results_cache";

/// Everything the dashboard needs, built once at startup and passed around
/// by reference.
///
/// The core components are also registered in [`registry`](Self::registry)
/// under the `*_SERVICE` names so code that only has the registry can find
/// them.
pub struct AppContext {
    config: AppConfig,
    registry: ServiceRegistry,
    caches: Arc<CacheManager>,
    pools: Arc<ConnectionPoolManager>,
    api_prices: Arc<ApiPriceCache>,
    trade_results: Arc<TradeResultsCache>,
    shut_down: AtomicBool,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("caches", &self.caches.list_caches())
            .field("pools", &self.pools.list_pools())
            .field("services", &self.registry.list_services())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl AppContext {
    /// Validates `config` and builds every component.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, a cache thread
    /// cannot start, or a persistent cache file cannot be created.
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let caches = Arc::new(CacheManager::new());
        for named in &config.caches {
            caches.create_cache(&named.name, named.config.clone())?;
        }
        let pools = Arc::new(ConnectionPoolManager::new(config.pool.clone()));
        let api_prices = Arc::new(ApiPriceCache::from_config(&config.persistent)?);
        let trade_results = Arc::new(TradeResultsCache::from_config(&config.persistent)?);

        let registry = ServiceRegistry::new();
        registry.register_service(CACHE_MANAGER_SERVICE, Arc::clone(&caches));
        registry.register_service(POOL_MANAGER_SERVICE, Arc::clone(&pools));
        registry.register_service(API_PRICE_CACHE_SERVICE, Arc::clone(&api_prices));
        registry.register_service(TRADE_RESULTS_CACHE_SERVICE, Arc::clone(&trade_results));

        info!(
            caches = config.caches.len(),
            api_prices = %config.persistent.api_prices_path.display(),
            trade_results = %config.persistent.trade_results_path.display(),
            "Application context ready"
        );

        Ok(Self {
            config,
            registry,
            caches,
            pools,
            api_prices,
            trade_results,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The configuration the context was built from.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The service registry.
    #[must_use]
    pub const fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// The named in-memory caches.
    #[must_use]
    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.caches
    }

    /// Shortcut for `cache_manager().get_cache(name)`.
    #[must_use]
    pub fn cache(&self, name: &str) -> Option<Arc<SmartCache>> {
        self.caches.get_cache(name)
    }

    /// The connection pools, one per trade database.
    #[must_use]
    pub fn pool_manager(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    /// Returns the pool for `db_path`, creating it on first use.
    ///
    /// # Errors
    /// Returns an error if a new pool cannot be created.
    pub fn pool(&self, db_path: impl AsRef<Path>) -> Result<Arc<ConnectionPool>> {
        self.pools.get_or_create_pool(db_path)
    }

    /// The persistent cache of raw price series.
    #[must_use]
    pub fn api_price_cache(&self) -> &Arc<ApiPriceCache> {
        &self.api_prices
    }

    /// The persistent cache of derived trade results.
    #[must_use]
    pub fn trade_results_cache(&self) -> &Arc<TradeResultsCache> {
        &self.trade_results
    }

    /// Closes every cache and pool and empties the registry. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.caches.close_all();
        self.pools.close_all();
        self.registry.clear();
        info!("Application context shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
