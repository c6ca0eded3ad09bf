//! Typed configuration for caches, pools and the price source.
//!
//! Every struct deserializes with defaults for missing fields, so a partial
//! JSON document is enough. Durations are written as (fractional) seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TradelogError};

/// Name of the in-memory cache holding raw API responses.
pub const API_OPTIMIZER_CACHE: &str = "api_optimizer";

/// Name of the in-memory cache holding per-trade values.
pub const TRADE_CACHE: &str = "trade_cache";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Rule for choosing which entry leaves a full cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum EvictionPolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used.
    Lfu,
    /// First in, first out.
    Fifo,
}

impl EvictionPolicy {
    /// Returns the lowercase policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Fifo => "fifo",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = std::convert::Infallible;

    /// Unknown names fall back to LRU.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "lfu" => Self::Lfu,
            "fifo" => Self::Fifo,
            _ => Self::Lru,
        })
    }
}

impl From<String> for EvictionPolicy {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(policy) => policy,
            Err(never) => match never {},
        }
    }
}

/// Configuration for one in-memory [`SmartCache`](https://docs.rs/tradelog-cache).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub max_size: usize,
    /// TTL applied when `set` is called without one; `None` never expires.
    #[serde(with = "opt_secs")]
    pub default_ttl: Option<Duration>,
    /// Which entry to drop when the cache is full.
    pub eviction_policy: EvictionPolicy,
    /// Whether hit/miss counters are kept.
    pub enable_stats: bool,
    /// How often the reaper sweeps expired entries; zero disables the reaper.
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Some(Duration::from_secs(300)),
            eviction_policy: EvictionPolicy::Lru,
            enable_stats: true,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Sets the maximum number of entries.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the default TTL.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the eviction policy.
    #[must_use]
    pub const fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Sets the reaper interval.
    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Checks the configuration for values the cache cannot work with.
    ///
    /// # Errors
    /// Returns [`TradelogError::InvalidConfig`] if `max_size` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(TradelogError::InvalidConfig(
                "cache max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A cache configuration registered under a name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedCacheConfig {
    /// Registry name, e.g. `api_optimizer`.
    pub name: String,
    /// Cache settings.
    #[serde(flatten)]
    pub config: CacheConfig,
}

impl NamedCacheConfig {
    /// Creates a named cache configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Configuration for a SQLite connection pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on idle plus checked-out connections.
    pub max_connections: usize,
    /// Default wait for a free connection.
    #[serde(with = "secs")]
    pub acquire_timeout: Duration,
    /// SQLite busy timeout applied to each connection.
    #[serde(with = "secs")]
    pub busy_timeout: Duration,
    /// `PRAGMA journal_mode`.
    pub journal_mode: String,
    /// `PRAGMA synchronous`.
    pub synchronous: String,
    /// `PRAGMA cache_size`.
    pub cache_size: i64,
    /// `PRAGMA temp_store`.
    pub temp_store: String,
    /// `PRAGMA mmap_size` in bytes.
    pub mmap_size: i64,
    /// `PRAGMA foreign_keys`.
    pub foreign_keys: bool,
    /// Idle connections unused for longer than this are closed by the reaper.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// How often the reaper runs; zero disables it.
    #[serde(with = "secs")]
    pub reap_interval: Duration,
    /// Statements slower than this are logged as warnings.
    #[serde(with = "secs")]
    pub slow_query_threshold: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(30),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size: 10_000,
            temp_store: "MEMORY".to_string(),
            mmap_size: 268_435_456,
            foreign_keys: true,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            slow_query_threshold: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Sets the connection cap.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets the default acquisition timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the idle timeout and reaper interval.
    #[must_use]
    pub const fn with_idle_reaping(mut self, idle_timeout: Duration, interval: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self.reap_interval = interval;
        self
    }

    /// Checks the configuration for values the pool cannot work with.
    ///
    /// # Errors
    /// Returns [`TradelogError::InvalidConfig`] if `max_connections` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(TradelogError::InvalidConfig(
                "pool max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the two SQLite-backed result caches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentCacheConfig {
    /// Database file for raw API price series.
    pub api_prices_path: PathBuf,
    /// Database file for computed trade results.
    pub trade_results_path: PathBuf,
    /// API price rows older than this are ignored by reads.
    #[serde(with = "secs")]
    pub api_prices_max_age: Duration,
    /// Trade result rows older than this are ignored by reads.
    #[serde(with = "secs")]
    pub trade_results_max_age: Duration,
    /// SQLite busy timeout for each short-lived connection.
    #[serde(with = "secs")]
    pub busy_timeout: Duration,
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            api_prices_path: PathBuf::from("cache/api_prices.db"),
            trade_results_path: PathBuf::from("cache/trade_results.db"),
            api_prices_max_age: DAY * 7,
            trade_results_max_age: DAY * 30,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl PersistentCacheConfig {
    /// Places both database files inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            api_prices_path: dir.join("api_prices.db"),
            trade_results_path: dir.join("trade_results.db"),
            ..Default::default()
        }
    }

    /// Checks paths and staleness windows.
    ///
    /// # Errors
    /// Returns [`TradelogError::InvalidConfig`] for empty paths or zero windows.
    pub fn validate(&self) -> Result<()> {
        if self.api_prices_path.as_os_str().is_empty()
            || self.trade_results_path.as_os_str().is_empty()
        {
            return Err(TradelogError::InvalidConfig(
                "persistent cache paths must not be empty".to_string(),
            ));
        }
        if self.api_prices_max_age.is_zero() || self.trade_results_max_age.is_zero() {
            return Err(TradelogError::InvalidConfig(
                "persistent cache staleness windows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the remote option price API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceSourceConfig {
    /// Base URL of the API.
    pub base_url: String,
    /// Bar interval in minutes.
    pub interval: u32,
    /// Per-request timeout.
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// TTL for raw responses kept in the in-memory cache.
    #[serde(with = "secs")]
    pub memory_ttl: Duration,
    /// Asset used when a trade does not name one.
    pub default_asset: String,
}

impl Default for PriceSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.0dtespx.com".to_string(),
            interval: 1,
            request_timeout: Duration::from_secs(15),
            memory_ttl: Duration::from_secs(3600),
            default_asset: "SPX".to_string(),
        }
    }
}

impl PriceSourceConfig {
    /// Checks the base URL.
    ///
    /// # Errors
    /// Returns [`TradelogError::InvalidConfig`] if the URL or asset is empty.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(TradelogError::InvalidConfig(
                "price source base_url must not be empty".to_string(),
            ));
        }
        if self.default_asset.trim().is_empty() {
            return Err(TradelogError::InvalidConfig(
                "price source default_asset must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for the application context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Named in-memory caches created at startup.
    pub caches: Vec<NamedCacheConfig>,
    /// Settings applied to every connection pool.
    pub pool: PoolConfig,
    /// Settings for the SQLite result caches.
    pub persistent: PersistentCacheConfig,
    /// Settings for the remote price API.
    pub price_source: PriceSourceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            caches: vec![
                NamedCacheConfig::new(
                    API_OPTIMIZER_CACHE,
                    CacheConfig::default().with_default_ttl(Some(Duration::from_secs(3600))),
                ),
                NamedCacheConfig::new(TRADE_CACHE, CacheConfig::default()),
            ],
            pool: PoolConfig::default(),
            persistent: PersistentCacheConfig::default(),
            price_source: PriceSourceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| TradelogError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section and rejects duplicate cache names.
    ///
    /// # Errors
    /// Returns [`TradelogError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for named in &self.caches {
            if !seen.insert(named.name.as_str()) {
                return Err(TradelogError::InvalidConfig(format!(
                    "duplicate cache name: {}",
                    named.name
                )));
            }
            named.config.validate()?;
        }
        self.pool.validate()?;
        self.persistent.validate()?;
        self.price_source.validate()
    }
}

/// Serde adapter writing a [`Duration`] as seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter writing an optional [`Duration`] as seconds or `null`.
mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
