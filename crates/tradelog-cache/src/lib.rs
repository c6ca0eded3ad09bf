#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/tradelog/tradelog/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Caching for the tradelog dashboard.
//!
//! - [`SmartCache`] - In-memory TTL cache with pluggable eviction
//! - [`CacheManager`] - Registry of named in-memory caches
//! - [`ApiPriceCache`] - Persistent cache of raw price series (requires `sqlite` feature)
//! - [`TradeResultsCache`] - Persistent cache of derived trade results (requires `sqlite` feature)

/// Named cache registry.
pub mod manager;
/// In-memory cache implementation.
pub mod memory;

/// SQLite-backed cache of API price series.
#[cfg(feature = "sqlite")]
pub mod api_prices;
/// Shared SQLite helpers.
#[cfg(feature = "sqlite")]
pub mod sqlite;
/// SQLite-backed cache of trade results.
#[cfg(feature = "sqlite")]
pub mod trade_results;

pub use manager::CacheManager;
pub use memory::{CacheEntry, CacheKey, CacheStatsSnapshot, CacheValue, SmartCache};

#[cfg(feature = "sqlite")]
pub use api_prices::{ApiPriceCache, ApiPriceUsage};
#[cfg(feature = "sqlite")]
pub use sqlite::{PersistentCacheStats, TIMESTAMP_FORMAT};
#[cfg(feature = "sqlite")]
pub use trade_results::{CachedTradeResult, TradeResultUsage, TradeResultsCache};
