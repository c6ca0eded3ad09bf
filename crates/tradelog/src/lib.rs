#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/tradelog/tradelog/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Caching, connection pooling and service wiring for the tradelog dashboard.
//!
//! This crate re-exports the cache and pool crates and ties them together:
//!
//! - [`AppContext`] - Owns every cache, pool and registered service
//! - [`ServiceRegistry`] - Named instances and lazily built factories
//! - [`TradeResultService`] - Layered lookup of trade results
//! - [`HttpPriceSource`] - Client for the option price API (requires `http` feature)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tradelog::{
//!     AppConfig, AppContext, HttpPriceSource, OptionType, TradeKey, TradeRequest,
//!     TradeResultService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tradelog::Result<()> {
//!     let ctx = AppContext::new(AppConfig::from_json_file("tradelog.json")?)?;
//!     let source = Arc::new(HttpPriceSource::new(&ctx.config().price_source)?);
//!     let service = TradeResultService::from_context(&ctx, source)?;
//!
//!     let trade = TradeKey::new("42", date, OptionType::Put, 6110);
//!     let request = TradeRequest::new(trade, "SPX", None);
//!     let lookup = service.load(&request).await?;
//!     println!("{:?}", lookup.result());
//!
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```

// Core types and traits
pub use tradelog_core::*;

// Caches and pools
pub use tradelog_cache::{
    ApiPriceCache, ApiPriceUsage, CacheEntry, CacheManager, CacheStatsSnapshot, CachedTradeResult,
    PersistentCacheStats, SmartCache, TradeResultUsage, TradeResultsCache,
};
pub use tradelog_pool::{
    ColumnInfo, ConnectionPool, ConnectionPoolManager, DatabaseConnection, PoolStats,
    PooledConnection,
};

mod context;
pub use context::{
    API_PRICE_CACHE_SERVICE, AppContext, CACHE_MANAGER_SERVICE, POOL_MANAGER_SERVICE,
    TRADE_RESULTS_CACHE_SERVICE,
};

mod derive;
pub use derive::{SESSION_CLOSE, derive_trade_result, epoch_time, parse_price, parse_time};

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "http")]
pub use http::HttpPriceSource;

mod lookup;
pub use lookup::{LookupSource, TradeLookup, TradeRequest, TradeResultService};

mod registry;
pub use registry::{ServiceKind, ServiceRegistry, TemporaryService};
