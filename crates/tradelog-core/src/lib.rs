#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/tradelog/tradelog/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core types for the tradelog caching and pooling layer.
//!
//! This crate provides the pieces shared by every other crate in the workspace:
//!
//! - [`TradelogError`](error::TradelogError) - Error type and [`Result`] alias
//! - [`AppConfig`](config::AppConfig) - Typed configuration for caches, pools and the price API
//! - [`ContractKey`](types::ContractKey) / [`TradeKey`](types::TradeKey) - Cache lookup tuples
//! - [`PriceSource`](source::PriceSource) - Abstraction over the remote price API
//! - [`PerformanceMonitor`](timing::PerformanceMonitor) - Explicit operation timing

/// Typed configuration structs.
pub mod config;
/// Error types.
pub mod error;
/// Remote price source trait.
pub mod source;
/// Operation timing helper.
pub mod timing;
/// Domain key and result types.
pub mod types;

// Re-export commonly used items at crate root
pub use config::{
    API_OPTIMIZER_CACHE, AppConfig, CacheConfig, EvictionPolicy, NamedCacheConfig,
    PersistentCacheConfig, PoolConfig, PriceSourceConfig, TRADE_CACHE,
};
pub use error::{Result, TradelogError};
pub use source::PriceSource;
pub use timing::{OperationStats, PerformanceMonitor};
pub use types::{ContractKey, DATE_FORMAT, OptionType, PriceSeries, TradeKey, TradeResult};
