#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/tradelog/tradelog/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Single pooled connection.
pub mod connection;
/// Per-path pool registry.
pub mod manager;
/// The connection pool.
pub mod pool;

pub use connection::{ColumnInfo, DatabaseConnection};
pub use manager::ConnectionPoolManager;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
