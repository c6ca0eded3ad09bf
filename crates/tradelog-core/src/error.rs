//! Error types for the caching and pooling layer.
//!
//! This module defines [`TradelogError`] which covers every failure the
//! caches, connection pools and service registry can surface to callers.
//! Expected misses are never errors; they are reported as `Ok(None)`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the caching, pooling and registry layer.
#[derive(Error, Debug)]
pub enum TradelogError {
    /// Error reported by SQLite.
    #[error("Database error: {0}")]
    Database(String),

    /// Filesystem error with the path that caused it.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration value was rejected during validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A named in-memory cache is already registered.
    #[error("Cache already exists: {0}")]
    CacheAlreadyExists(String),

    /// A connection pool for this database path is already registered.
    #[error("Connection pool already exists for {0}")]
    PoolAlreadyExists(String),

    /// No pooled connection became available within the timeout.
    #[error("No database connection available for {db_path} within {timeout:?}")]
    PoolExhausted {
        /// The database the pool serves.
        db_path: String,
        /// How long the caller waited.
        timeout: Duration,
    },

    /// The connection pool has been shut down.
    #[error("Connection pool closed: {0}")]
    PoolClosed(String),

    /// No service or factory is registered under this name.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// A service exists but has a different concrete type than requested.
    #[error("Service {name} is not of type {expected}")]
    ServiceTypeMismatch {
        /// The registered service name.
        name: String,
        /// The type the caller asked for.
        expected: &'static str,
    },

    /// A service factory failed while building its instance.
    #[error("Failed to construct service {name}: {reason}")]
    ServiceConstruction {
        /// The registered service name.
        name: String,
        /// Why the factory failed.
        reason: String,
    },

    /// The remote price source failed.
    #[error("Price source {source_name} failed: {reason}")]
    PriceSource {
        /// The source that failed.
        source_name: String,
        /// Why it failed.
        reason: String,
    },

    /// A background thread could not be spawned.
    #[error("Failed to spawn background thread {name}: {reason}")]
    Thread {
        /// The thread name.
        name: String,
        /// Why spawning failed.
        reason: String,
    },

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl TradelogError {
    /// Creates an I/O error carrying the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a price-source error.
    pub fn price_source(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::PriceSource {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error means the pool had no capacity in time.
    #[must_use]
    pub const fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

impl From<serde_json::Error> for TradelogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using [`TradelogError`].
pub type Result<T> = std::result::Result<T, TradelogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_display() {
        let err = TradelogError::PoolExhausted {
            db_path: "trades.db".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert!(err.is_pool_exhausted());
        assert_eq!(
            err.to_string(),
            "No database connection available for trades.db within 250ms"
        );
    }

    #[test]
    fn test_io_error_keeps_path() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = TradelogError::io("/root/cache", source);
        assert!(err.to_string().starts_with("I/O error at /root/cache"));
        assert!(!err.is_pool_exhausted());
    }
}
