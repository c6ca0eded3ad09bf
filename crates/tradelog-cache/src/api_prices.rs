//! Persistent cache of raw option price series returned by the price API.

use crate::sqlite::{PersistentCacheStats, SqliteStore, cache_key, cutoff, db_err, now};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use tradelog_core::{ContractKey, PersistentCacheConfig, PriceSeries, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS api_prices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cache_key TEXT UNIQUE NOT NULL,
        asset TEXT NOT NULL,
        date TEXT NOT NULL,
        option_type TEXT NOT NULL,
        strike INTEGER NOT NULL,
        price_data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_accessed TEXT NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_api_prices_lookup
        ON api_prices(asset, date, option_type, strike);
    CREATE INDEX IF NOT EXISTS idx_api_prices_created
        ON api_prices(created_at);
";

/// Access summary of one cached contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiPriceUsage {
    /// Underlying asset.
    pub asset: String,
    /// Trading date, `YYYY-MM-DD`.
    pub date: String,
    /// `C` or `P`.
    pub option_type: String,
    /// Strike price.
    pub strike: i64,
    /// Reads plus the initial write.
    pub access_count: i64,
    /// Last read or write, UTC.
    pub last_accessed: String,
}

/// SQLite cache of price series keyed by contract.
///
/// Rows older than the staleness window are ignored by reads but stay on
/// disk until [`clear_old_cache`](Self::clear_old_cache) removes them.
#[derive(Debug)]
pub struct ApiPriceCache {
    store: SqliteStore,
    max_age: Duration,
}

impl ApiPriceCache {
    /// Retention used by periodic maintenance.
    pub const DEFAULT_RETENTION_DAYS: u32 = 30;

    /// Opens (or creates) the cache at `path`.
    ///
    /// # Errors
    /// Returns an error if the parent directory or the schema cannot be created.
    pub fn new(path: impl AsRef<Path>, max_age: Duration) -> Result<Self> {
        Self::with_busy_timeout(path, max_age, Duration::from_secs(5))
    }

    /// Opens the cache at the configured path.
    ///
    /// # Errors
    /// Returns an error if the parent directory or the schema cannot be created.
    pub fn from_config(config: &PersistentCacheConfig) -> Result<Self> {
        Self::with_busy_timeout(
            &config.api_prices_path,
            config.api_prices_max_age,
            config.busy_timeout,
        )
    }

    fn with_busy_timeout(
        path: impl AsRef<Path>,
        max_age: Duration,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let store = SqliteStore::open(path, "api_prices", SCHEMA, busy_timeout)?;
        Ok(Self { store, max_age })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Returns the cached series for `contract` if a fresh row exists.
    ///
    /// A hit bumps the row's access count. A payload that no longer parses
    /// as a JSON array is logged and reported as a miss.
    ///
    /// # Errors
    /// Returns an error if the database cannot be read.
    #[instrument(skip(self), fields(contract = %contract))]
    pub fn get_cached_price(&self, contract: &ContractKey) -> Result<Option<PriceSeries>> {
        let key = cache_key(&contract.key_material());
        let conn = self.store.connect()?;

        let payload: Option<String> = conn
            .query_row(
                "SELECT price_data FROM api_prices WHERE cache_key = ?1 AND created_at > ?2",
                params![key, cutoff(self.max_age)],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let Some(payload) = payload else {
            debug!("API price cache miss");
            return Ok(None);
        };

        conn.execute(
            "UPDATE api_prices SET last_accessed = ?1, access_count = access_count + 1
             WHERE cache_key = ?2",
            params![now(), key],
        )
        .map_err(db_err)?;

        match serde_json::from_str::<PriceSeries>(&payload) {
            Ok(series) => {
                debug!(points = series.len(), "API price cache hit");
                Ok(Some(series))
            }
            Err(e) => {
                warn!(error = %e, "Discarding malformed cached price data");
                Ok(None)
            }
        }
    }

    /// Stores `series` for `contract`, replacing any previous row.
    ///
    /// # Errors
    /// Returns an error if the series cannot be serialized or written.
    #[instrument(skip(self, series), fields(contract = %contract, points = series.len()))]
    pub fn cache_price_data(&self, contract: &ContractKey, series: &[serde_json::Value]) -> Result<()> {
        let payload = serde_json::to_string(series)?;
        let written_at = now();
        let conn = self.store.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO api_prices
             (cache_key, asset, date, option_type, strike, price_data,
              created_at, last_accessed, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1)",
            params![
                cache_key(&contract.key_material()),
                contract.asset,
                contract.date_str(),
                contract.option_type.code(),
                contract.strike,
                payload,
                written_at,
            ],
        )
        .map_err(db_err)?;
        debug!("Cached API price data");
        Ok(())
    }

    /// Deletes rows older than `days` days and returns how many went.
    ///
    /// # Errors
    /// Returns an error if the database cannot be written.
    #[instrument(skip(self))]
    pub fn clear_old_cache(&self, days: u32) -> Result<usize> {
        let removed = self.store.clear_older_than(days)?;
        debug!(removed, "Cleared old API price rows");
        Ok(removed)
    }

    /// Deletes every row.
    ///
    /// # Errors
    /// Returns an error if the database cannot be written.
    pub fn clear_all_cache(&self) -> Result<usize> {
        self.store.clear_all()
    }

    /// Number of rows, stale ones included.
    ///
    /// # Errors
    /// Returns an error if the database cannot be read.
    pub fn total_entries(&self) -> Result<usize> {
        self.store.total_entries()
    }

    /// Returns row counts, payload size and the `top_n` most read contracts.
    ///
    /// # Errors
    /// Returns an error if the database cannot be read.
    pub fn stats(&self, top_n: usize) -> Result<PersistentCacheStats<ApiPriceUsage>> {
        let total_entries = self.store.total_entries()?;
        let recent_entries = self.store.recent_entries(self.max_age)?;

        let conn = self.store.connect()?;
        let size: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(LENGTH(price_data)), 0) FROM api_prices",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT asset, date, option_type, strike, access_count, last_accessed
                 FROM api_prices
                 ORDER BY access_count DESC, last_accessed DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;
        let top_entries = stmt
            .query_map(params![i64::try_from(top_n).unwrap_or(i64::MAX)], |row| {
                Ok(ApiPriceUsage {
                    asset: row.get(0)?,
                    date: row.get(1)?,
                    option_type: row.get(2)?,
                    strike: row.get(3)?,
                    access_count: row.get(4)?,
                    last_accessed: row.get(5)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        Ok(PersistentCacheStats {
            total_entries,
            recent_entries,
            approx_size_bytes: u64::try_from(size).unwrap_or_default(),
            top_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::{days, timestamp};
    use chrono::{NaiveDate, TimeDelta, Utc};
    use rusqlite::Connection;
    use serde_json::json;
    use tempfile::TempDir;
    use tradelog_core::OptionType;

    fn cache() -> (TempDir, ApiPriceCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ApiPriceCache::new(dir.path().join("cache").join("api_prices.db"), days(7))
            .unwrap();
        (dir, cache)
    }

    fn spx_call() -> ContractKey {
        ContractKey::new(
            "SPX",
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            OptionType::Call,
            6000,
        )
    }

    fn backdate(cache: &ApiPriceCache, age_days: i64) {
        let created = timestamp(Utc::now() - TimeDelta::days(age_days));
        Connection::open(cache.path())
            .unwrap()
            .execute("UPDATE api_prices SET created_at = ?1", params![created])
            .unwrap();
    }

    fn series() -> Vec<serde_json::Value> {
        vec![
            json!({"dateTime": "2025-01-01T15:30:00", "price": 12.5}),
            json!({"dateTime": "2025-01-01T22:00:00", "price": "$3,10"}),
        ]
    }

    #[test]
    fn test_round_trip_then_stale() {
        let (_dir, cache) = cache();
        assert_eq!(cache.get_cached_price(&spx_call()).unwrap(), None);

        cache.cache_price_data(&spx_call(), &series()).unwrap();
        assert_eq!(cache.get_cached_price(&spx_call()).unwrap(), Some(series()));

        backdate(&cache, 8);
        assert_eq!(cache.get_cached_price(&spx_call()).unwrap(), None);
        assert_eq!(cache.total_entries().unwrap(), 1);
    }

    #[test]
    fn test_staleness_boundary() {
        let (_dir, cache) = cache();
        cache.cache_price_data(&spx_call(), &series()).unwrap();

        backdate(&cache, 6);
        assert!(cache.get_cached_price(&spx_call()).unwrap().is_some());

        backdate(&cache, 8);
        assert!(cache.get_cached_price(&spx_call()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_one_row() {
        let (_dir, cache) = cache();
        cache.cache_price_data(&spx_call(), &series()).unwrap();
        backdate(&cache, 3);
        cache.cache_price_data(&spx_call(), &series()[..1]).unwrap();

        assert_eq!(cache.total_entries().unwrap(), 1);
        assert_eq!(cache.get_cached_price(&spx_call()).unwrap().unwrap().len(), 1);

        let created: String = Connection::open(cache.path())
            .unwrap()
            .query_row("SELECT created_at FROM api_prices", [], |row| row.get(0))
            .unwrap();
        assert!(created > cutoff(days(1)));
    }

    #[test]
    fn test_hits_bump_access_count() {
        let (_dir, cache) = cache();
        let call = spx_call();
        let put = ContractKey::new("SPX", call.date, OptionType::Put, 5900);
        cache.cache_price_data(&call, &series()).unwrap();
        cache.cache_price_data(&put, &series()).unwrap();

        cache.get_cached_price(&call).unwrap();
        cache.get_cached_price(&call).unwrap();

        let stats = cache.stats(5).unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.recent_entries, 2);
        assert!(stats.approx_size_bytes > 0);
        assert_eq!(stats.top_entries.len(), 2);
        assert_eq!(stats.top_entries[0].option_type, "C");
        assert_eq!(stats.top_entries[0].strike, 6000);
        assert_eq!(stats.top_entries[0].access_count, 3);
        assert_eq!(cache.stats(1).unwrap().top_entries.len(), 1);
    }

    #[test]
    fn test_malformed_payload_is_a_miss() {
        let (_dir, cache) = cache();
        cache.cache_price_data(&spx_call(), &series()).unwrap();
        Connection::open(cache.path())
            .unwrap()
            .execute("UPDATE api_prices SET price_data = '{not json'", [])
            .unwrap();

        assert_eq!(cache.get_cached_price(&spx_call()).unwrap(), None);
    }

    #[test]
    fn test_maintenance() {
        let (_dir, cache) = cache();
        cache.cache_price_data(&spx_call(), &series()).unwrap();
        backdate(&cache, 40);
        cache
            .cache_price_data(
                &ContractKey::new("SPX", spx_call().date, OptionType::Put, 6000),
                &series(),
            )
            .unwrap();

        assert_eq!(cache.clear_old_cache(ApiPriceCache::DEFAULT_RETENTION_DAYS).unwrap(), 1);
        assert_eq!(cache.total_entries().unwrap(), 1);
        assert_eq!(cache.clear_all_cache().unwrap(), 1);
        assert_eq!(cache.stats(5).unwrap().approx_size_bytes, 0);
    }
}
