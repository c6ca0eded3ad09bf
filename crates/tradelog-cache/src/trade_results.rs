//! Persistent cache of results derived for individual trades.

use crate::sqlite::{PersistentCacheStats, SqliteStore, cache_key, cutoff, db_err, now};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};
use tradelog_core::{PersistentCacheConfig, Result, TradeKey, TradeResult};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS trade_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cache_key TEXT UNIQUE NOT NULL,
        trade_id TEXT NOT NULL,
        trade_date TEXT NOT NULL,
        option_type TEXT NOT NULL,
        strike INTEGER NOT NULL,
        handelsende_preis REAL,
        peak_preis REAL,
        peak_zeit TEXT,
        api_link TEXT,
        created_at TEXT NOT NULL,
        last_accessed TEXT NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_trade_results_lookup
        ON trade_results(trade_id, trade_date, option_type, strike);
    CREATE INDEX IF NOT EXISTS idx_trade_results_created
        ON trade_results(created_at);
";

/// Stats size estimate per row; the rows are small and fixed-shape.
const APPROX_ROW_BYTES: u64 = 200;

/// A trade result read back from the cache.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CachedTradeResult {
    /// The stored values.
    #[serde(flatten)]
    pub result: TradeResult,
    /// When the row was written, UTC.
    pub cached_at: String,
    /// Always true; lets callers tell cached results from fresh ones.
    pub cache_hit: bool,
}

/// Access summary of one cached trade.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TradeResultUsage {
    /// Trade identifier.
    pub trade_id: String,
    /// Trade date, `YYYY-MM-DD`.
    pub trade_date: String,
    /// `C` or `P`.
    pub option_type: String,
    /// Strike price.
    pub strike: i64,
    /// Reads plus the initial write.
    pub access_count: i64,
    /// Last read or write, UTC.
    pub last_accessed: String,
}

/// SQLite cache of [`TradeResult`]s keyed by trade.
#[derive(Debug)]
pub struct TradeResultsCache {
    store: SqliteStore,
    max_age: Duration,
}

impl TradeResultsCache {
    /// Retention used by periodic maintenance.
    pub const DEFAULT_RETENTION_DAYS: u32 = 60;

    /// Opens (or creates) the cache at `path`.
    ///
    /// # Errors
    /// Returns an error if the parent directory or the schema cannot be created.
    pub fn new(path: impl AsRef<Path>, max_age: Duration) -> Result<Self> {
        let store = SqliteStore::open(path, "trade_results", SCHEMA, Duration::from_secs(5))?;
        Ok(Self { store, max_age })
    }

    /// Opens the cache at the configured path.
    ///
    /// # Errors
    /// Returns an error if the parent directory or the schema cannot be created.
    pub fn from_config(config: &PersistentCacheConfig) -> Result<Self> {
        let store = SqliteStore::open(
            &config.trade_results_path,
            "trade_results",
            SCHEMA,
            config.busy_timeout,
        )?;
        Ok(Self {
            store,
            max_age: config.trade_results_max_age,
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Returns the stored result for `trade` if a fresh row exists.
    ///
    /// # Errors
    /// Returns an error if the database cannot be read.
    #[instrument(skip(self), fields(trade = %trade))]
    pub fn get_cached_results(&self, trade: &TradeKey) -> Result<Option<CachedTradeResult>> {
        let key = cache_key(&trade.key_material());
        let conn = self.store.connect()?;

        let cached = conn
            .query_row(
                "SELECT handelsende_preis, peak_preis, peak_zeit, api_link, created_at
                 FROM trade_results WHERE cache_key = ?1 AND created_at > ?2",
                params![key, cutoff(self.max_age)],
                |row| {
                    Ok(CachedTradeResult {
                        result: TradeResult {
                            end_of_day_price: row.get(0)?,
                            peak_price: row.get(1)?,
                            peak_time: row.get(2)?,
                            api_link: row.get(3)?,
                        },
                        cached_at: row.get(4)?,
                        cache_hit: true,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;

        match cached {
            Some(cached) => {
                conn.execute(
                    "UPDATE trade_results SET last_accessed = ?1, access_count = access_count + 1
                     WHERE cache_key = ?2",
                    params![now(), key],
                )
                .map_err(db_err)?;
                debug!("Trade result cache hit");
                Ok(Some(cached))
            }
            None => {
                debug!("Trade result cache miss");
                Ok(None)
            }
        }
    }

    /// Stores `result` for `trade`, replacing any previous row.
    ///
    /// # Errors
    /// Returns an error if the database cannot be written.
    #[instrument(skip(self, result), fields(trade = %trade))]
    pub fn cache_trade_results(&self, trade: &TradeKey, result: &TradeResult) -> Result<()> {
        let written_at = now();
        self.store
            .connect()?
            .execute(
                "INSERT OR REPLACE INTO trade_results
                 (cache_key, trade_id, trade_date, option_type, strike,
                  handelsende_preis, peak_preis, peak_zeit, api_link,
                  created_at, last_accessed, access_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 1)",
                params![
                    cache_key(&trade.key_material()),
                    trade.trade_id,
                    trade.date_str(),
                    trade.option_type.code(),
                    trade.strike,
                    result.end_of_day_price,
                    result.peak_price,
                    result.peak_time,
                    result.api_link,
                    written_at,
                ],
            )
            .map_err(db_err)?;
        debug!("Cached trade result");
        Ok(())
    }

    /// Deletes rows older than `days` days and returns how many went.
    ///
    /// # Errors
    /// Returns an error if the database cannot be written.
    #[instrument(skip(self))]
    pub fn clear_old_cache(&self, days: u32) -> Result<usize> {
        let removed = self.store.clear_older_than(days)?;
        debug!(removed, "Cleared old trade result rows");
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

    /// Returns row counts, an estimated size and the `top_n` most read trades.
    ///
    /// # Errors
    /// Returns an error if the database cannot be read.
    pub fn stats(&self, top_n: usize) -> Result<PersistentCacheStats<TradeResultUsage>> {
        let total_entries = self.store.total_entries()?;
        let recent_entries = self.store.recent_entries(self.max_age)?;

        let conn = self.store.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT trade_id, trade_date, option_type, strike, access_count, last_accessed
                 FROM trade_results
                 ORDER BY access_count DESC, last_accessed DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;
        let top_entries = stmt
            .query_map(params![i64::try_from(top_n).unwrap_or(i64::MAX)], |row| {
                Ok(TradeResultUsage {
                    trade_id: row.get(0)?,
                    trade_date: row.get(1)?,
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
            approx_size_bytes: total_entries as u64 * APPROX_ROW_BYTES,
            top_entries,
        })
    }
}
