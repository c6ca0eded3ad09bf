//! Layered lookup of trade results.
//!
//! A request is answered by the first layer that has data:
//!
//! 1. the persistent trade-results cache,
//! 2. the persistent API-price cache,
//! 3. the in-memory `api_optimizer` cache,
//! 4. the remote [`PriceSource`].
//!
//! Raw series fetched remotely are written back to both price caches, and
//! derived results with an end-of-day price go to the trade-results cache.

use crate::context::AppContext;
use crate::derive::derive_trade_result;
use chrono::NaiveTime;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use tradelog_cache::{ApiPriceCache, SmartCache, TradeResultsCache};
use tradelog_core::{
    API_OPTIMIZER_CACHE, CacheConfig, ContractKey, PriceSeries, PriceSource, Result, TradeKey,
    TradeResult,
};

/// One trade to enrich.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradeRequest {
    /// The trade and its contract.
    pub trade: TradeKey,
    /// Underlying asset of the contract.
    pub asset: String,
    /// Time the trade was opened; the peak is searched from here on.
    pub opened_at: Option<NaiveTime>,
}

impl TradeRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(trade: TradeKey, asset: impl Into<String>, opened_at: Option<NaiveTime>) -> Self {
        Self {
            trade,
            asset: asset.into(),
            opened_at,
        }
    }

    /// The contract whose prices the result is derived from.
    #[must_use]
    pub fn contract(&self) -> ContractKey {
        self.trade.contract(self.asset.clone())
    }
}

/// The layer that answered a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    /// A stored trade result.
    TradeResults,
    /// A stored price series from the persistent cache.
    ApiPrices,
    /// A price series from the in-memory cache.
    Memory,
    /// A fresh response from the price source.
    Remote,
}

impl fmt::Display for LookupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TradeResults => "trade_results",
            Self::ApiPrices => "api_prices",
            Self::Memory => "memory",
            Self::Remote => "remote",
        };
        f.write_str(name)
    }
}

/// Outcome of a lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum TradeLookup {
    /// A result was found or derived.
    Found {
        /// The values for the trade.
        result: TradeResult,
        /// Which layer answered.
        source: LookupSource,
    },
    /// No layer had data for the trade yet.
    Unavailable,
}

impl TradeLookup {
    /// The result, if one was found.
    #[must_use]
    pub const fn result(&self) -> Option<&TradeResult> {
        match self {
            Self::Found { result, .. } => Some(result),
            Self::Unavailable => None,
        }
    }

    /// The answering layer, if a result was found.
    #[must_use]
    pub const fn source(&self) -> Option<LookupSource> {
        match self {
            Self::Found { source, .. } => Some(*source),
            Self::Unavailable => None,
        }
    }
}

/// Resolves [`TradeRequest`]s through the cache layers and a [`PriceSource`].
pub struct TradeResultService {
    source: Arc<dyn PriceSource>,
    api_prices: Arc<ApiPriceCache>,
    trade_results: Arc<TradeResultsCache>,
    memory: Arc<SmartCache>,
    memory_ttl: Duration,
}

impl fmt::Debug for TradeResultService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradeResultService")
            .field("source", &self.source.name())
            .field("memory", &self.memory.name())
            .field("memory_ttl", &self.memory_ttl)
            .finish_non_exhaustive()
    }
}

impl TradeResultService {
    /// Creates a service over explicit components.
    #[must_use]
    pub fn new(
        source: Arc<dyn PriceSource>,
        api_prices: Arc<ApiPriceCache>,
        trade_results: Arc<TradeResultsCache>,
        memory: Arc<SmartCache>,
        memory_ttl: Duration,
    ) -> Self {
        Self {
            source,
            api_prices,
            trade_results,
            memory,
            memory_ttl,
        }
    }

    /// Creates a service over the context's caches, creating the
    /// `api_optimizer` cache if the configuration did not.
    ///
    /// # Errors
    /// Returns an error if the in-memory cache has to be created and cannot be.
    pub fn from_context(ctx: &AppContext, source: Arc<dyn PriceSource>) -> Result<Self> {
        let memory_ttl = ctx.config().price_source.memory_ttl;
        let memory = ctx.cache_manager().get_or_create(
            API_OPTIMIZER_CACHE,
            CacheConfig::default().with_default_ttl(Some(memory_ttl)),
        )?;
        Ok(Self::new(
            source,
            Arc::clone(ctx.api_price_cache()),
            Arc::clone(ctx.trade_results_cache()),
            memory,
            memory_ttl,
        ))
    }

    /// Looks up the result for one trade.
    ///
    /// # Errors
    /// Returns an error only if the price source fails. Cache failures are
    /// logged and treated as misses.
    #[instrument(skip(self), fields(trade = %request.trade))]
    pub async fn load(&self, request: &TradeRequest) -> Result<TradeLookup> {
        match self.trade_results.get_cached_results(&request.trade) {
            Ok(Some(cached)) => {
                return Ok(TradeLookup::Found {
                    result: cached.result,
                    source: LookupSource::TradeResults,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Trade results cache read failed, continuing"),
        }

        let contract = request.contract();
        let Some((series, source)) = self.price_series(&contract).await? else {
            debug!(contract = %contract, "No price data available yet");
            return Ok(TradeLookup::Unavailable);
        };

        let result = derive_trade_result(&series, request.opened_at, self.source.link(&contract));
        if result.end_of_day_price.is_some() {
            if let Err(e) = self.trade_results.cache_trade_results(&request.trade, &result) {
                warn!(error = %e, "Failed to store trade result");
            }
        }
        debug!(%source, "Derived trade result");
        Ok(TradeLookup::Found { result, source })
    }

    /// Looks up several trades in order, one outcome per request.
    pub async fn load_many(&self, requests: &[TradeRequest]) -> Vec<Result<TradeLookup>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.load(request).await);
        }
        outcomes
    }

    async fn price_series(
        &self,
        contract: &ContractKey,
    ) -> Result<Option<(PriceSeries, LookupSource)>> {
        match self.api_prices.get_cached_price(contract) {
            Ok(Some(series)) if !series.is_empty() => {
                return Ok(Some((series, LookupSource::ApiPrices)));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "API price cache read failed, continuing"),
        }

        let memory_key = contract.key_material();
        if let Some(Value::Array(series)) = self.memory.get(memory_key.as_str()) {
            if !series.is_empty() {
                return Ok(Some((series, LookupSource::Memory)));
            }
        }

        let series = match self.source.fetch_option_prices(contract).await? {
            Some(series) if !series.is_empty() => series,
            _ => return Ok(None),
        };

        self.memory.set(
            memory_key,
            Value::Array(series.clone()),
            Some(self.memory_ttl),
            true,
        );
        if let Err(e) = self.api_prices.cache_price_data(contract, &series) {
            warn!(error = %e, "Failed to store price data");
        }
        Ok(Some((series, LookupSource::Remote)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tradelog_core::{AppConfig, OptionType, PersistentCacheConfig, TradelogError};

    #[derive(Debug, Default)]
    struct ScriptedSource {
        responses: Mutex<Vec<Result<Option<PriceSeries>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn returning(responses: Vec<Result<Option<PriceSeries>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_option_prices(&self, _contract: &ContractKey) -> Result<Option<PriceSeries>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(None)
            } else {
                responses.remove(0)
            }
        }

        fn link(&self, contract: &ContractKey) -> Option<String> {
            Some(format!("scripted://{}", contract.key_material()))
        }
    }

    fn series() -> PriceSeries {
        vec![
            json!({"dateTime": "2025-02-14T16:00:00", "price": 1.2}),
            json!({"dateTime": "2025-02-14T18:30:00", "price": 0.35}),
            json!({"dateTime": "2025-02-14T22:00:00", "price": 0.05}),
        ]
    }

    fn request(id: &str) -> TradeRequest {
        TradeRequest::new(
            TradeKey::new(
                id,
                NaiveDate::from_ymd_opt(2025, 2, 14).unwrap(),
                OptionType::Put,
                6110,
            ),
            "SPX",
            NaiveTime::from_hms_opt(17, 0, 0),
        )
    }

    fn context(dir: &TempDir) -> AppContext {
        let mut config = AppConfig {
            persistent: PersistentCacheConfig::in_dir(dir.path()),
            ..AppConfig::default()
        };
        for named in &mut config.caches {
            named.config.cleanup_interval = Duration::ZERO;
        }
        AppContext::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_remote_then_trade_results() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let source = ScriptedSource::returning(vec![Ok(Some(series()))]);
        let service = TradeResultService::from_context(&ctx, source.clone()).unwrap();

        let first = service.load(&request("1")).await.unwrap();
        assert_eq!(first.source(), Some(LookupSource::Remote));
        let result = first.result().unwrap();
        assert_eq!(result.end_of_day_price, Some(0.05));
        assert_eq!(result.peak_price, Some(0.05));
        assert_eq!(result.peak_time.as_deref(), Some("22:00:00"));
        assert_eq!(
            result.api_link.as_deref(),
            Some("scripted://SPX_2025-02-14_P_6110")
        );

        let second = service.load(&request("1")).await.unwrap();
        assert_eq!(second.source(), Some(LookupSource::TradeResults));
        assert_eq!(second.result(), first.result());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_other_trade_on_same_contract_uses_price_cache() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let source = ScriptedSource::returning(vec![Ok(Some(series()))]);
        let service = TradeResultService::from_context(&ctx, source.clone()).unwrap();

        service.load(&request("1")).await.unwrap();
        let other = service.load(&request("2")).await.unwrap();
        assert_eq!(other.source(), Some(LookupSource::ApiPrices));
        assert_eq!(source.calls(), 1);
        assert_eq!(ctx.api_price_cache().total_entries().unwrap(), 1);
        assert_eq!(ctx.trade_results_cache().total_entries().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memory_layer_answers_when_persistent_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let source = ScriptedSource::returning(vec![Ok(Some(series()))]);
        let service = TradeResultService::from_context(&ctx, source.clone()).unwrap();

        service.load(&request("1")).await.unwrap();
        ctx.api_price_cache().clear_all_cache().unwrap();

        let lookup = service.load(&request("2")).await.unwrap();
        assert_eq!(lookup.source(), Some(LookupSource::Memory));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let source = ScriptedSource::returning(vec![
            Ok(None),
            Err(TradelogError::price_source("scripted", "connection reset")),
            Ok(Some(Vec::new())),
        ]);
        let service = TradeResultService::from_context(&ctx, source.clone()).unwrap();

        let outcomes = service
            .load_many(&[request("1"), request("2"), request("3")])
            .await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].as_ref().unwrap(), &TradeLookup::Unavailable);
        assert!(matches!(outcomes[1], Err(TradelogError::PriceSource { .. })));
        assert_eq!(outcomes[2].as_ref().unwrap(), &TradeLookup::Unavailable);
        assert_eq!(ctx.trade_results_cache().total_entries().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_result_without_end_of_day_price_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let source = ScriptedSource::returning(vec![Ok(Some(vec![
            json!({"dateTime": "2025-02-14T18:00:00", "price": "n/a"}),
        ]))]);
        let service = TradeResultService::from_context(&ctx, source).unwrap();

        let lookup = service.load(&request("1")).await.unwrap();
        assert!(lookup.result().unwrap().is_empty());
        assert_eq!(ctx.trade_results_cache().total_entries().unwrap(), 0);
    }
}
