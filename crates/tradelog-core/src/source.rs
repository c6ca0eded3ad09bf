//! Trait for the remote option price API.
//!
//! The lookup flow only needs two things from the upstream API: the raw
//! price series for a contract and a link the UI can show next to the
//! derived values. Everything else about the API is owned elsewhere.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::{
    error::Result,
    types::{ContractKey, PriceSeries},
};

/// Source of intraday option price series.
#[async_trait]
pub trait PriceSource: Send + Sync + Debug {
    /// Returns the name of this source (e.g., "0dtespx").
    fn name(&self) -> &str;

    /// Fetches the price series for one contract.
    ///
    /// Returns `Ok(None)` when the source answered but has no data for the
    /// contract; transport failures are errors.
    async fn fetch_option_prices(&self, contract: &ContractKey) -> Result<Option<PriceSeries>>;

    /// Returns a human-followable link to the raw data, if the source has one.
    fn link(&self, _contract: &ContractKey) -> Option<String> {
        None
    }
}
