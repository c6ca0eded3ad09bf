//! Domain types shared by the caches and the lookup flow.
//!
//! - [`OptionType`] - Call or put
//! - [`ContractKey`] - Lookup tuple for raw option price series
//! - [`TradeKey`] - Lookup tuple for computed per-trade results
//! - [`TradeResult`] - End-of-day and peak values derived for one trade
//! - [`PriceSeries`] - Raw price series as returned by the remote API

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TradelogError;

/// Date format used for all lookup tuples and API requests.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Raw option price series, kept as the JSON objects the API returned.
pub type PriceSeries = Vec<serde_json::Value>;

/// Option side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    /// Call option, encoded as `C`.
    #[serde(rename = "C")]
    Call,
    /// Put option, encoded as `P`.
    #[serde(rename = "P")]
    Put,
}

impl OptionType {
    /// Returns the single-letter code used in cache keys and API symbols.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Call => "C",
            Self::Put => "P",
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for OptionType {
    type Err = TradelogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Ok(Self::Call),
            "P" | "PUT" => Ok(Self::Put),
            other => Err(TradelogError::Other(format!("Invalid option type: {other}"))),
        }
    }
}

/// Lookup tuple for a raw option price series.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractKey {
    /// Underlying asset, e.g. `SPX`.
    pub asset: String,
    /// Trading day.
    pub date: NaiveDate,
    /// Call or put.
    pub option_type: OptionType,
    /// Strike price.
    pub strike: u32,
}

impl ContractKey {
    /// Creates a new contract key.
    #[must_use]
    pub fn new(
        asset: impl Into<String>,
        date: NaiveDate,
        option_type: OptionType,
        strike: u32,
    ) -> Self {
        Self {
            asset: asset.into(),
            date,
            option_type,
            strike,
        }
    }

    /// Returns the trading day formatted as `YYYY-MM-DD`.
    #[must_use]
    pub fn date_str(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    /// Returns the option symbol the API expects, e.g. `-P6110`.
    #[must_use]
    pub fn api_symbol(&self) -> String {
        format!("-{}{}", self.option_type, self.strike)
    }

    /// Returns the canonical `asset_date_type_strike` string the cache key is derived from.
    #[must_use]
    pub fn key_material(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.asset,
            self.date_str(),
            self.option_type,
            self.strike
        )
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            self.asset,
            self.date_str(),
            self.option_type,
            self.strike
        )
    }
}

/// Lookup tuple for a computed trade result.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeKey {
    /// Identifier of the trade within the trade log.
    pub trade_id: String,
    /// Day the trade was opened.
    pub trade_date: NaiveDate,
    /// Call or put.
    pub option_type: OptionType,
    /// Strike price.
    pub strike: u32,
}

impl TradeKey {
    /// Creates a new trade key.
    #[must_use]
    pub fn new(
        trade_id: impl Into<String>,
        trade_date: NaiveDate,
        option_type: OptionType,
        strike: u32,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            trade_date,
            option_type,
            strike,
        }
    }

    /// Returns the trade date formatted as `YYYY-MM-DD`.
    #[must_use]
    pub fn date_str(&self) -> String {
        self.trade_date.format(DATE_FORMAT).to_string()
    }

    /// Returns the canonical `trade_date_type_strike` string the cache key is derived from.
    #[must_use]
    pub fn key_material(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.trade_id,
            self.date_str(),
            self.option_type,
            self.strike
        )
    }

    /// Returns the contract this trade was placed on.
    #[must_use]
    pub fn contract(&self, asset: impl Into<String>) -> ContractKey {
        ContractKey::new(asset, self.trade_date, self.option_type, self.strike)
    }
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}{})",
            self.trade_id,
            self.date_str(),
            self.option_type,
            self.strike
        )
    }
}

/// Values derived from a price series for one trade.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    /// Option price at the end of the trading session.
    pub end_of_day_price: Option<f64>,
    /// Most favourable price after the trade was opened.
    pub peak_price: Option<f64>,
    /// Time of the peak, formatted `HH:MM:SS`.
    pub peak_time: Option<String>,
    /// Link to the raw API data the result was derived from.
    pub api_link: Option<String>,
}

impl TradeResult {
    /// Returns true if nothing could be derived.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end_of_day_price.is_none() && self.peak_price.is_none()
    }
}
