//! HTTP client for the option price API.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use tradelog_core::{
    ContractKey, PriceSeries, PriceSource, PriceSourceConfig, Result, TradelogError,
};

/// User agent for HTTP requests.
const USER_AGENT: &str = concat!("tradelog/", env!("CARGO_PKG_VERSION"));

const SOURCE_NAME: &str = "0dtespx";

/// [`PriceSource`] backed by the `optionPrice` endpoint.
///
/// Requests look like
/// `{base_url}/optionPrice?asset=SPX&date=2025-02-14&interval=1&symbol=-P6110`.
/// A non-success status or a body that is not a JSON array is reported as
/// "no data" rather than as an error.
#[derive(Debug, Clone)]
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
    interval: u32,
}

impl HttpPriceSource {
    /// Creates a source with its own client using the configured timeout.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: &PriceSourceConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TradelogError::price_source(SOURCE_NAME, e))?;
        Ok(Self::with_client(client, config))
    }

    /// Creates a source that sends requests through `client`.
    #[must_use]
    pub fn with_client(client: reqwest::Client, config: &PriceSourceConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            interval: config.interval,
        }
    }

    /// Builds the request URL for `contract`.
    #[must_use]
    pub fn request_url(&self, contract: &ContractKey) -> String {
        format!(
            "{}/optionPrice?asset={}&date={}&interval={}&symbol={}",
            self.base_url,
            contract.asset,
            contract.date_str(),
            self.interval,
            contract.api_symbol()
        )
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    #[instrument(skip(self), fields(contract = %contract))]
    async fn fetch_option_prices(&self, contract: &ContractKey) -> Result<Option<PriceSeries>> {
        let url = self.request_url(contract);
        debug!(url = %url, "Fetching option prices");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TradelogError::price_source(SOURCE_NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, url = %url, "Price API returned an error status");
            return Ok(None);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TradelogError::price_source(SOURCE_NAME, e))?;
        match body {
            Value::Array(points) => {
                debug!(points = points.len(), "Fetched option prices");
                Ok(Some(points))
            }
            other => {
                warn!(kind = json_kind(&other), url = %url, "Price API returned a non-array body");
                Ok(None)
            }
        }
    }

    fn link(&self, contract: &ContractKey) -> Option<String> {
        Some(self.request_url(contract))
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tradelog_core::OptionType;

    #[test]
    fn test_request_url() {
        let config = PriceSourceConfig {
            base_url: "https://api.example.test/".to_string(),
            ..PriceSourceConfig::default()
        };
        let source = HttpPriceSource::new(&config).unwrap();
        let contract = ContractKey::new(
            "SPX",
            NaiveDate::from_ymd_opt(2025, 2, 14).unwrap(),
            OptionType::Put,
            6110,
        );

        assert_eq!(
            source.request_url(&contract),
            "https://api.example.test/optionPrice?asset=SPX&date=2025-02-14&interval=1&symbol=-P6110"
        );
        assert_eq!(source.link(&contract), Some(source.request_url(&contract)));
        assert_eq!(source.name(), "0dtespx");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PriceSourceConfig {
            base_url: "  ".to_string(),
            ..PriceSourceConfig::default()
        };
        assert!(matches!(
            HttpPriceSource::new(&config),
            Err(TradelogError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_json_kind() {
        assert_eq!(json_kind(&serde_json::json!({"error": "x"})), "object");
        assert_eq!(json_kind(&Value::Null), "null");
    }
}
