//! Twelve Data quotes for stocks (`AAPL`, `VOD:LSE`) and crypto pairs (`BTC/EUR`).
//!
//! Numbers arrive as strings. Errors arrive as a 200 with `"status": "error"`,
//! and quota exhaustion as `code: 429` inside that envelope.

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{mentions_rate_limit, parse, send};
use crate::market_data::provider::{QuoteProvider, RawDate, RawHistory, RawQuote};
use crate::market_data::{MarketDataError, Result};

const BASE_URL: &str = "https://api.twelvedata.com";
const NAME: &str = "twelve_data";

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    status: String,
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    close: String,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesResponse {
    meta: TimeSeriesMeta,
    #[serde(default)]
    values: Vec<TimeSeriesValue>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesMeta {
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesValue {
    datetime: String,
    close: String,
}

pub struct TwelveDataProvider {
    api_key: SecretString,
    client: Client,
    base_url: String,
}

impl TwelveDataProvider {
    pub const NAME: &'static str = NAME;

    pub fn new(api_key: SecretString) -> Self {
        Self::with_client(api_key, Client::new())
    }

    pub fn with_client(api_key: SecretString, client: Client) -> Self {
        Self {
            api_key,
            client,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .query(query)
            .query(&[("apikey", self.api_key.expose_secret())]);
        let body = send(NAME, request).await?;
        check_error(&body)?;
        Ok(body)
    }
}

fn check_error(body: &str) -> Result<()> {
    let Ok(error) = serde_json::from_str::<ErrorResponse>(body) else {
        return Ok(());
    };
    if error.status != "error" {
        return Ok(());
    }
    if error.code == Some(429) || mentions_rate_limit(&error.message) {
        return Err(MarketDataError::RateLimited {
            provider: NAME.to_string(),
        });
    }
    Err(MarketDataError::call_failed(
        NAME,
        format!("API error: {}", error.message),
    ))
}

/// Crypto pairs carry no `currency` field; the quote side of the pair is it.
fn pair_quote(symbol: &str) -> Option<String> {
    symbol.split_once('/').map(|(_, quote)| quote.to_string())
}

fn parse_price(provider: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse()
        .map_err(|_| MarketDataError::call_failed(provider, format!("invalid price {raw:?}")))
}

#[async_trait::async_trait]
impl QuoteProvider for TwelveDataProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_quote(&self, symbol: &str, _currency: &str) -> Result<RawQuote> {
        let body = self.get("/quote", &[("symbol", symbol.to_string())]).await?;
        let quote: QuoteResponse = parse(NAME, &body)?;
        Ok(RawQuote {
            price: parse_price(NAME, &quote.close)?,
            currency: quote.currency.or_else(|| pair_quote(symbol)),
            market_cap: None,
            minor_units: false,
        })
    }

    async fn fetch_history(&self, symbol: &str, _currency: &str, days: u32) -> Result<RawHistory> {
        let body = self
            .get(
                "/time_series",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", "1day".to_string()),
                    ("outputsize", days.to_string()),
                ],
            )
            .await?;
        let series: TimeSeriesResponse = parse(NAME, &body)?;
        let mut points = Vec::with_capacity(series.values.len());
        for value in series.values {
            points.push((RawDate::Text(value.datetime), parse_price(NAME, &value.close)?));
        }
        Ok(RawHistory {
            points,
            currency: series.meta.currency.or_else(|| pair_quote(symbol)),
        })
    }
}
