//! Alpha Vantage stock quotes, with its own exchange suffixes (`VOD.LON`).
//!
//! The free tier allows 25 requests per day and `compact` series hold only the
//! last 100 trading days, so this provider sits last in every chain.

use std::collections::HashMap;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{mentions_rate_limit, parse, send};
use crate::market_data::provider::{QuoteProvider, RawDate, RawHistory, RawQuote};
use crate::market_data::{MarketDataError, Result};

const BASE_URL: &str = "https://www.alphavantage.co";
const NAME: &str = "alpha_vantage";

/// In-band messages. `Note` and `Information` usually mean the quota is spent.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote", default)]
    quote: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesResponse {
    #[serde(rename = "Time Series (Daily)")]
    time_series: HashMap<String, DailyBar>,
}

#[derive(Debug, Deserialize)]
struct DailyBar {
    #[serde(rename = "4. close")]
    close: String,
}

#[derive(Debug, Deserialize)]
struct SymbolSearchResponse {
    #[serde(rename = "bestMatches", default)]
    best_matches: Vec<HashMap<String, String>>,
}

pub struct AlphaVantageProvider {
    api_key: SecretString,
    client: Client,
    base_url: String,
}

impl AlphaVantageProvider {
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

    async fn query(&self, params: &[(&str, &str)]) -> Result<String> {
        let request = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(params)
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
    if let Some(message) = error.error_message {
        return Err(MarketDataError::call_failed(NAME, format!("API error: {message}")));
    }
    if let Some(message) = error.note.or(error.information) {
        if mentions_rate_limit(&message) {
            return Err(MarketDataError::RateLimited {
                provider: NAME.to_string(),
            });
        }
        return Err(MarketDataError::call_failed(NAME, message));
    }
    Ok(())
}

fn parse_number(raw: &str) -> Result<f64> {
    raw.trim()
        .parse()
        .map_err(|_| MarketDataError::call_failed(NAME, format!("invalid number {raw:?}")))
}

#[async_trait::async_trait]
impl QuoteProvider for AlphaVantageProvider {
    fn name(&self) -> &str {
        NAME
    }

    /// GLOBAL_QUOTE carries no currency; the orchestrator resolves it through
    /// [`fetch_currency`](QuoteProvider::fetch_currency) or the suffix table.
    async fn fetch_quote(&self, symbol: &str, _currency: &str) -> Result<RawQuote> {
        let body = self
            .query(&[("function", "GLOBAL_QUOTE"), ("symbol", symbol)])
            .await?;
        let response: GlobalQuoteResponse = parse(NAME, &body)?;
        let price = response
            .quote
            .get("05. price")
            .ok_or_else(|| MarketDataError::call_failed(NAME, format!("no quote for {symbol}")))?;
        Ok(RawQuote {
            price: parse_number(price)?,
            ..RawQuote::default()
        })
    }

    async fn fetch_history(&self, symbol: &str, _currency: &str, _days: u32) -> Result<RawHistory> {
        let body = self
            .query(&[
                ("function", "TIME_SERIES_DAILY"),
                ("symbol", symbol),
                ("outputsize", "compact"),
            ])
            .await?;
        let response: TimeSeriesResponse = parse(NAME, &body)?;
        let mut points = Vec::with_capacity(response.time_series.len());
        for (date, bar) in response.time_series {
            points.push((RawDate::Text(date), parse_number(&bar.close)?));
        }
        Ok(RawHistory {
            points,
            currency: None,
        })
    }

    async fn fetch_currency(&self, symbol: &str) -> Result<Option<String>> {
        let body = self
            .query(&[("function", "SYMBOL_SEARCH"), ("keywords", symbol)])
            .await?;
        let response: SymbolSearchResponse = parse(NAME, &body)?;
        Ok(response
            .best_matches
            .into_iter()
            .find(|m| {
                m.get("1. symbol")
                    .is_some_and(|s| s.eq_ignore_ascii_case(symbol))
            })
            .and_then(|mut m| m.remove("8. currency")))
    }
}
