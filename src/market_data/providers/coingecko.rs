//! CoinGecko crypto quotes.
//!
//! `/simple/price` takes many ids per request, which makes CoinGecko the
//! batching primary. It is also the short-window history provider: the free
//! `/coins/{id}/market_chart` endpoint returns daily points for recent windows.

use std::collections::HashMap;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use super::{parse, send};
use crate::market_data::provider::{QuoteProvider, RawDate, RawHistory, RawQuote};
use crate::market_data::symbols::CoinListing;
use crate::market_data::{MarketDataError, Result};

const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";
const NAME: &str = "coingecko";

#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

/// In-band error body returned with a 200 on some plans.
#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    status: ErrorStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorStatus {
    error_code: Option<u16>,
    error_message: Option<String>,
}

pub struct CoinGeckoProvider {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl Default for CoinGeckoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinGeckoProvider {
    pub const NAME: &'static str = NAME;

    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: COINGECKO_API_BASE.to_string(),
            api_key: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Demo-plan key, sent as `x-cg-demo-api-key`.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let mut request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .query(query)
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-demo-api-key", key.expose_secret());
        }
        let body = send(NAME, request).await?;
        check_in_band_error(&body)?;
        Ok(body)
    }
}

fn check_in_band_error(body: &str) -> Result<()> {
    let Ok(envelope) = serde_json::from_str::<StatusEnvelope>(body) else {
        return Ok(());
    };
    match envelope.status.error_code {
        Some(429) => Err(MarketDataError::RateLimited {
            provider: NAME.to_string(),
        }),
        Some(code) => Err(MarketDataError::call_failed(
            NAME,
            format!(
                "API error {code}: {}",
                envelope.status.error_message.unwrap_or_default()
            ),
        )),
        None => Ok(()),
    }
}

/// Reads `{"bitcoin": {"eur": 1.0, "eur_market_cap": 2.0}}`.
fn parse_simple_price(body: &str, currency: &str) -> Result<HashMap<String, RawQuote>> {
    let data: HashMap<String, HashMap<String, Value>> = parse(NAME, body)?;
    let currency = currency.to_lowercase();
    let cap_key = format!("{currency}_market_cap");

    Ok(data
        .into_iter()
        .filter_map(|(id, fields)| {
            let price = fields.get(&currency)?.as_f64()?;
            Some((
                id,
                RawQuote {
                    price,
                    currency: Some(currency.to_uppercase()),
                    market_cap: fields.get(&cap_key).and_then(Value::as_f64),
                    minor_units: false,
                },
            ))
        })
        .collect())
}

#[async_trait::async_trait]
impl QuoteProvider for CoinGeckoProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_quote(&self, symbol: &str, currency: &str) -> Result<RawQuote> {
        let mut quotes = self.fetch_quotes(&[symbol.to_string()], currency).await?;
        quotes
            .remove(symbol)
            .ok_or_else(|| MarketDataError::call_failed(NAME, format!("no price for {symbol}")))
    }

    async fn fetch_quotes(
        &self,
        symbols: &[String],
        currency: &str,
    ) -> Result<HashMap<String, RawQuote>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let body = self
            .get(
                "/simple/price",
                &[
                    ("ids", symbols.join(",")),
                    ("vs_currencies", currency.to_lowercase()),
                    ("include_market_cap", "true".to_string()),
                ],
            )
            .await?;
        parse_simple_price(&body, currency)
    }

    async fn fetch_history(&self, symbol: &str, currency: &str, days: u32) -> Result<RawHistory> {
        let body = self
            .get(
                &format!("/coins/{symbol}/market_chart"),
                &[
                    ("vs_currency", currency.to_lowercase()),
                    ("days", days.to_string()),
                    ("interval", "daily".to_string()),
                ],
            )
            .await?;
        let chart: MarketChartResponse = parse(NAME, &body)?;
        Ok(RawHistory {
            points: chart
                .prices
                .into_iter()
                .map(|(ts, price)| (RawDate::UnixMillis(ts as i64), price))
                .collect(),
            currency: Some(currency.to_uppercase()),
        })
    }

    async fn fetch_symbol_list(&self) -> Result<Vec<CoinListing>> {
        let body = self.get("/coins/list", &[]).await?;
        parse(NAME, &body)
    }
}
