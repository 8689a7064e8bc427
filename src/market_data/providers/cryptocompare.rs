//! CryptoCompare crypto quotes, keyed by ticker (`BTC`).
//! Docs: https://min-api.cryptocompare.com/

use std::collections::HashMap;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{mentions_rate_limit, parse, send};
use crate::market_data::provider::{QuoteProvider, RawDate, RawHistory, RawQuote};
use crate::market_data::{MarketDataError, Result};

const CRYPTOCOMPARE_API_BASE: &str = "https://min-api.cryptocompare.com";
const NAME: &str = "cryptocompare";

/// Error envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Response")]
    response: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceMultiFull {
    #[serde(rename = "RAW", default)]
    raw: HashMap<String, HashMap<String, RawTicker>>,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    #[serde(rename = "PRICE")]
    price: Option<f64>,
    #[serde(rename = "MKTCAP")]
    market_cap: Option<f64>,
    #[serde(rename = "TOSYMBOL")]
    to_symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(rename = "Data")]
    data: Option<HistoryContainer>,
}

#[derive(Debug, Deserialize)]
struct HistoryContainer {
    #[serde(rename = "Data", default)]
    data: Vec<HistoryBar>,
}

#[derive(Debug, Deserialize)]
struct HistoryBar {
    time: i64,
    close: Option<f64>,
}

pub struct CryptoCompareProvider {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl Default for CryptoCompareProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoCompareProvider {
    pub const NAME: &'static str = NAME;

    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: CRYPTOCOMPARE_API_BASE.to_string(),
            api_key: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

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
            request = request.header("authorization", format!("Apikey {}", key.expose_secret()));
        }
        let body = send(NAME, request).await?;
        check_envelope(&body)?;
        Ok(body)
    }
}

fn check_envelope(body: &str) -> Result<()> {
    let Ok(envelope) = serde_json::from_str::<Envelope>(body) else {
        return Ok(());
    };
    if !envelope
        .response
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case("error"))
    {
        return Ok(());
    }
    let message = envelope.message.unwrap_or_else(|| "unknown error".to_string());
    if mentions_rate_limit(&message) {
        return Err(MarketDataError::RateLimited {
            provider: NAME.to_string(),
        });
    }
    Err(MarketDataError::call_failed(NAME, format!("API error: {message}")))
}

fn parse_price_multi(body: &str, currency: &str) -> Result<HashMap<String, RawQuote>> {
    let data: PriceMultiFull = parse(NAME, body)?;
    let currency = currency.to_uppercase();
    Ok(data
        .raw
        .into_iter()
        .filter_map(|(symbol, mut by_currency)| {
            let ticker = by_currency.remove(&currency)?;
            Some((
                symbol,
                RawQuote {
                    price: ticker.price?,
                    currency: ticker.to_symbol.or_else(|| Some(currency.clone())),
                    market_cap: ticker.market_cap,
                    minor_units: false,
                },
            ))
        })
        .collect())
}

#[async_trait::async_trait]
impl QuoteProvider for CryptoCompareProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_quote(&self, symbol: &str, currency: &str) -> Result<RawQuote> {
        let mut quotes = self.fetch_quotes(&[symbol.to_string()], currency).await?;
        quotes
            .remove(&symbol.to_uppercase())
            .ok_or_else(|| MarketDataError::call_failed(NAME, format!("no price for {symbol}")))
    }

    async fn fetch_quotes(
        &self,
        symbols: &[String],
        currency: &str,
    ) -> Result<HashMap<String, RawQuote>> {
        let fsyms: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        let body = self
            .get(
                "/data/pricemultifull",
                &[("fsyms", fsyms.join(",")), ("tsyms", currency.to_uppercase())],
            )
            .await?;
        parse_price_multi(&body, currency)
    }

    async fn fetch_history(&self, symbol: &str, currency: &str, days: u32) -> Result<RawHistory> {
        let body = self
            .get(
                "/data/v2/histoday",
                &[
                    ("fsym", symbol.to_uppercase()),
                    ("tsym", currency.to_uppercase()),
                    ("limit", days.saturating_sub(1).max(1).to_string()),
                ],
            )
            .await?;
        let history: HistoryResponse = parse(NAME, &body)?;
        let bars = history.data.map(|d| d.data).unwrap_or_default();
        Ok(RawHistory {
            points: bars
                .into_iter()
                .filter_map(|bar| Some((RawDate::UnixSeconds(bar.time), bar.close?)))
                .collect(),
            currency: Some(currency.to_uppercase()),
        })
    }
}
