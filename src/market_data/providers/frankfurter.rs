//! Frankfurter FX rates (ECB daily reference rates, EUR base, no key).

use std::collections::HashMap;

use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;

use super::{parse, send};
use crate::market_data::fx::FxRateSource;
use crate::market_data::Result;

const FRANKFURTER_BASE_URL: &str = "https://api.frankfurter.app";
const NAME: &str = "frankfurter";

#[derive(Debug, Deserialize)]
struct FrankfurterResponse {
    #[allow(dead_code)]
    base: String,
    #[allow(dead_code)]
    date: NaiveDate,
    rates: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct FrankfurterRateSource {
    client: Client,
    base_url: String,
}

impl Default for FrankfurterRateSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrankfurterRateSource {
    pub const NAME: &'static str = NAME;

    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: FRANKFURTER_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait::async_trait]
impl FxRateSource for FrankfurterRateSource {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_eur_rates(&self, currencies: &[String]) -> Result<HashMap<String, f64>> {
        let wanted: Vec<&str> = currencies
            .iter()
            .map(String::as_str)
            .filter(|c| *c != "EUR")
            .collect();
        let mut rates = HashMap::new();
        if currencies.iter().any(|c| c == "EUR") {
            rates.insert("EUR".to_string(), 1.0);
        }
        if wanted.is_empty() {
            return Ok(rates);
        }

        let request = self
            .client
            .get(format!("{}/latest", self.base_url))
            .query(&[("from", "EUR"), ("to", wanted.join(",").as_str())]);
        let body = send(NAME, request).await?;
        let response: FrankfurterResponse = parse(NAME, &body)?;
        rates.extend(response.rates);
        Ok(rates)
    }
}
