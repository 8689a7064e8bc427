pub mod alpha_vantage;
pub mod coingecko;
pub mod cryptocompare;
pub mod frankfurter;
pub mod twelve_data;

pub use alpha_vantage::AlphaVantageProvider;
pub use coingecko::CoinGeckoProvider;
pub use cryptocompare::CryptoCompareProvider;
pub use frankfurter::FrankfurterRateSource;
pub use twelve_data::TwelveDataProvider;

use serde::de::DeserializeOwned;

use super::{MarketDataError, Result};

/// Sends `request` and returns the body of a successful response.
///
/// HTTP 429 becomes `RateLimited`; any other failure status or transport
/// error becomes `ProviderCallFailed` carrying the status and body.
pub(crate) async fn send(provider: &str, request: reqwest::RequestBuilder) -> Result<String> {
    let response = request
        .send()
        .await
        .map_err(|e| MarketDataError::from_http(provider, e))?;

    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(MarketDataError::RateLimited {
            provider: provider.to_string(),
        });
    }
    let body = response
        .text()
        .await
        .map_err(|e| MarketDataError::from_http(provider, e))?;
    if !status.is_success() {
        return Err(MarketDataError::call_failed(
            provider,
            format!("API error: {status} - {body}"),
        ));
    }
    Ok(body)
}

pub(crate) fn parse<T: DeserializeOwned>(provider: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| {
        MarketDataError::call_failed(provider, format!("failed to parse response: {e}"))
    })
}

/// Whether an in-band error message is a quota complaint.
pub(crate) fn mentions_rate_limit(message: &str) -> bool {
    let message = message.to_lowercase();
    ["rate limit", "too many requests", "api credits", "call frequency", "requests per day"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_quota_messages() {
        assert!(mentions_rate_limit(
            "You have run out of API credits for the current minute."
        ));
        assert!(mentions_rate_limit(
            "Thank you for using Alpha Vantage! Our standard API rate limit is 25 requests per day."
        ));
        assert!(mentions_rate_limit("Rate limit excedeed!"));
        assert!(!mentions_rate_limit("Invalid API call."));
    }
}
