use thiserror::Error;

/// Errors raised by providers, the rate governor and the orchestrator.
///
/// `ProviderUnavailable`, `RateLimited` and `ProviderCallFailed` are consumed
/// inside the fallback walk and only mean "try the next source". Callers only
/// ever see `NoDataAvailable` (every provider and cache tier exhausted) or
/// `InvalidInput`. Degraded-but-successful answers are not errors; they are
/// tagged through [`QuoteSource`](super::QuoteSource).
///
/// The enum is `Clone` so one upstream failure can be handed to every caller
/// waiting on the same batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketDataError {
    /// The governor refused the call: banned, daily quota spent, or unknown provider.
    #[error("provider {provider} is unavailable")]
    ProviderUnavailable { provider: String },

    /// The provider answered with HTTP 429 or an in-band rate-limit message.
    #[error("provider {provider} rate limited the request")]
    RateLimited { provider: String },

    /// Network, HTTP status or parse failure.
    #[error("provider {provider} call failed: {message}")]
    ProviderCallFailed { provider: String, message: String },

    #[error("no data available for {subject}")]
    NoDataAvailable { subject: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl MarketDataError {
    pub fn call_failed(provider: &str, message: impl std::fmt::Display) -> Self {
        Self::ProviderCallFailed {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub fn no_data(subject: impl std::fmt::Display) -> Self {
        Self::NoDataAvailable {
            subject: subject.to_string(),
        }
    }

    /// Maps a transport error, treating HTTP 429 as a rate limit.
    pub fn from_http(provider: &str, err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            Self::RateLimited {
                provider: provider.to_string(),
            }
        } else {
            Self::call_failed(provider, err)
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
