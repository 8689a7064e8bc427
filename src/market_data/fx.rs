//! Currency conversion into the reporting currency.
//!
//! Rates are fetched and cached EUR-based (`fx:rates` holds units of each
//! currency per 1 EUR) and turned into reporting-currency rates by crossing
//! through EUR. One TTL covers the whole cached set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

use super::cache::{CacheLayer, FX_META_KEY, FX_RATES_KEY};
use super::governor::RateGovernor;
use super::normalize::normalize_currency;
use super::Result;

#[async_trait::async_trait]
pub trait FxRateSource: Send + Sync {
    fn name(&self) -> &str;

    /// Units of each requested currency per 1 EUR. Unknown currencies are
    /// left out of the map.
    async fn fetch_eur_rates(&self, currencies: &[String]) -> Result<HashMap<String, f64>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxMeta {
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
}

pub const DEFAULT_FX_TTL: Duration = Duration::from_secs(12 * 60 * 60);

pub struct FxResolver {
    source: Option<Arc<dyn FxRateSource>>,
    governor: Arc<RateGovernor>,
    cache: CacheLayer,
    reporting_currency: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl FxResolver {
    pub fn new(
        reporting_currency: &str,
        source: Option<Arc<dyn FxRateSource>>,
        governor: Arc<RateGovernor>,
        cache: CacheLayer,
    ) -> Self {
        Self {
            source,
            governor,
            cache,
            reporting_currency: reporting_currency.trim().to_uppercase(),
            ttl: DEFAULT_FX_TTL,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn reporting_currency(&self) -> &str {
        &self.reporting_currency
    }

    /// Units of each currency per 1 reporting-currency unit.
    ///
    /// Cached currencies are served without a network call; only missing ones
    /// are fetched, merged into the cached set and re-cached. If the fetch
    /// fails the cached subset is returned, so the map may be partial.
    pub async fn get_rates(&self, currencies: &[String]) -> HashMap<String, f64> {
        let requested: BTreeSet<String> = currencies
            .iter()
            .filter_map(|c| normalize_currency(c).map(|(code, _)| code))
            .collect();

        let mut result = HashMap::new();
        if requested.contains(&self.reporting_currency) {
            result.insert(self.reporting_currency.clone(), 1.0);
        }
        let foreign: Vec<&String> = requested
            .iter()
            .filter(|c| **c != self.reporting_currency)
            .collect();
        if foreign.is_empty() {
            return result;
        }

        let mut eur_rates: HashMap<String, f64> =
            self.cache.read(FX_RATES_KEY).await.unwrap_or_default();
        eur_rates.insert("EUR".to_string(), 1.0);

        let missing: Vec<String> = foreign
            .iter()
            .map(|c| c.to_string())
            .chain(std::iter::once(self.reporting_currency.clone()))
            .filter(|c| !eur_rates.contains_key(c))
            .collect();

        if !missing.is_empty() {
            debug!(missing = ?missing, "fx rates not cached, fetching");
            match self.fetch(&missing).await {
                Ok(fetched) => {
                    eur_rates.extend(fetched);
                    self.store(&eur_rates).await;
                }
                Err(e) => warn!(error = %e, "fx fetch failed, using cached rates"),
            }
        }

        let Some(reporting_per_eur) = eur_rates.get(&self.reporting_currency).copied() else {
            warn!(currency = %self.reporting_currency, "no EUR rate for reporting currency");
            return result;
        };
        for currency in foreign {
            if let Some(per_eur) = eur_rates.get(currency) {
                result.insert(currency.clone(), per_eur / reporting_per_eur);
            }
        }
        result
    }

    /// Converts `amount` in `currency` into the reporting currency.
    pub async fn convert(&self, amount: f64, currency: &str) -> Option<f64> {
        let rates = self.get_rates(&[currency.to_string()]).await;
        rates
            .get(&currency.trim().to_uppercase())
            .filter(|rate| **rate > 0.0)
            .map(|rate| amount / rate)
    }

    async fn fetch(&self, currencies: &[String]) -> Result<HashMap<String, f64>> {
        let Some(source) = &self.source else {
            return Ok(HashMap::new());
        };
        let rates = self
            .governor
            .run_governed(source.name(), || source.fetch_eur_rates(currencies))
            .await?;
        info!(provider = source.name(), count = rates.len(), "fx rates fetched");
        Ok(rates)
    }

    async fn store(&self, eur_rates: &HashMap<String, f64>) {
        let Some(source) = &self.source else {
            return;
        };
        self.cache.write(FX_RATES_KEY, eur_rates, Some(self.ttl)).await;
        let meta = FxMeta {
            provider: source.name().to_string(),
            fetched_at: self.clock.now(),
        };
        self.cache.write(FX_META_KEY, &meta, Some(self.ttl)).await;
    }
}
