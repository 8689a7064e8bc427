#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use tokio::time::Instant;
use quotebook::clock::ManualClock;
use quotebook::market_data::{
    CacheLayer, FxRateSource, FxResolver, MarketDataError, MarketDataService, MemoryCacheStore,
    ProviderDescriptor, ProviderLimits, QuoteProvider, RateGovernor, RawDate, RawHistory, RawQuote,
    Result, ServiceSettings,
};

pub type Outcome<T> = std::result::Result<T, MarketDataError>;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A quote provider driven by per-symbol scripts.
///
/// Quotes are looked up as `SYMBOL@CUR` first, then `SYMBOL`. Unscripted
/// symbols fail with `ProviderCallFailed`. Every call is logged.
pub struct ScriptedProvider {
    name: &'static str,
    quotes: Mutex<HashMap<String, Outcome<RawQuote>>>,
    histories: Mutex<HashMap<String, Outcome<RawHistory>>>,
    currencies: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedProvider {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            quotes: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            currencies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            call_times: Mutex::new(Vec::new()),
        })
    }

    pub fn set_price(&self, symbol: &str, price: f64, currency: Option<&str>) {
        self.set_quote(
            symbol,
            Ok(RawQuote {
                price,
                currency: currency.map(str::to_string),
                ..RawQuote::default()
            }),
        );
    }

    pub fn set_quote(&self, symbol: &str, outcome: Outcome<RawQuote>) {
        lock(&self.quotes).insert(symbol.to_string(), outcome);
    }

    pub fn fail_quote(&self, symbol: &str) {
        self.set_quote(symbol, Err(MarketDataError::call_failed(self.name, "scripted failure")));
    }

    pub fn rate_limit_quote(&self, symbol: &str) {
        self.set_quote(
            symbol,
            Err(MarketDataError::RateLimited {
                provider: self.name.to_string(),
            }),
        );
    }

    pub fn set_history(&self, symbol: &str, outcome: Outcome<RawHistory>) {
        lock(&self.histories).insert(symbol.to_string(), outcome);
    }

    pub fn set_currency(&self, symbol: &str, currency: &str) {
        lock(&self.currencies).insert(symbol.to_string(), currency.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Tokio instants at which each call reached the provider, in call order.
    pub fn call_times(&self) -> Vec<Instant> {
        lock(&self.call_times).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
        lock(&self.call_times).push(Instant::now());
    }

    fn lookup_quote(&self, symbol: &str, currency: &str) -> Outcome<RawQuote> {
        let quotes = lock(&self.quotes);
        quotes
            .get(&format!("{symbol}@{}", currency.to_uppercase()))
            .or_else(|| quotes.get(symbol))
            .cloned()
            .unwrap_or_else(|| {
                Err(MarketDataError::call_failed(self.name, format!("no script for {symbol}")))
            })
    }
}

#[async_trait]
impl QuoteProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch_quote(&self, symbol: &str, currency: &str) -> Result<RawQuote> {
        self.record(format!("quote:{symbol}:{}", currency.to_uppercase()));
        self.lookup_quote(symbol, currency)
    }

    async fn fetch_quotes(
        &self,
        symbols: &[String],
        currency: &str,
    ) -> Result<HashMap<String, RawQuote>> {
        let mut sorted = symbols.to_vec();
        sorted.sort();
        self.record(format!("quotes:{}", sorted.join(",")));
        Ok(symbols
            .iter()
            .filter_map(|s| self.lookup_quote(s, currency).ok().map(|q| (s.clone(), q)))
            .collect())
    }

    async fn fetch_history(&self, symbol: &str, _currency: &str, days: u32) -> Result<RawHistory> {
        self.record(format!("history:{symbol}:{days}"));
        lock(&self.histories)
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| {
                Err(MarketDataError::call_failed(self.name, format!("no history for {symbol}")))
            })
    }

    async fn fetch_currency(&self, symbol: &str) -> Result<Option<String>> {
        self.record(format!("currency:{symbol}"));
        Ok(lock(&self.currencies).get(symbol).cloned())
    }
}

/// EUR-based rates from a fixed table.
pub struct ScriptedRates {
    rates: HashMap<String, f64>,
    failing: Mutex<bool>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRates {
    pub fn new(rates: &[(&str, f64)]) -> Arc<Self> {
        Arc::new(Self {
            rates: rates.iter().map(|(c, r)| (c.to_string(), *r)).collect(),
            failing: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl FxRateSource for ScriptedRates {
    fn name(&self) -> &str {
        "scripted_fx"
    }

    async fn fetch_eur_rates(&self, currencies: &[String]) -> Result<HashMap<String, f64>> {
        let mut sorted = currencies.to_vec();
        sorted.sort();
        lock(&self.calls).push(sorted);
        if *lock(&self.failing) {
            return Err(MarketDataError::call_failed("scripted_fx", "down"));
        }
        Ok(currencies
            .iter()
            .filter_map(|c| self.rates.get(c).map(|r| (c.clone(), *r)))
            .collect())
    }
}

pub struct Harness {
    pub service: MarketDataService,
    pub clock: Arc<ManualClock>,
    pub cache: CacheLayer,
}

/// Wires a service over an in-memory cache and a manual clock. Providers are
/// registered with the governor without pacing.
pub fn harness(
    settings: ServiceSettings,
    providers: Vec<ProviderDescriptor>,
    fx: Option<Arc<ScriptedRates>>,
) -> Harness {
    paced_harness(settings, providers, fx, |_| ProviderLimits::default())
}

/// Like [`harness`], with each provider registered under `limits(name)`.
pub fn paced_harness(
    settings: ServiceSettings,
    providers: Vec<ProviderDescriptor>,
    fx: Option<Arc<ScriptedRates>>,
    limits: impl Fn(&str) -> ProviderLimits,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));

    let mut governor = RateGovernor::new();
    for descriptor in &providers {
        governor = governor.register(descriptor.name(), limits(descriptor.name()));
    }
    if fx.is_some() {
        governor = governor.register("scripted_fx", limits("scripted_fx"));
    }
    let governor = Arc::new(governor);

    let cache = CacheLayer::new(Arc::new(MemoryCacheStore::with_clock(clock.clone())));
    let fx_source = fx.map(|f| f as Arc<dyn FxRateSource>);
    let fx = FxResolver::new(
        &settings.reporting_currency,
        fx_source,
        governor.clone(),
        cache.clone(),
    )
    .with_clock(clock.clone());

    let mut service = MarketDataService::new(settings, governor, cache.clone(), Arc::new(fx))
        .with_clock(clock.clone());
    for descriptor in providers {
        service = service.with_provider(descriptor);
    }
    Harness { service, clock, cache }
}

pub fn settings(reporting: &str) -> ServiceSettings {
    ServiceSettings {
        reporting_currency: reporting.to_string(),
        ..ServiceSettings::default()
    }
}

/// Daily points `(date, price)` as text dates.
pub fn daily_history(points: &[(NaiveDate, f64)], currency: Option<&str>) -> RawHistory {
    RawHistory {
        points: points
            .iter()
            .map(|(date, price)| (RawDate::Text(date.format("%Y-%m-%d").to_string()), *price))
            .collect(),
        currency: currency.map(str::to_string),
    }
}

/// Consecutive days ending on `end` with the given prices, oldest first.
pub fn ending_on(end: NaiveDate, prices: &[f64]) -> Vec<(NaiveDate, f64)> {
    let len = prices.len() as i64;
    prices
        .iter()
        .enumerate()
        .map(|(i, price)| (end - Duration::days(len - 1 - i as i64), *price))
        .collect()
}
