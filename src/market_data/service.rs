use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

use super::batch::{BatchAggregator, BatchFetch, DEFAULT_WINDOW};
use super::cache::{history_key, perf_key, price_key, CacheLayer};
use super::fx::FxResolver;
use super::governor::{ProviderStatus, RateGovernor};
use super::history::{clamp_days, fill_calendar, flat_series, has_enough_coverage, horizon_change};
use super::normalize::{normalize_currency, normalize_history, normalize_quote, rescale_minor_units};
use super::provider::{history_chain, ProviderDescriptor, RawQuote};
use super::symbols::{infer_stock_currency, translate, SymbolTable};
use super::{
    AssetDiagnostics, AssetKind, AssetRef, BatchQuoteResult, HistorySeries, Horizon,
    MarketDataError, PerformanceMetrics, PerformanceOptions, PriceQuote, QuoteSource, Result,
};

/// Provider name recorded on degraded series that no provider produced.
const NO_PROVIDER: &str = "none";

/// Freshness thresholds and lifetimes used by the orchestrator.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub reporting_currency: String,
    /// Quote currency for the crypto "reference currency" fallback step.
    pub reference_currency: String,
    pub price_freshness: Duration,
    pub price_ttl: Duration,
    pub history_freshness: Duration,
    pub history_ttl: Duration,
    pub performance_ttl: Duration,
    pub batch_window: Duration,
    /// Longest window the short-window history provider is asked for.
    pub short_window_days: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            reporting_currency: "EUR".to_string(),
            reference_currency: "USD".to_string(),
            price_freshness: Duration::from_secs(5 * 60),
            price_ttl: Duration::from_secs(60 * 60),
            history_freshness: Duration::from_secs(6 * 60 * 60),
            history_ttl: Duration::from_secs(24 * 60 * 60),
            performance_ttl: Duration::from_secs(60 * 60),
            batch_window: DEFAULT_WINDOW,
            short_window_days: 30,
        }
    }
}

/// A live price before FX conversion.
#[derive(Debug, Clone)]
struct NativeQuote {
    price: f64,
    currency: String,
    market_cap: Option<f64>,
    provider: String,
    fetched_at: DateTime<Utc>,
}

/// The fetch orchestrator: cache tiers, ordered provider walks, batching and
/// FX conversion for prices, histories and performance figures.
pub struct MarketDataService {
    settings: ServiceSettings,
    providers: Vec<ProviderDescriptor>,
    governor: Arc<RateGovernor>,
    cache: CacheLayer,
    fx: Arc<FxResolver>,
    symbols: Arc<SymbolTable>,
    batch: Option<BatchAggregator<RawQuote>>,
    clock: Arc<dyn Clock>,
}

impl MarketDataService {
    pub fn new(
        settings: ServiceSettings,
        governor: Arc<RateGovernor>,
        cache: CacheLayer,
        fx: Arc<FxResolver>,
    ) -> Self {
        let mut settings = settings;
        settings.reporting_currency = settings.reporting_currency.trim().to_uppercase();
        settings.reference_currency = settings.reference_currency.trim().to_uppercase();
        Self {
            settings,
            providers: Vec::new(),
            governor,
            cache,
            fx,
            symbols: Arc::new(SymbolTable::builtin()),
            batch: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Appends a provider to the priority order. The first batch-capable
    /// crypto provider also backs the batch aggregator.
    pub fn with_provider(mut self, descriptor: ProviderDescriptor) -> Self {
        if self.batch.is_none()
            && descriptor.batch_capable
            && descriptor.supports(AssetKind::Crypto)
        {
            self.batch = Some(self.make_batch(&descriptor));
        }
        self.providers.push(descriptor);
        self
    }

    pub fn with_symbols(mut self, symbols: Arc<SymbolTable>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn providers(&self) -> &[ProviderDescriptor] {
        &self.providers
    }

    fn make_batch(&self, descriptor: &ProviderDescriptor) -> BatchAggregator<RawQuote> {
        let governor = self.governor.clone();
        let provider = descriptor.provider.clone();
        let currency = self.settings.reporting_currency.to_lowercase();
        let fetch: BatchFetch<RawQuote> = Arc::new(move |ids: Vec<String>| {
            let governor = governor.clone();
            let provider = provider.clone();
            let currency = currency.clone();
            async move {
                governor
                    .run_governed(provider.name(), || provider.fetch_quotes(&ids, &currency))
                    .await
            }
            .boxed()
        });
        BatchAggregator::new(descriptor.name(), self.settings.batch_window, fetch)
    }

    // ---- helpers -------------------------------------------------------

    fn validate(asset: &AssetRef) -> Result<()> {
        if asset.id.trim().is_empty() {
            return Err(MarketDataError::InvalidInput("asset id is empty".to_string()));
        }
        Ok(())
    }

    fn crypto_id(&self, asset: &AssetRef) -> String {
        match asset.kind {
            AssetKind::Crypto => self.symbols.resolve_crypto_id(asset),
            AssetKind::Stock => String::new(),
        }
    }

    /// Identity used for cache keys; aliases of one coin share entries.
    fn cache_identity(&self, asset: &AssetRef) -> AssetRef {
        match asset.kind {
            AssetKind::Crypto => AssetRef::crypto(self.crypto_id(asset)),
            AssetKind::Stock => AssetRef::stock(&asset.id),
        }
    }

    fn age(&self, fetched_at: DateTime<Utc>) -> Duration {
        (self.clock.now() - fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn price_providers(&self, kind: AssetKind) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.iter().filter(move |p| p.supports(kind))
    }

    /// Quote currency to request from a provider for `kind`.
    fn request_currency(&self, kind: AssetKind) -> &str {
        match kind {
            AssetKind::Crypto => &self.settings.reporting_currency,
            AssetKind::Stock => "",
        }
    }

    // ---- price ---------------------------------------------------------

    /// Current price of one asset.
    ///
    /// Serves a fresh cache entry without any provider call. Otherwise walks
    /// the providers in priority order and returns the first positive price,
    /// converted into the reporting currency. With every provider failing,
    /// any cached value is returned regardless of age; only an empty cache
    /// yields `NoDataAvailable`.
    pub async fn fetch_price(&self, asset: &AssetRef) -> Result<PriceQuote> {
        Self::validate(asset)?;
        let key = price_key(&self.cache_identity(asset));

        if let Some(cached) = self.cache.read::<PriceQuote>(&key).await {
            let age = self.age(cached.fetched_at);
            if age < self.settings.price_freshness {
                debug!(asset = %asset, age_secs = age.as_secs(), "price served from cache");
                return Ok(PriceQuote {
                    source: QuoteSource::Cache,
                    ..cached
                });
            }
        }

        let mut diag = AssetDiagnostics::new(asset.clone());
        if let Some(native) = self.live_native(asset, &mut diag).await {
            let rates = self.fx.get_rates(std::slice::from_ref(&native.currency)).await;
            let quote = self.to_quote(native, &rates);
            self.cache
                .write_with_last_good(&key, &quote, self.settings.price_ttl)
                .await;
            info!(
                asset = %asset,
                provider = %quote.provider,
                price = quote.price,
                currency = %quote.currency,
                "price fetched and cached"
            );
            return Ok(quote);
        }

        self.cached_price_fallback(asset, &key)
            .await
            .ok_or_else(|| MarketDataError::no_data(asset))
    }

    /// Any-age TTL entry first, then the last-good snapshot.
    async fn cached_price_fallback(&self, asset: &AssetRef, key: &str) -> Option<PriceQuote> {
        if let Some(cached) = self.cache.read::<PriceQuote>(key).await {
            warn!(
                asset = %asset,
                age_secs = self.age(cached.fetched_at).as_secs(),
                "providers exhausted, serving cached price"
            );
            return Some(PriceQuote {
                source: QuoteSource::Cache,
                ..cached
            });
        }
        if let Some(stale) = self.cache.read_last_good::<PriceQuote>(key).await {
            warn!(
                asset = %asset,
                age_secs = self.age(stale.fetched_at).as_secs(),
                "providers exhausted, serving last good price"
            );
            return Some(PriceQuote {
                source: QuoteSource::CacheStale,
                ..stale
            });
        }
        None
    }

    /// Walks the price providers for `asset.kind`, recording each attempt.
    async fn live_native(
        &self,
        asset: &AssetRef,
        diag: &mut AssetDiagnostics,
    ) -> Option<NativeQuote> {
        let crypto_id = self.crypto_id(asset);
        let quote_currency = self.request_currency(asset.kind).to_string();

        for descriptor in self.price_providers(asset.kind) {
            let name = descriptor.name();
            if !self.governor.accepts_calls(name).await {
                debug!(provider = name, asset = %asset, "provider unavailable, skipping");
                diag.record(name, "native", Err("unavailable".to_string()));
                continue;
            }
            let Some(symbol) = translate(
                asset,
                &crypto_id,
                descriptor.symbol_style,
                &self.symbols,
                &quote_currency,
            ) else {
                continue;
            };

            let provider = &descriptor.provider;
            let raw = match self
                .governor
                .run_governed(name, || provider.fetch_quote(&symbol, &quote_currency))
                .await
            {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(provider = name, asset = %asset, error = %e, "price fetch failed");
                    diag.record(name, "native", Err(e.to_string()));
                    continue;
                }
            };
            if !raw.price.is_finite() || raw.price <= 0.0 {
                debug!(
                    provider = name,
                    asset = %asset,
                    price = raw.price,
                    "ignoring non-positive price"
                );
                diag.record(name, "native", Err(format!("non-positive price {}", raw.price)));
                continue;
            }

            diag.record(name, "native", Ok(()));
            return Some(self.finish_native(asset, descriptor, &symbol, raw).await);
        }
        None
    }

    /// Resolves a missing currency and rescales pence-quoted equities.
    async fn finish_native(
        &self,
        asset: &AssetRef,
        descriptor: &ProviderDescriptor,
        symbol: &str,
        raw: RawQuote,
    ) -> NativeQuote {
        let normalized = normalize_quote(&raw);
        let (currency, minor) = match normalized.currency {
            Some(currency) => (currency, normalized.minor_units),
            None => {
                let (currency, minor) = self.resolve_currency(asset, descriptor, symbol).await;
                (currency, minor || normalized.minor_units)
            }
        };

        let price = match asset.kind {
            AssetKind::Stock => rescale_minor_units(normalized.price, &currency, minor),
            AssetKind::Crypto => normalized.price,
        };

        NativeQuote {
            price,
            currency,
            market_cap: normalized.market_cap,
            provider: descriptor.name().to_string(),
            fetched_at: self.clock.now(),
        }
    }

    /// Currency for a quote that arrived without one: ask the winning
    /// provider, then any other provider of the same kind, then the suffix
    /// table, then default to the reporting currency.
    async fn resolve_currency(
        &self,
        asset: &AssetRef,
        winner: &ProviderDescriptor,
        symbol: &str,
    ) -> (String, bool) {
        if asset.kind == AssetKind::Crypto {
            return (self.settings.reporting_currency.clone(), false);
        }

        let candidates = std::iter::once(winner)
            .chain(self.price_providers(asset.kind).filter(|p| p.name() != winner.name()));
        for descriptor in candidates {
            let name = descriptor.name();
            let symbol = if descriptor.name() == winner.name() {
                symbol.to_string()
            } else {
                let Some(symbol) =
                    translate(asset, "", descriptor.symbol_style, &self.symbols, "")
                else {
                    continue;
                };
                symbol
            };
            let provider = &descriptor.provider;
            match self
                .governor
                .run_governed(name, || provider.fetch_currency(&symbol))
                .await
            {
                Ok(Some(label)) => {
                    if let Some(found) = normalize_currency(&label) {
                        debug!(
                            provider = name,
                            asset = %asset,
                            currency = %found.0,
                            "currency resolved by provider"
                        );
                        return found;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(provider = name, asset = %asset, error = %e, "currency lookup failed")
                }
            }
        }

        match infer_stock_currency(&asset.id) {
            Some((currency, minor)) => (currency.to_string(), minor),
            None => {
                debug!(asset = %asset, "currency unknown, assuming reporting currency");
                (self.settings.reporting_currency.clone(), false)
            }
        }
    }

    /// Converts with the given reporting-currency rates. Without a rate the
    /// native price is reported as is, labelled in its own currency.
    fn to_quote(&self, native: NativeQuote, rates: &HashMap<String, f64>) -> PriceQuote {
        let reporting = &self.settings.reporting_currency;
        let (value, reporting_currency) = match rates.get(&native.currency) {
            Some(rate) if *rate > 0.0 => (native.price / rate, reporting.clone()),
            _ if native.currency == *reporting => (native.price, reporting.clone()),
            _ => {
                warn!(
                    currency = %native.currency,
                    provider = %native.provider,
                    "no fx rate, reporting native price"
                );
                (native.price, native.currency.clone())
            }
        };
        PriceQuote {
            price: native.price,
            currency: native.currency,
            value,
            reporting_currency,
            market_cap: native.market_cap,
            source: QuoteSource::Live,
            provider: native.provider,
            fetched_at: native.fetched_at,
        }
    }

    // ---- history -------------------------------------------------------

    /// Daily series of exactly `days` points (clamped to 1..=365) ending today.
    ///
    /// Never fails for a valid asset: when providers and both cache tiers are
    /// exhausted the series is flat at the last known price, or zero.
    pub async fn fetch_history(&self, asset: &AssetRef, days: u32) -> Result<HistorySeries> {
        Self::validate(asset)?;
        let days = clamp_days(days);
        let identity = self.cache_identity(asset);
        let key = history_key(&identity, days);

        if let Some(cached) = self.cache.read::<HistorySeries>(&key).await {
            let age = self.age(cached.fetched_at);
            if age < self.settings.history_freshness {
                debug!(asset = %asset, days, age_secs = age.as_secs(), "history served from cache");
                return Ok(self.refit(cached, QuoteSource::Cache));
            }
        }

        if let Some(series) = self.live_history(asset, days).await {
            self.cache
                .write_with_last_good(&key, &series, self.settings.history_ttl)
                .await;
            info!(asset = %asset, days, provider = %series.provider, "history fetched and cached");
            return Ok(series);
        }

        if let Some(cached) = self.cache.read::<HistorySeries>(&key).await {
            warn!(asset = %asset, days, "providers exhausted, serving cached history");
            return Ok(self.refit(cached, QuoteSource::Cache));
        }
        if let Some(stale) = self.cache.read_last_good::<HistorySeries>(&key).await {
            warn!(asset = %asset, days, "providers exhausted, serving last good history");
            return Ok(self.refit(stale, QuoteSource::CacheStale));
        }

        let last_good_price = self
            .cache
            .read_last_good::<PriceQuote>(&price_key(&identity))
            .await;
        let (price, currency) = match last_good_price {
            Some(quote) => (quote.value, quote.reporting_currency),
            None => (0.0, self.settings.reporting_currency.clone()),
        };
        warn!(asset = %asset, days, price, "no history available, returning flat series");
        Ok(HistorySeries {
            asset: identity,
            days,
            currency,
            source: QuoteSource::Calculated,
            provider: NO_PROVIDER.to_string(),
            fetched_at: self.clock.now(),
            history: flat_series(price, self.clock.today(), days),
        })
    }

    /// Re-expresses a cached series over the window ending today.
    fn refit(&self, mut series: HistorySeries, source: QuoteSource) -> HistorySeries {
        if let Some(filled) = fill_calendar(&series.history, self.clock.today(), series.days) {
            series.history = filled;
        }
        series.source = source;
        series
    }

    async fn live_history(&self, asset: &AssetRef, days: u32) -> Option<HistorySeries> {
        let crypto_id = self.crypto_id(asset);
        let quote_currency = self.request_currency(asset.kind).to_string();
        let today = self.clock.today();

        let chain = history_chain(
            &self.providers,
            asset.kind,
            days,
            self.settings.short_window_days,
        );
        for descriptor in chain {
            let name = descriptor.name();
            if !self.governor.accepts_calls(name).await {
                debug!(provider = name, asset = %asset, "provider unavailable, skipping");
                continue;
            }
            let Some(symbol) = translate(
                asset,
                &crypto_id,
                descriptor.symbol_style,
                &self.symbols,
                &quote_currency,
            ) else {
                continue;
            };

            let provider = &descriptor.provider;
            let raw = match self
                .governor
                .run_governed(name, || provider.fetch_history(&symbol, &quote_currency, days))
                .await
            {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(provider = name, asset = %asset, error = %e, "history fetch failed");
                    continue;
                }
            };

            let mut points = normalize_history(&raw);
            if points.is_empty() || !has_enough_coverage(&points, today, days) {
                debug!(
                    provider = name,
                    asset = %asset,
                    points = points.len(),
                    days,
                    "history too sparse, discarding"
                );
                continue;
            }

            let (currency, minor) = match raw.currency.as_deref().and_then(normalize_currency) {
                Some(found) => found,
                None => match asset.kind {
                    AssetKind::Crypto => (self.settings.reporting_currency.clone(), false),
                    AssetKind::Stock => infer_stock_currency(&asset.id)
                        .map(|(c, m)| (c.to_string(), m))
                        .unwrap_or_else(|| (self.settings.reporting_currency.clone(), false)),
                },
            };

            if asset.kind == AssetKind::Stock {
                let latest = points.last().map(|p| p.price).unwrap_or_default();
                if rescale_minor_units(latest, &currency, minor) != latest {
                    for point in &mut points {
                        point.price /= 100.0;
                    }
                }
            }

            let mut series_currency = currency.clone();
            if currency != self.settings.reporting_currency {
                let rates = self.fx.get_rates(std::slice::from_ref(&currency)).await;
                match rates.get(&currency).filter(|r| **r > 0.0) {
                    Some(rate) => {
                        for point in &mut points {
                            point.price /= rate;
                        }
                        series_currency = self.settings.reporting_currency.clone();
                    }
                    None => warn!(
                        asset = %asset,
                        currency = %currency,
                        "no fx rate, keeping native history"
                    ),
                }
            }

            let Some(history) = fill_calendar(&points, today, days) else {
                continue;
            };
            return Some(HistorySeries {
                asset: self.cache_identity(asset),
                days,
                currency: series_currency,
                source: QuoteSource::Live,
                provider: name.to_string(),
                fetched_at: self.clock.now(),
                history,
            });
        }
        None
    }

    // ---- performance ---------------------------------------------------

    /// Fractional change over 1d, 7d, 30d and 1y, computed from the
    /// endpoints of four history windows.
    pub async fn fetch_performance_metrics(
        &self,
        asset: &AssetRef,
        options: PerformanceOptions,
    ) -> Result<PerformanceMetrics> {
        Self::validate(asset)?;
        let identity = self.cache_identity(asset);
        let key = perf_key(&identity);

        if !options.no_cache {
            if let Some(cached) = self.cache.read::<PerformanceMetrics>(&key).await {
                debug!(asset = %asset, "performance served from cache");
                return Ok(PerformanceMetrics {
                    source: QuoteSource::Cache,
                    ..cached
                });
            }
        }

        let histories = join_all(
            Horizon::ALL
                .iter()
                .map(|horizon| self.fetch_history(asset, horizon.window_days())),
        )
        .await;

        let mut degraded = false;
        let changes = Horizon::ALL
            .iter()
            .zip(histories)
            .map(|(horizon, series)| {
                let change = match series {
                    Ok(series) if series.source != QuoteSource::Calculated => {
                        horizon_change(&series.history, *horizon)
                    }
                    _ => {
                        degraded = true;
                        None
                    }
                };
                (*horizon, change)
            })
            .collect();

        let metrics = PerformanceMetrics {
            asset: identity,
            changes,
            source: QuoteSource::Calculated,
            fetched_at: self.clock.now(),
        };

        if metrics.changes.values().all(Option::is_none) {
            if let Some(stale) = self.cache.read_last_good::<PerformanceMetrics>(&key).await {
                warn!(asset = %asset, "no history for performance, serving last good figures");
                return Ok(PerformanceMetrics {
                    source: QuoteSource::CacheStale,
                    ..stale
                });
            }
            return Ok(metrics);
        }

        if degraded {
            self.cache
                .write(&key, &metrics, Some(self.settings.performance_ttl))
                .await;
        } else {
            self.cache
                .write_with_last_good(&key, &metrics, self.settings.performance_ttl)
                .await;
        }
        Ok(metrics)
    }

    // ---- multi-asset ---------------------------------------------------

    /// Current quotes for many assets at once.
    ///
    /// Stocks walk their providers concurrently and are converted in one FX
    /// pass. Cryptos not fresh in cache are merged into one batched request
    /// against the primary crypto provider; leftovers fall back per asset
    /// through the remaining crypto providers (reporting currency, then the
    /// reference currency converted via FX) and finally the stale cache tiers.
    /// Assets that nothing could price are absent from the maps; their
    /// diagnostics say why.
    pub async fn get_current_quotes(&self, assets: &[AssetRef]) -> Result<BatchQuoteResult> {
        for asset in assets {
            Self::validate(asset)?;
        }
        let (stocks, cryptos): (Vec<&AssetRef>, Vec<&AssetRef>) =
            assets.iter().partition(|a| a.kind == AssetKind::Stock);

        let mut result = BatchQuoteResult::default();
        let (stock_quotes, stock_meta) = self.stock_quotes(&stocks).await;
        result.stocks = stock_quotes;
        result.meta.extend(stock_meta);

        let (crypto_quotes, crypto_meta) = self.crypto_quotes(&cryptos).await;
        result.cryptos = crypto_quotes;
        result.meta.extend(crypto_meta);

        Ok(result)
    }

    async fn stock_quotes(
        &self,
        stocks: &[&AssetRef],
    ) -> (HashMap<String, PriceQuote>, Vec<AssetDiagnostics>) {
        let mut quotes = HashMap::new();
        let mut pending = Vec::new();
        let mut meta = Vec::new();

        for asset in stocks {
            let mut diag = AssetDiagnostics::new((*asset).clone());
            let key = price_key(&self.cache_identity(asset));
            match self.cache.read::<PriceQuote>(&key).await {
                Some(cached) if self.age(cached.fetched_at) < self.settings.price_freshness => {
                    diag.record("cache", "fresh", Ok(()));
                    quotes.insert(
                        asset.id.clone(),
                        PriceQuote {
                            source: QuoteSource::Cache,
                            ..cached
                        },
                    );
                    meta.push(diag);
                }
                _ => pending.push((*asset, key, diag)),
            }
        }

        let walks = join_all(pending.into_iter().map(|(asset, key, mut diag)| async move {
            let native = self.live_native(asset, &mut diag).await;
            (asset, key, diag, native)
        }))
        .await;

        let mut currencies: Vec<String> = walks
            .iter()
            .filter_map(|(_, _, _, native)| native.as_ref().map(|n| n.currency.clone()))
            .collect();
        currencies.sort();
        currencies.dedup();
        let rates = self.fx.get_rates(&currencies).await;

        for (asset, key, mut diag, native) in walks {
            match native {
                Some(native) => {
                    let quote = self.to_quote(native, &rates);
                    self.cache
                        .write_with_last_good(&key, &quote, self.settings.price_ttl)
                        .await;
                    quotes.insert(asset.id.clone(), quote);
                }
                None => match self.cached_price_fallback(asset, &key).await {
                    Some(quote) => {
                        diag.record("cache", "stale", Ok(()));
                        quotes.insert(asset.id.clone(), quote);
                    }
                    None => diag.record("cache", "stale", Err("no cached value".to_string())),
                },
            }
            meta.push(diag);
        }

        (quotes, meta)
    }

    async fn crypto_quotes(
        &self,
        cryptos: &[&AssetRef],
    ) -> (HashMap<String, PriceQuote>, Vec<AssetDiagnostics>) {
        let mut quotes = HashMap::new();
        let mut meta = Vec::new();
        let mut unresolved = Vec::new();

        for asset in cryptos {
            let mut diag = AssetDiagnostics::new((*asset).clone());
            let crypto_id = self.crypto_id(asset);
            let key = price_key(&AssetRef::crypto(&crypto_id));
            match self.cache.read::<PriceQuote>(&key).await {
                Some(cached) if self.age(cached.fetched_at) < self.settings.price_freshness => {
                    diag.record("cache", "fresh", Ok(()));
                    quotes.insert(
                        asset.id.clone(),
                        PriceQuote {
                            source: QuoteSource::Cache,
                            ..cached
                        },
                    );
                    meta.push(diag);
                }
                _ => unresolved.push((*asset, crypto_id, key, diag)),
            }
        }

        let batch_provider = self.batch.as_ref().map(|b| b.name().to_string());
        if let Some(batch) = &self.batch {
            let mut ids: Vec<String> = unresolved.iter().map(|(_, id, _, _)| id.clone()).collect();
            ids.sort();
            ids.dedup();
            if !ids.is_empty() {
                match batch.request_ids(&ids).await {
                    Ok(found) => {
                        let mut still = Vec::new();
                        for (asset, crypto_id, key, mut diag) in unresolved {
                            let priced = found
                                .get(&crypto_id)
                                .filter(|raw| raw.price.is_finite() && raw.price > 0.0);
                            match priced {
                                Some(raw) => {
                                    diag.record(batch.name(), "batch", Ok(()));
                                    let quote = self.crypto_quote_from_raw(raw, batch.name()).await;
                                    self.cache
                                        .write_with_last_good(&key, &quote, self.settings.price_ttl)
                                        .await;
                                    quotes.insert(asset.id.clone(), quote);
                                    meta.push(diag);
                                }
                                None => {
                                    let missing = Err("missing from response".to_string());
                                    diag.record(batch.name(), "batch", missing);
                                    still.push((asset, crypto_id, key, diag));
                                }
                            }
                        }
                        unresolved = still;
                    }
                    Err(e) => {
                        for (_, _, _, diag) in &mut unresolved {
                            diag.record(batch.name(), "batch", Err(e.to_string()));
                        }
                    }
                }
            }
        }

        for (asset, crypto_id, key, mut diag) in unresolved {
            let quote = match self
                .crypto_fallback_chain(asset, &crypto_id, batch_provider.as_deref(), &mut diag)
                .await
            {
                Some(quote) => {
                    self.cache
                        .write_with_last_good(&key, &quote, self.settings.price_ttl)
                        .await;
                    Some(quote)
                }
                None => {
                    let cached = self.cached_price_fallback(asset, &key).await;
                    match &cached {
                        Some(_) => diag.record("cache", "stale", Ok(())),
                        None => diag.record("cache", "stale", Err("no cached value".to_string())),
                    }
                    cached
                }
            };
            if let Some(quote) = quote {
                quotes.insert(asset.id.clone(), quote);
            }
            meta.push(diag);
        }

        (quotes, meta)
    }

    async fn crypto_quote_from_raw(&self, raw: &RawQuote, provider: &str) -> PriceQuote {
        let normalized = normalize_quote(raw);
        let native = NativeQuote {
            price: normalized.price,
            currency: normalized
                .currency
                .unwrap_or_else(|| self.settings.reporting_currency.clone()),
            market_cap: normalized.market_cap,
            provider: provider.to_string(),
            fetched_at: self.clock.now(),
        };
        let rates = self.fx.get_rates(std::slice::from_ref(&native.currency)).await;
        self.to_quote(native, &rates)
    }

    /// Per-asset fallback after the batch: each remaining crypto provider in
    /// the reporting currency, then in the reference currency via FX.
    async fn crypto_fallback_chain(
        &self,
        asset: &AssetRef,
        crypto_id: &str,
        skip: Option<&str>,
        diag: &mut AssetDiagnostics,
    ) -> Option<PriceQuote> {
        let reporting = self.settings.reporting_currency.clone();
        let reference = self.settings.reference_currency.clone();

        for descriptor in self
            .price_providers(AssetKind::Crypto)
            .filter(|p| Some(p.name()) != skip)
        {
            let name = descriptor.name();
            if !self.governor.accepts_calls(name).await {
                diag.record(name, "native", Err("unavailable".to_string()));
                continue;
            }

            let mut steps = vec![("native", reporting.clone())];
            if reference != reporting {
                steps.push(("reference", reference.clone()));
            }
            for (step, currency) in steps {
                let Some(symbol) =
                    translate(asset, crypto_id, descriptor.symbol_style, &self.symbols, &currency)
                else {
                    break;
                };
                let provider = &descriptor.provider;
                let raw = self
                    .governor
                    .run_governed(name, || provider.fetch_quote(&symbol, &currency))
                    .await;
                match raw {
                    Ok(raw) if raw.price.is_finite() && raw.price > 0.0 => {
                        let quote = self.crypto_quote_from_raw(&raw, name).await;
                        if quote.reporting_currency != reporting {
                            let reason = format!("no fx rate for {}", quote.currency);
                            diag.record(name, step, Err(reason));
                            continue;
                        }
                        diag.record(name, step, Ok(()));
                        return Some(quote);
                    }
                    Ok(raw) => {
                        diag.record(name, step, Err(format!("non-positive price {}", raw.price)))
                    }
                    Err(e) => diag.record(name, step, Err(e.to_string())),
                }
            }
        }
        None
    }

    // ---- misc ----------------------------------------------------------

    /// Units of each currency per 1 reporting-currency unit.
    pub async fn get_fx_rates(&self, currencies: &[String]) -> HashMap<String, f64> {
        self.fx.get_rates(currencies).await
    }

    /// Governor snapshot for every registered provider, sorted by name.
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let mut names: Vec<&str> = self.governor.providers().collect();
        names.sort_unstable();
        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(status) = self.governor.status(name).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Drops the TTL cache entries of one asset; last-good snapshots stay.
    pub async fn invalidate(&self, asset: &AssetRef) -> anyhow::Result<usize> {
        self.cache.invalidate(&self.cache_identity(asset)).await
    }
}
