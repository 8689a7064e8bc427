use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheBackend, ProviderConfig, ResolvedConfig};

use super::cache::{CacheLayer, CacheStore, MemoryCacheStore};
use super::file_cache::JsonFileCacheStore;
use super::fx::{FxRateSource, FxResolver};
use super::governor::{ProviderLimits, RateGovernor};
use super::provider::{HistoryRole, ProviderDescriptor, QuoteProvider};
use super::providers::{
    AlphaVantageProvider, CoinGeckoProvider, CryptoCompareProvider, FrankfurterRateSource,
    TwelveDataProvider,
};
use super::symbols::{SymbolStyle, SymbolTable};
use super::{AssetKind, MarketDataService};

pub const CACHE_FILE: &str = "cache.jsonl";
pub const SYMBOLS_FILE: &str = "symbols.json";

/// Built-in pacing per provider, matching each service's free tier.
pub fn default_limits(provider: &str) -> ProviderLimits {
    match provider {
        "coingecko" => ProviderLimits::cooldown(Duration::from_millis(1500)).with_per_minute(30),
        "cryptocompare" => ProviderLimits::cooldown(Duration::from_secs(1)),
        "twelve_data" => ProviderLimits::cooldown(Duration::from_secs(8))
            .with_per_minute(8)
            .with_daily(800),
        "alpha_vantage" => ProviderLimits::cooldown(Duration::from_secs(12))
            .with_per_minute(5)
            .with_daily(25),
        "frankfurter" => ProviderLimits::cooldown(Duration::from_secs(1)),
        _ => ProviderLimits::default(),
    }
}

fn limits_for(provider: &str, overrides: Option<&ProviderConfig>) -> ProviderLimits {
    let mut limits = default_limits(provider);
    if let Some(config) = overrides {
        if let Some(cooldown) = config.cooldown {
            limits.cooldown = cooldown;
        }
        if config.per_minute_limit.is_some() {
            limits.per_minute_limit = config.per_minute_limit;
        }
        if config.daily_limit.is_some() {
            limits.daily_limit = config.daily_limit;
        }
    }
    limits
}

fn copy_key(key: &SecretString) -> SecretString {
    SecretString::from(key.expose_secret().to_string())
}

/// Builds a [`MarketDataService`] from resolved configuration.
///
/// Provider priority is fixed: CoinGecko, CryptoCompare, Twelve Data, Alpha
/// Vantage. Providers that need an API key are skipped when none is set.
pub struct MarketDataServiceBuilder<'a> {
    config: &'a ResolvedConfig,
    cache_store: Option<Arc<dyn CacheStore>>,
    fetch_symbols: bool,
    clock: Arc<dyn Clock>,
}

impl<'a> MarketDataServiceBuilder<'a> {
    pub fn new(config: &'a ResolvedConfig) -> Self {
        Self {
            config,
            cache_store: None,
            fetch_symbols: true,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a caller-provided cache backend instead of the configured one.
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Skip the network fetch of the coin listing; the cached file or the
    /// built-in table is used instead.
    pub fn offline_symbols(mut self) -> Self {
        self.fetch_symbols = false;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn enabled(&self, name: &str) -> bool {
        self.config
            .provider(name)
            .and_then(|p| p.enabled)
            .unwrap_or(true)
    }

    fn base_url(&self, name: &str) -> Option<String> {
        self.config.provider(name).and_then(|p| p.base_url.clone())
    }

    fn api_key(&self, name: &str) -> Option<SecretString> {
        self.config
            .provider(name)
            .and_then(|p| p.api_key.as_ref())
            .map(copy_key)
    }

    fn cache_store(&self) -> Arc<dyn CacheStore> {
        if let Some(store) = &self.cache_store {
            return store.clone();
        }
        match self.config.cache.backend {
            CacheBackend::File => {
                let path = self.config.data_dir.join(CACHE_FILE);
                Arc::new(JsonFileCacheStore::new(path).with_clock(self.clock.clone()))
            }
            CacheBackend::Memory => Arc::new(MemoryCacheStore::with_clock(self.clock.clone())),
        }
    }

    fn quote_providers(&self, client: &Client) -> Vec<ProviderDescriptor> {
        let mut descriptors = Vec::new();

        if self.enabled(CoinGeckoProvider::NAME) {
            let mut provider = CoinGeckoProvider::with_client(client.clone());
            if let Some(url) = self.base_url(CoinGeckoProvider::NAME) {
                provider = provider.with_base_url(url);
            }
            if let Some(key) = self.api_key(CoinGeckoProvider::NAME) {
                provider = provider.with_api_key(key);
            }
            descriptors.push(
                ProviderDescriptor::new(
                    Arc::new(provider),
                    &[AssetKind::Crypto],
                    SymbolStyle::CanonicalId,
                )
                .with_history_role(HistoryRole::ShortWindow)
                    .batch_capable(),
            );
        }

        if self.enabled(CryptoCompareProvider::NAME) {
            let mut provider = CryptoCompareProvider::with_client(client.clone());
            if let Some(url) = self.base_url(CryptoCompareProvider::NAME) {
                provider = provider.with_base_url(url);
            }
            if let Some(key) = self.api_key(CryptoCompareProvider::NAME) {
                provider = provider.with_api_key(key);
            }
            descriptors.push(ProviderDescriptor::new(
                Arc::new(provider),
                &[AssetKind::Crypto],
                SymbolStyle::Ticker,
            ));
        }

        if self.enabled(TwelveDataProvider::NAME) {
            match self.api_key(TwelveDataProvider::NAME) {
                Some(key) => {
                    let mut provider = TwelveDataProvider::with_client(key, client.clone());
                    if let Some(url) = self.base_url(TwelveDataProvider::NAME) {
                        provider = provider.with_base_url(url);
                    }
                    descriptors.push(ProviderDescriptor::new(
                        Arc::new(provider),
                        &[AssetKind::Crypto, AssetKind::Stock],
                        SymbolStyle::Pair,
                    ));
                }
                None => warn!(
                    provider = TwelveDataProvider::NAME,
                    "no api key configured, provider disabled"
                ),
            }
        }

        if self.enabled(AlphaVantageProvider::NAME) {
            match self.api_key(AlphaVantageProvider::NAME) {
                Some(key) => {
                    let mut provider = AlphaVantageProvider::with_client(key, client.clone());
                    if let Some(url) = self.base_url(AlphaVantageProvider::NAME) {
                        provider = provider.with_base_url(url);
                    }
                    descriptors.push(
                        ProviderDescriptor::new(
                            Arc::new(provider),
                            &[AssetKind::Stock],
                            SymbolStyle::DotSuffix,
                        )
                        .with_history_role(HistoryRole::Narrow),
                    );
                }
                None => warn!(
                    provider = AlphaVantageProvider::NAME,
                    "no api key configured, provider disabled"
                ),
            }
        }

        descriptors
    }

    fn fx_source(&self, client: &Client) -> Option<Arc<dyn FxRateSource>> {
        if !self.enabled(FrankfurterRateSource::NAME) {
            return None;
        }
        let mut source = FrankfurterRateSource::with_client(client.clone());
        if let Some(url) = self.base_url(FrankfurterRateSource::NAME) {
            source = source.with_base_url(url);
        }
        Some(Arc::new(source))
    }

    pub async fn build(self) -> Result<MarketDataService> {
        let client = Client::builder()
            .timeout(self.config.http_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let descriptors = self.quote_providers(&client);
        let fx_source = self.fx_source(&client);

        let mut governor = RateGovernor::new();
        for descriptor in &descriptors {
            let name = descriptor.name();
            governor = governor.register(name, limits_for(name, self.config.provider(name)));
        }
        if let Some(source) = &fx_source {
            let name = source.name();
            governor = governor.register(name, limits_for(name, self.config.provider(name)));
        }
        let governor = Arc::new(governor);

        let cache = CacheLayer::new(self.cache_store());
        let fx = FxResolver::new(
            &self.config.reporting_currency,
            fx_source,
            governor.clone(),
            cache.clone(),
        )
        .with_ttl(self.config.cache.fx_ttl)
        .with_clock(self.clock.clone());

        let symbols = self.symbol_table(&descriptors, &governor).await;

        info!(
            providers = ?descriptors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            reporting_currency = %self.config.reporting_currency,
            data_dir = %self.config.data_dir.display(),
            "market data service ready"
        );

        let mut service =
            MarketDataService::new(self.config.service_settings(), governor, cache, Arc::new(fx))
                .with_symbols(Arc::new(symbols))
                .with_clock(self.clock.clone());
        for descriptor in descriptors {
            service = service.with_provider(descriptor);
        }
        Ok(service)
    }

    async fn symbol_table(
        &self,
        descriptors: &[ProviderDescriptor],
        governor: &RateGovernor,
    ) -> SymbolTable {
        let path = self.config.data_dir.join(SYMBOLS_FILE);
        let listing_source: Option<Arc<dyn QuoteProvider>> = descriptors
            .iter()
            .find(|d| d.supports(AssetKind::Crypto) && d.symbol_style == SymbolStyle::CanonicalId)
            .map(|d| d.provider.clone());

        match listing_source.filter(|_| self.fetch_symbols) {
            Some(provider) => {
                SymbolTable::load_or_fetch(&path, || async move {
                    governor
                        .run_governed(provider.name(), || provider.fetch_symbol_list())
                        .await
                })
                .await
            }
            None => {
                SymbolTable::load_or_fetch(&path, || async {
                    Err(super::MarketDataError::no_data("symbol listing"))
                })
                .await
            }
        }
    }
}
