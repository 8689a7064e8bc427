//! Market data aggregation: rate-governed providers, a two-tier cache,
//! batched crypto quotes and FX conversion behind [`MarketDataService`].

pub mod batch;
mod builder;
pub mod cache;
mod error;
pub mod file_cache;
pub mod fx;
pub mod governor;
pub mod history;
mod models;
pub mod normalize;
pub mod provider;
pub mod providers;
mod service;
pub mod symbols;

pub use batch::BatchAggregator;
pub use builder::{default_limits, MarketDataServiceBuilder, CACHE_FILE, SYMBOLS_FILE};
pub use cache::{CacheLayer, CacheStore, MemoryCacheStore};
pub use error::{MarketDataError, Result};
pub use file_cache::JsonFileCacheStore;
pub use fx::{FxRateSource, FxResolver};
pub use governor::{ProviderLimits, ProviderStatus, RateGovernor};
pub use models::{
    AssetDiagnostics, AssetKind, AssetRef, BatchQuoteResult, FetchAttempt, HistoryPoint,
    HistorySeries, Horizon, PerformanceMetrics, PerformanceOptions, PriceQuote, QuoteSource,
};
pub use provider::{HistoryRole, ProviderDescriptor, QuoteProvider, RawDate, RawHistory, RawQuote};
pub use service::{MarketDataService, ServiceSettings};
pub use symbols::{SymbolStyle, SymbolTable};
