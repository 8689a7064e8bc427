use std::collections::HashMap;
use std::sync::Arc;

use super::symbols::{CoinListing, SymbolStyle};
use super::{AssetKind, MarketDataError, Result};

/// Price as a provider reported it, before normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawQuote {
    pub price: f64,
    pub currency: Option<String>,
    pub market_cap: Option<f64>,
    /// The provider knows the price is in a minor unit even if the currency
    /// label does not say so.
    pub minor_units: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawDate {
    UnixMillis(i64),
    UnixSeconds(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawHistory {
    pub points: Vec<(RawDate, f64)>,
    pub currency: Option<String>,
}

/// A third-party quote API.
///
/// Implementations make exactly one HTTP request per call and never retry;
/// pacing and fallback are the orchestrator's job. Symbols arrive already
/// translated into the provider's [`SymbolStyle`]. `currency` is the quote
/// currency requested, lowercase or uppercase as the provider prefers.
#[async_trait::async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_quote(&self, symbol: &str, currency: &str) -> Result<RawQuote>;

    /// Multi-symbol lookup in one request. Symbols missing from the response
    /// are simply absent from the map.
    async fn fetch_quotes(
        &self,
        symbols: &[String],
        currency: &str,
    ) -> Result<HashMap<String, RawQuote>> {
        let _ = (symbols, currency);
        Err(MarketDataError::call_failed(
            self.name(),
            "batch quotes are not supported",
        ))
    }

    async fn fetch_history(&self, symbol: &str, currency: &str, days: u32) -> Result<RawHistory>;

    /// Trading currency of a symbol, for providers whose quotes omit it.
    async fn fetch_currency(&self, symbol: &str) -> Result<Option<String>> {
        let _ = symbol;
        Ok(None)
    }

    /// Full symbol listing for the crypto symbol table.
    async fn fetch_symbol_list(&self) -> Result<Vec<CoinListing>> {
        Err(MarketDataError::call_failed(
            self.name(),
            "symbol listing is not supported",
        ))
    }
}

/// Where a provider sits in the history fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HistoryRole {
    /// Preferred for short windows, skipped for long ones.
    ShortWindow,
    General,
    /// Limited depth or quota; tried last.
    Narrow,
}

/// Everything the orchestrator needs to drive one provider generically.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub kinds: Vec<AssetKind>,
    pub symbol_style: SymbolStyle,
    pub history_role: HistoryRole,
    /// Accepts many ids per request; the first such crypto provider feeds the
    /// batch aggregator.
    pub batch_capable: bool,
    pub provider: Arc<dyn QuoteProvider>,
}

impl ProviderDescriptor {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        kinds: &[AssetKind],
        symbol_style: SymbolStyle,
    ) -> Self {
        Self {
            kinds: kinds.to_vec(),
            symbol_style,
            history_role: HistoryRole::General,
            batch_capable: false,
            provider,
        }
    }

    pub fn with_history_role(mut self, role: HistoryRole) -> Self {
        self.history_role = role;
        self
    }

    pub fn batch_capable(mut self) -> Self {
        self.batch_capable = true;
        self
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn supports(&self, kind: AssetKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name())
            .field("kinds", &self.kinds)
            .field("symbol_style", &self.symbol_style)
            .field("history_role", &self.history_role)
            .field("batch_capable", &self.batch_capable)
            .finish()
    }
}

/// History chain for a window: short-window providers first when the window
/// is short, then general, then narrow. Registration order breaks ties.
pub fn history_chain(
    providers: &[ProviderDescriptor],
    kind: AssetKind,
    days: u32,
    short_window_days: u32,
) -> Vec<&ProviderDescriptor> {
    let mut chain: Vec<&ProviderDescriptor> = providers
        .iter()
        .filter(|p| p.supports(kind))
        .filter(|p| p.history_role != HistoryRole::ShortWindow || days <= short_window_days)
        .collect();
    chain.sort_by_key(|p| p.history_role);
    chain
}
