use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::MarketDataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Crypto,
    Stock,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Crypto => "crypto",
            AssetKind::Stock => "stock",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "crypto" => Ok(AssetKind::Crypto),
            "stock" | "equity" => Ok(AssetKind::Stock),
            other => Err(MarketDataError::InvalidInput(format!(
                "unknown asset kind: {other}"
            ))),
        }
    }
}

/// Identity of an asset as the rest of the application knows it.
///
/// Crypto ids are lowercase (`bitcoin`), stock ids are ticker-cased (`AAPL`,
/// `VOD.L`). The optional alias names the provider-canonical id to look up
/// when `id` is a short ticker, e.g. `btc` with alias `bitcoin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: String,
    pub kind: AssetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl AssetRef {
    pub fn new(id: impl AsRef<str>, kind: AssetKind) -> Self {
        let id = id.as_ref().trim();
        let id = match kind {
            AssetKind::Crypto => id.to_lowercase(),
            AssetKind::Stock => id.to_uppercase(),
        };
        Self {
            id,
            kind,
            alias: None,
        }
    }

    pub fn crypto(id: impl AsRef<str>) -> Self {
        Self::new(id, AssetKind::Crypto)
    }

    pub fn stock(ticker: impl AsRef<str>) -> Self {
        Self::new(ticker, AssetKind::Stock)
    }

    pub fn with_alias(mut self, alias: impl AsRef<str>) -> Self {
        self.alias = Some(alias.as_ref().trim().to_lowercase());
        self
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Parses `kind:id` or `kind:id=alias`, as accepted on the command line.
impl FromStr for AssetRef {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s.split_once(':').ok_or_else(|| {
            MarketDataError::InvalidInput(format!("expected kind:id, got {s:?}"))
        })?;
        let kind: AssetKind = kind.parse()?;
        let (id, alias) = match rest.split_once('=') {
            Some((id, alias)) => (id, Some(alias)),
            None => (rest, None),
        };
        if id.trim().is_empty() {
            return Err(MarketDataError::InvalidInput(format!("empty id in {s:?}")));
        }
        let asset = AssetRef::new(id, kind);
        Ok(match alias {
            Some(alias) => asset.with_alias(alias),
            None => asset,
        })
    }
}

/// How a returned value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuoteSource {
    /// Fetched from a provider during this request.
    Live,
    /// Served from the TTL cache.
    Cache,
    /// Served from the non-expiring last-good snapshot.
    CacheStale,
    /// Derived locally (performance figures, degraded placeholder series).
    Calculated,
}

impl QuoteSource {
    pub fn is_degraded(&self) -> bool {
        matches!(self, QuoteSource::CacheStale | QuoteSource::Calculated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Price in the instrument's native currency.
    pub price: f64,
    pub currency: String,
    /// Price converted into `reporting_currency`.
    pub value: f64,
    pub reporting_currency: String,
    pub market_cap: Option<f64>,
    pub source: QuoteSource,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub price: f64,
}

/// One point per calendar day, oldest first, always exactly `days` long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySeries {
    pub asset: AssetRef,
    pub days: u32,
    pub currency: String,
    pub source: QuoteSource,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
    pub history: Vec<HistoryPoint>,
}

impl HistorySeries {
    pub fn first_price(&self) -> Option<f64> {
        self.history.first().map(|p| p.price)
    }

    pub fn last_price(&self) -> Option<f64> {
        self.history.last().map(|p| p.price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "1y")]
    OneYear,
}

impl Horizon {
    pub const ALL: [Horizon; 4] = [
        Horizon::OneDay,
        Horizon::SevenDays,
        Horizon::ThirtyDays,
        Horizon::OneYear,
    ];

    /// History window the horizon is computed from. The one-day figure reads
    /// the last two points of a two-day window so a single missing daily
    /// point does not blank it.
    pub fn window_days(&self) -> u32 {
        match self {
            Horizon::OneDay => 2,
            Horizon::SevenDays => 7,
            Horizon::ThirtyDays => 30,
            Horizon::OneYear => 365,
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Horizon::OneDay => "1d",
            Horizon::SevenDays => "7d",
            Horizon::ThirtyDays => "30d",
            Horizon::OneYear => "1y",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub asset: AssetRef,
    /// Fractional return per horizon; `None` when an endpoint is missing or
    /// the window starts at zero.
    pub changes: BTreeMap<Horizon, Option<f64>>,
    pub source: QuoteSource,
    pub fetched_at: DateTime<Utc>,
}

impl PerformanceMetrics {
    pub fn change(&self, horizon: Horizon) -> Option<f64> {
        self.changes.get(&horizon).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceOptions {
    /// Skip the performance cache and recompute from history.
    pub no_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchAttempt {
    pub provider: String,
    pub step: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-asset record of how a batch lookup was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDiagnostics {
    pub asset: AssetRef,
    pub attempts: Vec<FetchAttempt>,
    pub resolved_by: Option<String>,
}

impl AssetDiagnostics {
    pub fn new(asset: AssetRef) -> Self {
        Self {
            asset,
            attempts: Vec::new(),
            resolved_by: None,
        }
    }

    pub fn record(&mut self, provider: &str, step: &str, outcome: Result<(), String>) {
        let ok = outcome.is_ok();
        if ok && self.resolved_by.is_none() {
            self.resolved_by = Some(provider.to_string());
        }
        self.attempts.push(FetchAttempt {
            provider: provider.to_string(),
            step: step.to_string(),
            ok,
            detail: outcome.err(),
        });
    }
}

/// Result of a multi-asset lookup. Maps are keyed by the caller's asset id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchQuoteResult {
    pub cryptos: HashMap<String, PriceQuote>,
    pub stocks: HashMap<String, PriceQuote>,
    pub meta: Vec<AssetDiagnostics>,
}
