//! Symbol translation between internal asset ids and each provider's syntax.
//!
//! Crypto assets are identified internally by the CoinGecko-style canonical id
//! (`bitcoin`). Stocks use a ticker with an optional dotted exchange suffix
//! (`AAPL`, `VOD.L`, `SAP.DE`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{AssetKind, AssetRef};

/// How a provider spells an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStyle {
    /// Canonical crypto id, e.g. `bitcoin`.
    CanonicalId,
    /// Bare uppercase ticker, e.g. `BTC`.
    Ticker,
    /// `BASE/QUOTE` for crypto, `TICKER:EXCHANGE` for listed stocks.
    Pair,
    /// Ticker with the provider's own exchange suffix, e.g. `VOD.LON`.
    DotSuffix,
}

/// Exchange metadata for a dotted stock suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSuffix {
    pub suffix: &'static str,
    pub currency: &'static str,
    /// Exchange code used in `TICKER:EXCHANGE` pairs.
    pub pair_exchange: &'static str,
    /// Suffix used by dot-suffix providers.
    pub dot_suffix: &'static str,
    /// Prices on this venue are usually quoted in the minor unit (pence).
    pub minor_units: bool,
}

const fn venue(
    suffix: &'static str,
    currency: &'static str,
    pair_exchange: &'static str,
    dot_suffix: &'static str,
) -> ExchangeSuffix {
    ExchangeSuffix {
        suffix,
        currency,
        pair_exchange,
        dot_suffix,
        minor_units: false,
    }
}

pub const EXCHANGE_SUFFIXES: &[ExchangeSuffix] = &[
    ExchangeSuffix {
        suffix: "L",
        currency: "GBP",
        pair_exchange: "LSE",
        dot_suffix: "LON",
        minor_units: true,
    },
    venue("DE", "EUR", "XETR", "DEX"),
    venue("F", "EUR", "FSX", "FRK"),
    venue("PA", "EUR", "Euronext", "PAR"),
    venue("AS", "EUR", "Euronext", "AMS"),
    venue("BR", "EUR", "Euronext", "BRU"),
    venue("MI", "EUR", "MTA", "MIL"),
    venue("MC", "EUR", "BME", "MCE"),
    venue("SW", "CHF", "SIX", "SWX"),
    venue("ST", "SEK", "OMX", "STO"),
    venue("CO", "DKK", "OMXC", "CPH"),
    venue("OL", "NOK", "OSE", "OSL"),
    venue("TO", "CAD", "TSX", "TRT"),
    venue("V", "CAD", "TSXV", "TRV"),
    venue("AX", "AUD", "ASX", "AX"),
    venue("HK", "HKD", "HKEX", "HKG"),
    venue("T", "JPY", "JPX", "TYO"),
];

/// Currency of an unsuffixed ticker.
pub const DEFAULT_LISTING_CURRENCY: &str = "USD";

/// Splits `VOD.L` into (`VOD`, suffix entry). Tickers without a known suffix
/// (including class shares such as `BRK.B`) are returned whole.
pub fn split_exchange_suffix(ticker: &str) -> (&str, Option<&'static ExchangeSuffix>) {
    if let Some((base, suffix)) = ticker.rsplit_once('.') {
        if let Some(entry) = EXCHANGE_SUFFIXES
            .iter()
            .find(|e| e.suffix.eq_ignore_ascii_case(suffix))
        {
            return (base, Some(entry));
        }
    }
    (ticker, None)
}

/// Currency inferred from the ticker's exchange suffix, with the venue's
/// minor-unit flag.
///
/// Unsuffixed tickers and share-class suffixes (`BRK.B`) are US listings.
/// Unknown suffixes yield `None`; callers then default to the reporting
/// currency.
pub fn infer_stock_currency(ticker: &str) -> Option<(&'static str, bool)> {
    match split_exchange_suffix(ticker) {
        (_, Some(venue)) => Some((venue.currency, venue.minor_units)),
        (base, None) => match base.rsplit_once('.') {
            None => Some((DEFAULT_LISTING_CURRENCY, false)),
            Some((_, class)) if class.len() == 1 => Some((DEFAULT_LISTING_CURRENCY, false)),
            Some(_) => None,
        },
    }
}

/// One row of the `/coins/list` shaped symbol file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinListing {
    pub id: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
}

const BUILTIN_COINS: &[(&str, &str)] = &[
    ("btc", "bitcoin"),
    ("eth", "ethereum"),
    ("usdt", "tether"),
    ("usdc", "usd-coin"),
    ("bnb", "binancecoin"),
    ("xrp", "ripple"),
    ("ada", "cardano"),
    ("doge", "dogecoin"),
    ("sol", "solana"),
    ("dot", "polkadot"),
    ("matic", "matic-network"),
    ("ltc", "litecoin"),
    ("trx", "tron"),
    ("avax", "avalanche-2"),
    ("dai", "dai"),
    ("link", "chainlink"),
    ("atom", "cosmos"),
    ("uni", "uniswap"),
    ("etc", "ethereum-classic"),
    ("xlm", "stellar"),
    ("bch", "bitcoin-cash"),
    ("algo", "algorand"),
    ("fil", "filecoin"),
    ("near", "near"),
    ("aave", "aave"),
    ("mkr", "maker"),
    ("xmr", "monero"),
    ("xtz", "tezos"),
    ("kas", "kaspa"),
];

/// Ticker <-> canonical id table for crypto assets.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_symbol: HashMap<String, String>,
    by_id: HashMap<String, String>,
}

impl SymbolTable {
    pub fn builtin() -> Self {
        Self::from_listings(BUILTIN_COINS.iter().map(|(symbol, id)| CoinListing {
            id: id.to_string(),
            symbol: symbol.to_string(),
            name: String::new(),
        }))
    }

    /// Builds the table. When several ids share a symbol the first listing wins,
    /// and built-in entries are never displaced by later obscure tokens.
    pub fn from_listings(listings: impl IntoIterator<Item = CoinListing>) -> Self {
        let mut table = Self::default();
        for (symbol, id) in BUILTIN_COINS {
            table.by_symbol.insert(symbol.to_string(), id.to_string());
            table.by_id.insert(id.to_string(), symbol.to_string());
        }
        for listing in listings {
            let symbol = listing.symbol.trim().to_lowercase();
            let id = listing.id.trim().to_lowercase();
            if symbol.is_empty() || id.is_empty() {
                continue;
            }
            table.by_symbol.entry(symbol.clone()).or_insert_with(|| id.clone());
            table.by_id.entry(id).or_insert(symbol);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }

    /// Canonical id for a ticker, case-insensitive.
    pub fn id_for_symbol(&self, symbol: &str) -> Option<&str> {
        self.by_symbol
            .get(&symbol.trim().to_lowercase())
            .map(String::as_str)
    }

    /// Uppercase ticker for a canonical id.
    pub fn symbol_for_id(&self, id: &str) -> Option<String> {
        self.by_id
            .get(&id.trim().to_lowercase())
            .map(|s| s.to_uppercase())
    }

    /// Resolves the id the crypto providers should be asked for: the alias if
    /// present, else the id after normalization, mapped through the ticker
    /// table when it is a known ticker rather than an id.
    pub fn resolve_crypto_id(&self, asset: &AssetRef) -> String {
        let raw = asset.alias.as_deref().unwrap_or(&asset.id);
        let normalized = normalize_crypto_id(raw);
        if self.by_id.contains_key(&normalized) {
            return normalized;
        }
        match self.id_for_symbol(&normalized) {
            Some(id) => id.to_string(),
            None => normalized,
        }
    }

    /// Loads `path`; if absent, asks `fetch` for a live listing and writes it
    /// back; if that fails too, falls back to the built-in table.
    pub async fn load_or_fetch<F, Fut>(path: &Path, fetch: F) -> Self
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = super::Result<Vec<CoinListing>>>,
    {
        match Self::load(path).await {
            Ok(Some(table)) => {
                debug!(path = %path.display(), entries = table.len(), "symbol table loaded");
                return table;
            }
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "symbol table unreadable"),
        }

        match fetch().await {
            Ok(listings) => {
                if let Err(e) = Self::save(path, &listings).await {
                    warn!(path = %path.display(), error = %e, "failed to write symbol table");
                }
                let table = Self::from_listings(listings);
                info!(entries = table.len(), "symbol table fetched");
                table
            }
            Err(e) => {
                warn!(error = %e, "symbol table fetch failed, using built-in table");
                Self::builtin()
            }
        }
    }

    async fn load(path: &Path) -> Result<Option<Self>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let listings: Vec<CoinListing> = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(Self::from_listings(listings)))
    }

    async fn save(path: &Path, listings: &[CoinListing]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(listings)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

fn normalization_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"^(xbt|wbtc|wrapped-bitcoin|btc-perp|btcusd-perp)$", "bitcoin"),
            (r"^(weth|steth|staked-ether|wrapped-steth|eth-perp|ethusd-perp)$", "ethereum"),
            (r"^(wsol|sol-perp)$", "solana"),
        ]
        .into_iter()
        .filter_map(|(pattern, target)| Regex::new(pattern).ok().map(|re| (re, target)))
        .collect()
    })
}

/// Rewrites synthetic and derivative identifiers to the underlying instrument.
pub fn normalize_crypto_id(id: &str) -> String {
    let id = id.trim().to_lowercase();
    for (pattern, target) in normalization_rules() {
        if pattern.is_match(&id) {
            return (*target).to_string();
        }
    }
    id
}

/// Spells `asset` for a provider. `crypto_id` is the already-resolved
/// canonical id for crypto assets; `quote_currency` completes pair symbols.
/// Returns `None` when the style cannot express the asset.
pub fn translate(
    asset: &AssetRef,
    crypto_id: &str,
    style: SymbolStyle,
    table: &SymbolTable,
    quote_currency: &str,
) -> Option<String> {
    match (asset.kind, style) {
        (AssetKind::Crypto, SymbolStyle::CanonicalId) => Some(crypto_id.to_string()),
        (AssetKind::Crypto, SymbolStyle::Ticker) => Some(crypto_ticker(crypto_id, table)),
        (AssetKind::Crypto, SymbolStyle::Pair) => Some(format!(
            "{}/{}",
            crypto_ticker(crypto_id, table),
            quote_currency.to_uppercase()
        )),
        (AssetKind::Crypto, SymbolStyle::DotSuffix) => None,
        (AssetKind::Stock, SymbolStyle::Pair) => Some(match split_exchange_suffix(&asset.id) {
            (base, Some(venue)) => format!("{base}:{}", venue.pair_exchange),
            (ticker, None) => ticker.to_string(),
        }),
        (AssetKind::Stock, SymbolStyle::DotSuffix) => Some(match split_exchange_suffix(&asset.id) {
            (base, Some(venue)) => format!("{base}.{}", venue.dot_suffix),
            (ticker, None) => ticker.to_string(),
        }),
        (AssetKind::Stock, SymbolStyle::Ticker) => Some(asset.id.clone()),
        (AssetKind::Stock, SymbolStyle::CanonicalId) => None,
    }
}

fn crypto_ticker(crypto_id: &str, table: &SymbolTable) -> String {
    table
        .symbol_for_id(crypto_id)
        .unwrap_or_else(|| crypto_id.to_uppercase())
}
