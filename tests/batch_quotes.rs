mod support;

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use quotebook::market_data::{
    AssetDiagnostics, AssetKind, AssetRef, BatchQuoteResult, ProviderDescriptor, QuoteSource,
    SymbolStyle,
};
use support::{harness, settings, Harness, ScriptedProvider, ScriptedRates};

struct Setup {
    gecko: Arc<ScriptedProvider>,
    compare: Arc<ScriptedProvider>,
    rates: Arc<ScriptedRates>,
    h: Harness,
}

fn setup() -> Setup {
    let gecko = ScriptedProvider::new("gecko");
    let compare = ScriptedProvider::new("compare");
    let equities = ScriptedProvider::new("equities");
    let rates = ScriptedRates::new(&[("USD", 1.1), ("GBP", 0.8)]);
    let h = harness(
        settings("EUR"),
        vec![
            ProviderDescriptor::new(gecko.clone(), &[AssetKind::Crypto], SymbolStyle::CanonicalId)
                .batch_capable(),
            ProviderDescriptor::new(compare.clone(), &[AssetKind::Crypto], SymbolStyle::Ticker),
            ProviderDescriptor::new(equities.clone(), &[AssetKind::Stock], SymbolStyle::Ticker),
        ],
        Some(rates.clone()),
    );
    equities.set_price("AAPL", 220.0, Some("USD"));
    equities.set_price("VOD.L", 72.0, Some("GBP"));
    Setup {
        gecko,
        compare,
        rates,
        h,
    }
}

fn meta<'a>(result: &'a BatchQuoteResult, id: &str) -> &'a AssetDiagnostics {
    result
        .meta
        .iter()
        .find(|m| m.asset.id == id)
        .unwrap_or_else(|| panic!("no diagnostics for {id}"))
}

fn cryptos(ids: &[&str]) -> Vec<AssetRef> {
    ids.iter().map(|id| AssetRef::crypto(id)).collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_upstream_call() -> Result<()> {
    let s = setup();
    s.gecko.set_price("bitcoin", 60000.0, Some("eur"));
    s.gecko.set_price("ethereum", 3000.0, Some("eur"));
    s.gecko.set_price("solana", 150.0, Some("eur"));

    let first = cryptos(&["bitcoin", "ethereum"]);
    let second = cryptos(&["ethereum", "solana"]);
    let (a, b) = tokio::join!(
        s.h.service.get_current_quotes(&first),
        s.h.service.get_current_quotes(&second)
    );
    let (a, b) = (a?, b?);

    assert_eq!(s.gecko.calls(), vec!["quotes:bitcoin,ethereum,solana".to_string()]);
    assert_eq!(a.cryptos.len(), 2);
    assert_eq!(b.cryptos.len(), 2);
    assert_eq!(a.cryptos["ethereum"].value, 3000.0);
    assert_eq!(b.cryptos["solana"].provider, "gecko");
    assert_eq!(meta(&a, "bitcoin").resolved_by.as_deref(), Some("gecko"));
    assert!(s.compare.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fresh_cache_keeps_assets_out_of_the_batch() -> Result<()> {
    let s = setup();
    s.gecko.set_price("bitcoin", 60000.0, Some("eur"));
    s.gecko.set_price("ethereum", 3000.0, Some("eur"));

    s.h.service.get_current_quotes(&cryptos(&["bitcoin"])).await?;
    let result = s.h.service.get_current_quotes(&cryptos(&["bitcoin", "ethereum"])).await?;

    assert_eq!(
        s.gecko.calls(),
        vec!["quotes:bitcoin".to_string(), "quotes:ethereum".to_string()]
    );
    assert_eq!(result.cryptos["bitcoin"].source, QuoteSource::Cache);
    assert_eq!(result.cryptos["ethereum"].source, QuoteSource::Live);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ids_missing_from_batch_fall_back_per_asset() -> Result<()> {
    let s = setup();
    s.gecko.set_price("bitcoin", 60000.0, Some("eur"));
    s.compare.set_price("ADA", 0.45, Some("EUR"));

    let result = s.h.service.get_current_quotes(&cryptos(&["bitcoin", "cardano"])).await?;

    assert_eq!(result.cryptos["cardano"].provider, "compare");
    assert_eq!(result.cryptos["cardano"].value, 0.45);
    let diag = meta(&result, "cardano");
    assert_eq!(diag.resolved_by.as_deref(), Some("compare"));
    assert_eq!(diag.attempts[0].provider, "gecko");
    assert_eq!(diag.attempts[0].step, "batch");
    assert!(!diag.attempts[0].ok);
    assert_eq!(diag.attempts[1].step, "native");
    assert!(diag.attempts[1].ok);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reference_currency_step_converts_through_fx() -> Result<()> {
    let s = setup();
    s.compare.fail_quote("ADA@EUR");
    s.compare.set_price("ADA@USD", 0.55, Some("USD"));

    let result = s.h.service.get_current_quotes(&cryptos(&["ada"])).await?;

    let quote = &result.cryptos["ada"];
    assert_eq!(quote.currency, "USD");
    assert_eq!(quote.reporting_currency, "EUR");
    assert!((quote.value - 0.5).abs() < 1e-9);
    let steps: Vec<(&str, bool)> = meta(&result, "ada")
        .attempts
        .iter()
        .map(|a| (a.step.as_str(), a.ok))
        .collect();
    assert_eq!(steps, vec![("batch", false), ("native", false), ("reference", true)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stale_cache_is_the_last_tier() -> Result<()> {
    let s = setup();
    s.gecko.set_price("bitcoin", 60000.0, Some("eur"));
    s.h.service.get_current_quotes(&cryptos(&["bitcoin"])).await?;

    s.h.clock.advance(Duration::days(2));
    s.gecko.fail_quote("bitcoin");

    let result = s.h.service.get_current_quotes(&cryptos(&["bitcoin", "unknowncoin"])).await?;

    assert_eq!(result.cryptos["bitcoin"].source, QuoteSource::CacheStale);
    assert!(!result.cryptos.contains_key("unknowncoin"));
    let missing = meta(&result, "unknowncoin");
    assert!(missing.resolved_by.is_none());
    assert!(missing.attempts.iter().all(|a| !a.ok));
    let stale = meta(&result, "bitcoin");
    assert_eq!(stale.resolved_by.as_deref(), Some("cache"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stocks_are_converted_in_one_fx_pass() -> Result<()> {
    let s = setup();
    let assets = vec![AssetRef::stock("AAPL"), AssetRef::stock("VOD.L")];

    let result = s.h.service.get_current_quotes(&assets).await?;

    assert_eq!(s.rates.calls(), vec![vec!["GBP".to_string(), "USD".to_string()]]);
    assert!((result.stocks["AAPL"].value - 200.0).abs() < 1e-9);
    assert!((result.stocks["VOD.L"].value - 90.0).abs() < 1e-9);
    assert!(result.cryptos.is_empty());
    Ok(())
}
