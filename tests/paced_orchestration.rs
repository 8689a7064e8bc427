mod support;

use std::time::Duration;

use anyhow::Result;
use quotebook::clock::Clock;
use quotebook::market_data::{
    default_limits, AssetKind, AssetRef, Horizon, PerformanceOptions, ProviderDescriptor,
    ProviderLimits, QuoteSource, SymbolStyle,
};
use support::{daily_history, ending_on, paced_harness, settings, ScriptedProvider};
use tokio::time::Instant;

fn assert_spaced(times: &[Instant], gap: Duration) {
    let mut times = times.to_vec();
    times.sort();
    for pair in times.windows(2) {
        assert!(
            pair[1] - pair[0] >= gap,
            "calls {:?} apart, expected at least {gap:?}",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn performance_windows_queue_behind_cooldown() -> Result<()> {
    let cooldown = Duration::from_millis(1500);
    let provider = ScriptedProvider::new("coingecko");
    let h = paced_harness(
        settings("EUR"),
        vec![ProviderDescriptor::new(
            provider.clone(),
            &[AssetKind::Crypto],
            SymbolStyle::CanonicalId,
        )],
        None,
        |_| ProviderLimits::cooldown(cooldown),
    );
    let prices: Vec<f64> = (0..400).map(|i| 1000.0 + i as f64).collect();
    provider.set_history(
        "bitcoin",
        Ok(daily_history(&ending_on(h.clock.today(), &prices), Some("EUR"))),
    );

    let metrics = h
        .service
        .fetch_performance_metrics(&AssetRef::crypto("bitcoin"), PerformanceOptions::default())
        .await?;

    for horizon in Horizon::ALL {
        assert!(
            metrics.change(horizon).is_some(),
            "{horizon:?} missing: {:?}",
            metrics.changes
        );
    }
    assert_eq!(provider.count("history:"), 4);
    assert_spaced(&provider.call_times(), cooldown);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn every_stock_is_priced_under_default_pacing() -> Result<()> {
    let provider = ScriptedProvider::new("twelve_data");
    let h = paced_harness(
        settings("USD"),
        vec![ProviderDescriptor::new(
            provider.clone(),
            &[AssetKind::Stock],
            SymbolStyle::Ticker,
        )],
        None,
        default_limits,
    );
    provider.set_price("AAPL", 220.0, Some("USD"));
    provider.set_price("MSFT", 410.0, Some("USD"));
    provider.set_price("NVDA", 120.0, Some("USD"));

    let assets = vec![
        AssetRef::stock("AAPL"),
        AssetRef::stock("MSFT"),
        AssetRef::stock("NVDA"),
    ];
    let result = h.service.get_current_quotes(&assets).await?;

    assert_eq!(result.stocks.len(), 3);
    assert!(result
        .stocks
        .values()
        .all(|q| q.source == QuoteSource::Live && q.provider == "twelve_data"));
    assert_eq!(result.stocks["MSFT"].value, 410.0);
    assert!(result
        .meta
        .iter()
        .all(|m| m.resolved_by.as_deref() == Some("twelve_data")));
    assert_eq!(provider.count("quote:"), 3);
    assert_spaced(
        &provider.call_times(),
        default_limits("twelve_data").cooldown,
    );
    Ok(())
}
