use anyhow::Result;
use quotebook::market_data::providers::CoinGeckoProvider;
use quotebook::market_data::{MarketDataError, QuoteProvider, RawDate};
use secrecy::SecretString;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn coingecko_simple_price_batches_ids() -> Result<()> {
    let server = MockServer::start().await;
    let provider = CoinGeckoProvider::new().with_base_url(server.uri());

    let body = r#"{
        "bitcoin": {"eur": 58000.5, "eur_market_cap": 1140000000000.0},
        "ethereum": {"eur": 3100.25}
    }"#;

    Mock::given(method("GET"))
        .and(path("/simple/price"))
        .and(query_param("ids", "bitcoin,ethereum,nosuchcoin"))
        .and(query_param("vs_currencies", "eur"))
        .and(query_param("include_market_cap", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .expect(1)
        .mount(&server)
        .await;

    let ids = vec!["bitcoin".to_string(), "ethereum".to_string(), "nosuchcoin".to_string()];
    let quotes = provider.fetch_quotes(&ids, "eur").await?;

    assert_eq!(quotes.len(), 2);
    assert_eq!(quotes["bitcoin"].price, 58000.5);
    assert_eq!(quotes["bitcoin"].currency.as_deref(), Some("EUR"));
    assert_eq!(quotes["bitcoin"].market_cap, Some(1140000000000.0));
    assert_eq!(quotes["ethereum"].market_cap, None);
    Ok(())
}

#[tokio::test]
async fn coingecko_market_chart_returns_millisecond_points() -> Result<()> {
    let server = MockServer::start().await;
    let provider = CoinGeckoProvider::new()
        .with_base_url(server.uri())
        .with_api_key(SecretString::from("demo-key".to_string()));

    let body = r#"{
        "prices": [[1709164800000, 57000.0], [1709251200000, 58000.0]],
        "market_caps": [],
        "total_volumes": []
    }"#;

    Mock::given(method("GET"))
        .and(path("/coins/bitcoin/market_chart"))
        .and(query_param("vs_currency", "eur"))
        .and(query_param("days", "7"))
        .and(query_param("interval", "daily"))
        .and(header("x-cg-demo-api-key", "demo-key"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let history = provider.fetch_history("bitcoin", "EUR", 7).await?;
    assert_eq!(history.points.len(), 2);
    assert_eq!(history.points[0], (RawDate::UnixMillis(1709164800000), 57000.0));
    assert_eq!(history.currency.as_deref(), Some("EUR"));
    Ok(())
}

#[tokio::test]
async fn coingecko_http_429_is_rate_limited() -> Result<()> {
    let server = MockServer::start().await;
    let provider = CoinGeckoProvider::new().with_base_url(server.uri());

    Mock::given(method("GET"))
        .and(path("/simple/price"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = provider.fetch_quote("bitcoin", "eur").await.unwrap_err();
    assert!(matches!(err, MarketDataError::RateLimited { .. }));
    Ok(())
}

#[tokio::test]
async fn coingecko_in_band_error_status_is_rate_limited() -> Result<()> {
    let server = MockServer::start().await;
    let provider = CoinGeckoProvider::new().with_base_url(server.uri());

    let body =
        r#"{"status": {"error_code": 429, "error_message": "You've exceeded the Rate Limit."}}"#;
    Mock::given(method("GET"))
        .and(path("/coins/list"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let err = provider.fetch_symbol_list().await.unwrap_err();
    assert!(err.is_rate_limited());
    Ok(())
}

#[tokio::test]
async fn coingecko_coin_list_parses_listings() -> Result<()> {
    let server = MockServer::start().await;
    let provider = CoinGeckoProvider::new().with_base_url(server.uri());

    let body = r#"[
        {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin"},
        {"id": "kaspa", "symbol": "kas", "name": "Kaspa"}
    ]"#;
    Mock::given(method("GET"))
        .and(path("/coins/list"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let listings = provider.fetch_symbol_list().await?;
    assert_eq!(listings.len(), 2);
    assert_eq!(listings[1].id, "kaspa");
    assert_eq!(listings[1].symbol, "kas");
    Ok(())
}
