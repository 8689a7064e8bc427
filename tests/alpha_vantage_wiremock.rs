use anyhow::Result;
use quotebook::market_data::providers::AlphaVantageProvider;
use quotebook::market_data::{QuoteProvider, RawDate};
use secrecy::SecretString;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> AlphaVantageProvider {
    AlphaVantageProvider::new(SecretString::from("av-key".to_string())).with_base_url(server.uri())
}

#[tokio::test]
async fn alpha_vantage_global_quote_has_no_currency() -> Result<()> {
    let server = MockServer::start().await;

    let body = r#"{"Global Quote": {"01. symbol": "VOD.LON", "05. price": "70.5200"}}"#;
    Mock::given(method("GET"))
        .and(path("/query"))
        .and(query_param("function", "GLOBAL_QUOTE"))
        .and(query_param("symbol", "VOD.LON"))
        .and(query_param("apikey", "av-key"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let quote = provider(&server).fetch_quote("VOD.LON", "").await?;
    assert_eq!(quote.price, 70.52);
    assert!(quote.currency.is_none());
    Ok(())
}

#[tokio::test]
async fn alpha_vantage_symbol_search_supplies_currency() -> Result<()> {
    let server = MockServer::start().await;

    let body = r#"{"bestMatches": [
        {"1. symbol": "VOD", "8. currency": "USD"},
        {"1. symbol": "VOD.LON", "8. currency": "GBX"}
    ]}"#;
    Mock::given(method("GET"))
        .and(path("/query"))
        .and(query_param("function", "SYMBOL_SEARCH"))
        .and(query_param("keywords", "VOD.LON"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let currency = provider(&server).fetch_currency("VOD.LON").await?;
    assert_eq!(currency.as_deref(), Some("GBX"));
    Ok(())
}

#[tokio::test]
async fn alpha_vantage_daily_series() -> Result<()> {
    let server = MockServer::start().await;

    let body = r#"{
        "Meta Data": {"2. Symbol": "IBM"},
        "Time Series (Daily)": {
            "2024-03-01": {"1. open": "185.0", "4. close": "187.42"}
        }
    }"#;
    Mock::given(method("GET"))
        .and(path("/query"))
        .and(query_param("function", "TIME_SERIES_DAILY"))
        .and(query_param("outputsize", "compact"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let history = provider(&server).fetch_history("IBM", "", 30).await?;
    assert_eq!(history.points, vec![(RawDate::Text("2024-03-01".to_string()), 187.42)]);
    Ok(())
}

#[tokio::test]
async fn alpha_vantage_daily_quota_note_is_rate_limited() -> Result<()> {
    let server = MockServer::start().await;

    let body = concat!(
        r#"{"Information": "Thank you for using Alpha Vantage! "#,
        r#"Our standard API rate limit is 25 requests per day."}"#
    );
    Mock::given(method("GET"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&server)
        .await;

    let err = provider(&server).fetch_quote("IBM", "").await.unwrap_err();
    assert!(err.is_rate_limited());
    Ok(())
}
