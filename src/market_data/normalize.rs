//! Conversion of raw provider payloads into canonical shapes: ISO dates,
//! uppercase ISO-4217 currencies, major-unit prices.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use super::provider::{RawDate, RawHistory, RawQuote};
use super::HistoryPoint;

/// A quote after currency normalization but before currency resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuote {
    pub price: f64,
    pub currency: Option<String>,
    pub market_cap: Option<f64>,
    /// The provider said the price is in a minor unit (GBp, GBX).
    pub minor_units: bool,
}

/// Canonical currency code for a provider's currency label.
///
/// Returns the major currency and whether the label denotes its minor unit.
pub fn normalize_currency(raw: &str) -> Option<(String, bool)> {
    let raw = raw.trim();
    match raw {
        "GBp" | "GBX" | "gbx" | "GBx" => return Some(("GBP".to_string(), true)),
        "ZAc" | "ZAC" => return Some(("ZAR".to_string(), true)),
        _ => {}
    }
    if raw.len() == 3 && raw.chars().all(|c| c.is_ascii_alphabetic()) {
        Some((raw.to_uppercase(), false))
    } else {
        None
    }
}

pub fn normalize_quote(raw: &RawQuote) -> NormalizedQuote {
    let (currency, flagged) = match raw.currency.as_deref().and_then(normalize_currency) {
        Some((code, minor)) => (Some(code), minor),
        None => (None, false),
    };
    NormalizedQuote {
        price: raw.price,
        currency,
        market_cap: raw.market_cap.filter(|cap| cap.is_finite() && *cap > 0.0),
        minor_units: flagged || raw.minor_units,
    }
}

/// Rescales pence-quoted prices to pounds.
///
/// Some equity providers report London listings in pence while labelling them
/// GBP; a GBP price above 1000 is treated as pence for that reason. The rule is
/// specific to GBP.
pub fn rescale_minor_units(price: f64, currency: &str, flagged: bool) -> f64 {
    if flagged || (currency == "GBP" && price > 1000.0) {
        price / 100.0
    } else {
        price
    }
}

pub fn raw_date_to_naive(date: &RawDate) -> Option<NaiveDate> {
    match date {
        RawDate::UnixMillis(ms) => DateTime::from_timestamp_millis(*ms).map(|dt| dt.date_naive()),
        RawDate::UnixSeconds(s) => DateTime::from_timestamp(*s, 0).map(|dt| dt.date_naive()),
        RawDate::Text(text) => {
            let text = text.trim();
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|dt| dt.date())
                })
                .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
        }
    }
}

/// Sorted, one-point-per-date series. Later entries for the same date win,
/// which keeps the closing sample when a provider returns intraday points.
/// Unparseable dates and non-positive prices are dropped.
pub fn normalize_history(raw: &RawHistory) -> Vec<HistoryPoint> {
    let mut by_date: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for (date, price) in &raw.points {
        if !price.is_finite() || *price <= 0.0 {
            continue;
        }
        if let Some(date) = raw_date_to_naive(date) {
            by_date.insert(date, *price);
        }
    }
    by_date
        .into_iter()
        .map(|(date, price)| HistoryPoint { date, price })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn currency_labels() {
        assert_eq!(normalize_currency("usd"), Some(("USD".to_string(), false)));
        assert_eq!(normalize_currency(" EUR "), Some(("EUR".to_string(), false)));
        assert_eq!(normalize_currency("GBp"), Some(("GBP".to_string(), true)));
        assert_eq!(normalize_currency("GBX"), Some(("GBP".to_string(), true)));
        assert_eq!(normalize_currency(""), None);
        assert_eq!(normalize_currency("N/A"), None);
    }

    #[test]
    fn pence_rescaling() {
        assert_eq!(rescale_minor_units(7250.0, "GBP", false), 72.5);
        assert_eq!(rescale_minor_units(72.5, "GBP", true), 0.725);
        assert_eq!(rescale_minor_units(950.0, "GBP", false), 950.0);
        assert_eq!(rescale_minor_units(4500.0, "USD", false), 4500.0);
    }

    #[test]
    fn quote_carries_minor_unit_flag() {
        let raw = RawQuote {
            price: 7250.0,
            currency: Some("GBp".to_string()),
            market_cap: Some(0.0),
            minor_units: false,
        };
        let q = normalize_quote(&raw);
        assert_eq!(q.currency.as_deref(), Some("GBP"));
        assert!(q.minor_units);
        assert_eq!(q.market_cap, None);
    }

    #[test]
    fn parses_every_date_shape() {
        assert_eq!(
            raw_date_to_naive(&RawDate::UnixMillis(1_709_251_200_000)),
            Some(d("2024-03-01"))
        );
        assert_eq!(
            raw_date_to_naive(&RawDate::UnixSeconds(1_709_251_200)),
            Some(d("2024-03-01"))
        );
        assert_eq!(
            raw_date_to_naive(&RawDate::Text("2024-03-01".into())),
            Some(d("2024-03-01"))
        );
        assert_eq!(
            raw_date_to_naive(&RawDate::Text("2024-03-01 15:30:00".into())),
            Some(d("2024-03-01"))
        );
        assert_eq!(raw_date_to_naive(&RawDate::Text("yesterday".into())), None);
    }

    #[test]
    fn history_is_sorted_and_deduplicated() {
        let raw = RawHistory {
            points: vec![
                (RawDate::Text("2024-03-02".into()), 11.0),
                (RawDate::Text("2024-03-01".into()), 10.0),
                (RawDate::Text("2024-03-02 23:00:00".into()), 12.0),
                (RawDate::Text("2024-03-03".into()), f64::NAN),
                (RawDate::Text("2024-03-04".into()), 0.0),
            ],
            currency: None,
        };
        let points = normalize_history(&raw);
        assert_eq!(
            points,
            vec![
                HistoryPoint {
                    date: d("2024-03-01"),
                    price: 10.0
                },
                HistoryPoint {
                    date: d("2024-03-02"),
                    price: 12.0
                },
            ]
        );
    }
}
