//! Humane duration strings such as "1500ms", "5m", "6h" or "1d".
//!
//! Used by the config file for cache lifetimes, provider cooldowns and the
//! batch collection window.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};

const UNITS: &[(&str, u64)] = &[
    ("ms", 1),
    ("s", 1_000),
    ("m", 60 * 1_000),
    ("h", 60 * 60 * 1_000),
    ("d", 24 * 60 * 60 * 1_000),
];

/// Parse a duration string made of an unsigned integer and a unit suffix.
///
/// Supported units: `ms`, `s`, `m`, `h`, `d`. Case-insensitive, surrounding
/// whitespace is ignored.
///
/// ```
/// use quotebook::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 3600));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .context("Duration must end with ms, s, m, h, or d")?;
    let (num, unit) = s.split_at(split);

    let millis_per_unit = UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, factor)| *factor)
        .with_context(|| format!("Unknown duration unit: {unit:?}"))?;

    let num: u64 = num.parse().context("Invalid number in duration")?;
    let millis = num
        .checked_mul(millis_per_unit)
        .context("Duration is too large")?;

    Ok(Duration::from_millis(millis))
}

/// Render a duration using the largest unit that divides it evenly.
///
/// ```
/// use quotebook::duration::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
/// ```
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis() as u64;
    if millis == 0 {
        return "0s".to_string();
    }

    UNITS
        .iter()
        .rev()
        .find(|(_, factor)| millis % factor == 0)
        .map(|(name, factor)| format!("{}{}", millis / factor, name))
        .unwrap_or_else(|| format!("{millis}ms"))
}

/// Serde deserializer for duration strings.
///
/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

/// Serde deserializer for optional duration strings.
///
/// Use with `#[serde(default, deserialize_with = "deserialize_duration_opt")]`.
pub fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    opt.map(|s| parse_duration(&s).map_err(de::Error::custom))
        .transpose()
}
