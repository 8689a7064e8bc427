//! Calendar filling and change arithmetic over daily series.

use chrono::{Duration, NaiveDate};

use super::{HistoryPoint, Horizon};

pub const MIN_DAYS: u32 = 1;
pub const MAX_DAYS: u32 = 365;

pub fn clamp_days(days: u32) -> u32 {
    days.clamp(MIN_DAYS, MAX_DAYS)
}

/// First calendar day of a `days`-long window ending on `end`.
pub fn window_start(end: NaiveDate, days: u32) -> NaiveDate {
    end - Duration::days(i64::from(days.saturating_sub(1)))
}

/// Whether a provider series is dense enough to trust: at least half the
/// window's days must carry a point.
pub fn has_enough_coverage(points: &[HistoryPoint], end: NaiveDate, days: u32) -> bool {
    let start = window_start(end, days);
    let in_window = points
        .iter()
        .filter(|p| p.date >= start && p.date <= end)
        .count();
    in_window * 2 >= days as usize
}

/// Re-expresses `points` (sorted by date) over every calendar day of the
/// window ending on `end`. Days without a point take the latest earlier
/// price; days before the first known price take the first price.
///
/// Returns `None` only when `points` is empty.
pub fn fill_calendar(
    points: &[HistoryPoint],
    end: NaiveDate,
    days: u32,
) -> Option<Vec<HistoryPoint>> {
    let first = points.first()?;
    let start = window_start(end, days);

    let mut filled = Vec::with_capacity(days as usize);
    let mut cursor = 0;
    let mut carry: Option<f64> = None;
    let mut date = start;
    while date <= end {
        while cursor < points.len() && points[cursor].date <= date {
            carry = Some(points[cursor].price);
            cursor += 1;
        }
        filled.push(HistoryPoint {
            date,
            price: carry.unwrap_or(first.price),
        });
        date += Duration::days(1);
    }
    Some(filled)
}

/// A series of `days` points all at `price`, used when no provider and no
/// cache tier could supply history.
pub fn flat_series(price: f64, end: NaiveDate, days: u32) -> Vec<HistoryPoint> {
    let start = window_start(end, days);
    (0..days)
        .map(|offset| HistoryPoint {
            date: start + Duration::days(i64::from(offset)),
            price,
        })
        .collect()
}

/// Fractional change from the window's first point to its last.
/// The one-day horizon reads only the last two points.
pub fn horizon_change(points: &[HistoryPoint], horizon: Horizon) -> Option<f64> {
    let window = match horizon {
        Horizon::OneDay if points.len() > 2 => &points[points.len() - 2..],
        _ => points,
    };
    let first = window.first()?.price;
    let last = window.last()?.price;
    if first == 0.0 || window.len() < 2 {
        return None;
    }
    Some((last - first) / first)
}
