//! Derivation of end-of-day and peak values from a raw price series.
//!
//! The price API returns a JSON array of points. Field names vary between
//! endpoints (`price`/`value`/`close` for the price, `dateTime`/`time`/
//! `timestamp` for the time) and prices may arrive as numbers or formatted
//! strings such as `"$1,25"`. Times are either local timestamp strings or
//! Unix seconds, which are shifted to Bern time before comparison.

use chrono::{DateTime, NaiveDateTime, NaiveTime, Timelike};
use chrono_tz::Europe::Zurich;
use serde_json::Value;
use tradelog_core::TradeResult;

/// Session close (Bern time) whose price counts as the end-of-day price.
pub const SESSION_CLOSE: (u32, u32) = (22, 0);

const PRICE_FIELDS: [&str; 3] = ["price", "value", "close"];
const TIME_FIELDS: [&str; 3] = ["dateTime", "time", "timestamp"];

/// Parses a price given as a JSON number or a formatted string.
///
/// Strings may carry a `$` sign and spaces. A comma is read as a decimal
/// separator unless the string also has a dot, in which case commas are
/// thousands separators.
#[must_use]
pub fn parse_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != '$' && !c.is_whitespace()).collect();
            let normalized = if cleaned.contains('.') {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            };
            normalized.parse().ok()
        }
        _ => None,
    }
}

/// Parses the time of day from a timestamp string.
#[must_use]
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.time());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(at.time());
        }
    }
    ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(raw, format).ok())
}

fn point_price(point: &Value) -> Option<f64> {
    PRICE_FIELDS
        .iter()
        .find_map(|field| point.get(field).and_then(parse_price))
}

/// Converts Unix seconds (UTC) to the Bern time of day.
#[must_use]
pub fn epoch_time(seconds: f64) -> Option<NaiveTime> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    let at = DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))?;
    Some(at.with_timezone(&Zurich).time())
}

fn point_time(point: &Value) -> Option<NaiveTime> {
    TIME_FIELDS.iter().find_map(|field| match point.get(field)? {
        Value::String(raw) => parse_time(raw),
        Value::Number(n) => n.as_f64().and_then(epoch_time),
        _ => None,
    })
}

fn is_session_close(time: NaiveTime) -> bool {
    (time.hour(), time.minute()) == SESSION_CLOSE
}

/// Derives the trade result from `series`.
///
/// - End-of-day price: the price at [`SESSION_CLOSE`], otherwise the last
///   parseable price in the series.
/// - Peak: the lowest price at or after `opened_at` (the whole series when
///   `None`), the best point for a short option position. Ties keep the
///   earliest point.
#[must_use]
pub fn derive_trade_result(
    series: &[Value],
    opened_at: Option<NaiveTime>,
    api_link: Option<String>,
) -> TradeResult {
    let end_of_day_price = series
        .iter()
        .find(|point| point_time(point).is_some_and(is_session_close))
        .and_then(point_price)
        .or_else(|| series.iter().rev().find_map(point_price));

    let mut peak: Option<(f64, NaiveTime)> = None;
    for point in series {
        let (Some(price), Some(time)) = (point_price(point), point_time(point)) else {
            continue;
        };
        if opened_at.is_some_and(|open| time < open) {
            continue;
        }
        if peak.is_none_or(|(best, _)| price < best) {
            peak = Some((price, time));
        }
    }

    TradeResult {
        end_of_day_price,
        peak_price: peak.map(|(price, _)| price),
        peak_time: peak.map(|(_, time)| time.format("%H:%M:%S").to_string()),
        api_link,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_price_formats() {
        assert_eq!(parse_price(&json!(1.5)), Some(1.5));
        assert_eq!(parse_price(&json!(" $2,35 ")), Some(2.35));
        assert_eq!(parse_price(&json!("$1,234.50")), Some(1234.5));
        assert_eq!(parse_price(&json!("n/a")), None);
        assert_eq!(parse_price(&Value::Null), None);
    }

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("2025-02-14T21:59:00"), Some(at(21, 59)));
        assert_eq!(parse_time("2025-02-14 22:00:00"), Some(at(22, 0)));
        assert_eq!(parse_time("2025-02-14T15:30:00Z"), Some(at(15, 30)));
        assert_eq!(parse_time("16:05"), Some(at(16, 5)));
        assert_eq!(parse_time("yesterday"), None);
    }

    #[test]
    fn test_end_of_day_prefers_session_close() {
        let series = vec![
            json!({"dateTime": "2025-02-14T21:58:00", "price": 0.4}),
            json!({"dateTime": "2025-02-14T22:00:00", "price": 0.1}),
            json!({"dateTime": "2025-02-14T22:05:00", "price": 0.2}),
        ];
        let result = derive_trade_result(&series, None, None);
        assert_eq!(result.end_of_day_price, Some(0.1));
    }

    #[test]
    fn test_end_of_day_falls_back_to_last_price() {
        let series = vec![
            json!({"time": "15:30", "value": "1,10"}),
            json!({"time": "20:00", "value": "0,80"}),
            json!({"time": "20:01"}),
        ];
        let result = derive_trade_result(&series, None, Some("link".into()));
        assert_eq!(result.end_of_day_price, Some(0.8));
        assert_eq!(result.api_link.as_deref(), Some("link"));
    }

    #[test]
    fn test_peak_is_lowest_after_open() {
        let series = vec![
            json!({"dateTime": "2025-02-14T15:30:00", "price": 0.05}),
            json!({"dateTime": "2025-02-14T17:00:00", "price": 0.9}),
            json!({"dateTime": "2025-02-14T18:15:00", "price": 0.3}),
            json!({"dateTime": "2025-02-14T19:00:00", "price": 0.3}),
            json!({"dateTime": "2025-02-14T22:00:00", "price": 0.6}),
        ];
        let result = derive_trade_result(&series, Some(at(16, 0)), None);
        assert_eq!(result.peak_price, Some(0.3));
        assert_eq!(result.peak_time.as_deref(), Some("18:15:00"));

        let whole_day = derive_trade_result(&series, None, None);
        assert_eq!(whole_day.peak_price, Some(0.05));
    }

    #[test]
    fn test_epoch_seconds_in_bern_time() {
        // 2025-02-14 15:00 UTC is 16:00 in Bern (winter time).
        assert_eq!(epoch_time(1_739_545_200.0), Some(at(16, 0)));
        // 2025-07-01 20:00 UTC is 22:00 in Bern (summer time).
        assert_eq!(epoch_time(1_751_400_000.0), Some(at(22, 0)));
        assert_eq!(epoch_time(f64::NAN), None);
    }

    #[test]
    fn test_peak_from_epoch_series() {
        let series = vec![
            json!({"dateTime": 1_739_541_600, "price": 0.1}),
            json!({"dateTime": 1_739_545_200, "price": 0.9}),
            json!({"dateTime": 1_739_548_800, "price": 0.3}),
        ];
        let whole_day = derive_trade_result(&series, None, None);
        assert_eq!(whole_day.peak_price, Some(0.1));
        assert_eq!(whole_day.peak_time.as_deref(), Some("15:00:00"));

        let result = derive_trade_result(&series, Some(at(16, 0)), None);
        assert_eq!(result.peak_price, Some(0.3));
        assert_eq!(result.peak_time.as_deref(), Some("17:00:00"));
        assert_eq!(result.end_of_day_price, Some(0.3));
    }

    #[test]
    fn test_end_of_day_at_epoch_session_close() {
        let series = vec![
            json!({"dateTime": 1_751_400_000.0, "price": "0,45"}),
            json!({"dateTime": 1_751_403_600.0, "price": "0,50"}),
        ];
        let result = derive_trade_result(&series, None, None);
        assert_eq!(result.end_of_day_price, Some(0.45));
    }

    #[test]
    fn test_empty_series() {
        let result = derive_trade_result(&[], Some(at(16, 0)), None);
        assert!(result.is_empty());
        assert_eq!(result.peak_time, None);
    }
}
