//! Relative-time resolution for entry expiry
//!
//! Every `set()` style call takes an [`Expiry`] and resolves it against the
//! current time before reaching a driver.

use crate::errors::{CacheError, Result};
use chrono::{DateTime, Utc};

/// Caller-facing expiry input
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Expiry {
    /// Never expires
    #[default]
    Never,
    /// Expires at an absolute time
    At(DateTime<Utc>),
    /// Expires after a duration from now
    After(chrono::Duration),
    /// Expires after this many milliseconds from now
    Millis(f64),
    /// Human readable relative duration such as `"30s"`, `"1h"` or `"2 seconds"`
    Relative(String),
}

impl From<DateTime<Utc>> for Expiry {
    fn from(value: DateTime<Utc>) -> Self {
        Expiry::At(value)
    }
}

impl From<chrono::Duration> for Expiry {
    fn from(value: chrono::Duration) -> Self {
        Expiry::After(value)
    }
}

/// Durations beyond chrono's range are kept as milliseconds and rejected on resolve
impl From<std::time::Duration> for Expiry {
    fn from(value: std::time::Duration) -> Self {
        match chrono::Duration::from_std(value) {
            Ok(duration) => Expiry::After(duration),
            Err(_) => Expiry::Millis(value.as_secs_f64() * 1000.0),
        }
    }
}

impl From<u64> for Expiry {
    fn from(value: u64) -> Self {
        Expiry::Millis(value as f64)
    }
}

impl From<i64> for Expiry {
    fn from(value: i64) -> Self {
        Expiry::Millis(value as f64)
    }
}

impl From<u32> for Expiry {
    fn from(value: u32) -> Self {
        Expiry::Millis(f64::from(value))
    }
}

impl From<i32> for Expiry {
    fn from(value: i32) -> Self {
        Expiry::Millis(f64::from(value))
    }
}

impl From<f64> for Expiry {
    fn from(value: f64) -> Self {
        Expiry::Millis(value)
    }
}

impl From<&str> for Expiry {
    fn from(value: &str) -> Self {
        Expiry::Relative(value.to_string())
    }
}

impl From<String> for Expiry {
    fn from(value: String) -> Self {
        Expiry::Relative(value)
    }
}

impl<T: Into<Expiry>> From<Option<T>> for Expiry {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Expiry::Never,
        }
    }
}

impl Expiry {
    /// Resolve against the current wall clock
    pub fn resolve(&self) -> Result<Option<DateTime<Utc>>> {
        resolve_expiry(self, Utc::now())
    }
}

/// Resolve an expiry input into an absolute timestamp relative to `now`
///
/// Non-finite millisecond values and unparseable strings are errors rather
/// than silently meaning "never".
pub fn resolve_expiry(input: &Expiry, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match input {
        Expiry::Never => Ok(None),
        Expiry::At(at) => Ok(Some(*at)),
        Expiry::After(duration) => offset(now, *duration, || duration.to_string()).map(Some),
        Expiry::Millis(ms) => {
            let millis = finite_millis(*ms, || ms.to_string())?;
            offset_millis(now, millis, || ms.to_string()).map(Some)
        }
        Expiry::Relative(text) => {
            let millis = parse_relative_ms(text)?;
            offset_millis(now, millis, || text.clone()).map(Some)
        }
    }
}

fn finite_millis(ms: f64, value: impl Fn() -> String) -> Result<i64> {
    if !ms.is_finite() {
        return Err(CacheError::invalid_expiry(
            value(),
            "millisecond offset must be finite",
        ));
    }
    let ms = ms.round();
    // i64::MAX as f64 rounds up, so the bound is exclusive
    if ms >= i64::MAX as f64 || ms <= i64::MIN as f64 {
        return Err(CacheError::invalid_expiry(value(), "offset out of range"));
    }
    Ok(ms as i64)
}

fn offset_millis(now: DateTime<Utc>, ms: i64, value: impl Fn() -> String) -> Result<DateTime<Utc>> {
    let delta = chrono::TimeDelta::try_milliseconds(ms)
        .ok_or_else(|| CacheError::invalid_expiry(value(), "offset out of range"))?;
    offset(now, delta, value)
}

fn offset(
    now: DateTime<Utc>,
    delta: chrono::TimeDelta,
    value: impl Fn() -> String,
) -> Result<DateTime<Utc>> {
    now.checked_add_signed(delta)
        .ok_or_else(|| CacheError::invalid_expiry(value(), "expiry out of range"))
}

/// Parse a relative duration string into milliseconds
///
/// Accepts one or more `<number><unit>` groups with optional whitespace, e.g.
/// `"100ms"`, `"3s"`, `"2 seconds"`, `"1h30m"`, `"1.5 days"`.
/// A bare number is taken as milliseconds.
pub fn parse_relative_ms(text: &str) -> Result<i64> {
    let s = text.trim();
    if s.is_empty() {
        return Err(CacheError::invalid_expiry(text, "empty duration"));
    }

    if let Ok(bare) = s.parse::<f64>() {
        if bare.is_finite() {
            return finite_millis(bare, || text.to_string());
        }
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        // Find where the number ends and unit begins
        let num_end = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (num_str, after) = rest.split_at(num_end);
        let num: f64 = num_str
            .parse()
            .map_err(|_| CacheError::invalid_expiry(text, format!("expected a number at '{rest}'")))?;

        let after = after.trim_start();
        let unit_end = after
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphabetic())
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        let (unit, remainder) = after.split_at(unit_end);

        let multiplier = unit_multiplier(unit)
            .ok_or_else(|| CacheError::invalid_expiry(text, format!("unknown unit '{unit}'")))?;
        total += num * multiplier;

        rest = remainder.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
    }

    finite_millis(total, || text.to_string())
}

fn unit_multiplier(unit: &str) -> Option<f64> {
    let ms = match unit.to_ascii_lowercase().as_str() {
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => 1.0,
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0 * 1000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60.0 * 60.0 * 1000.0,
        "d" | "day" | "days" => 24.0 * 60.0 * 60.0 * 1000.0,
        "w" | "wk" | "wks" | "week" | "weeks" => 7.0 * 24.0 * 60.0 * 60.0 * 1000.0,
        _ => return None,
    };
    Some(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_parse_relative_units() {
        assert_eq!(parse_relative_ms("100ms").unwrap(), 100);
        assert_eq!(parse_relative_ms("3s").unwrap(), 3_000);
        assert_eq!(parse_relative_ms("2 seconds").unwrap(), 2_000);
        assert_eq!(parse_relative_ms("5m").unwrap(), 300_000);
        assert_eq!(parse_relative_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_relative_ms("6h").unwrap(), 21_600_000);
        assert_eq!(parse_relative_ms("1d").unwrap(), 86_400_000);
        assert_eq!(parse_relative_ms("1h30m").unwrap(), 5_400_000);
        assert_eq!(parse_relative_ms("1.5 days").unwrap(), 129_600_000);
        assert_eq!(parse_relative_ms("3000").unwrap(), 3_000);
    }

    #[test]
    fn test_parse_relative_rejects_garbage() {
        assert!(parse_relative_ms("").is_err());
        assert!(parse_relative_ms("soon").is_err());
        assert!(parse_relative_ms("10 fortnights").is_err());
    }

    #[test]
    fn test_resolve_variants() {
        let now = fixed_now();
        assert_eq!(resolve_expiry(&Expiry::Never, now).unwrap(), None);
        assert_eq!(resolve_expiry(&Expiry::At(now), now).unwrap(), Some(now));
        assert_eq!(
            resolve_expiry(&Expiry::from(100u64), now).unwrap(),
            Some(now + chrono::Duration::milliseconds(100))
        );
        assert_eq!(
            resolve_expiry(&Expiry::from("3s"), now).unwrap(),
            Some(now + chrono::Duration::seconds(3))
        );
        assert_eq!(
            resolve_expiry(&Expiry::from(std::time::Duration::from_secs(60)), now).unwrap(),
            Some(now + chrono::Duration::minutes(1))
        );
        assert_eq!(
            resolve_expiry(&Expiry::from(None::<&str>), now).unwrap(),
            None
        );
    }

    #[test]
    fn test_resolve_rejects_non_finite() {
        let err = resolve_expiry(&Expiry::Millis(f64::NAN), fixed_now()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidExpiry { .. }));
        assert!(resolve_expiry(&Expiry::Millis(f64::INFINITY), fixed_now()).is_err());
    }

    #[test]
    fn test_resolve_rejects_out_of_range_offsets() {
        let now = fixed_now();
        for input in [
            Expiry::from(u64::MAX),
            Expiry::from(i64::MAX),
            Expiry::Millis(1e300),
            Expiry::from("99999999999 weeks"),
            Expiry::from("1e300"),
            Expiry::from(std::time::Duration::from_secs(u64::MAX)),
            Expiry::After(chrono::TimeDelta::MAX),
        ] {
            let err = resolve_expiry(&input, now).unwrap_err();
            assert!(
                matches!(err, CacheError::InvalidExpiry { .. }),
                "{input:?} gave {err:?}"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_seconds_scale_to_millis(n in 0u32..100_000) {
            prop_assert_eq!(parse_relative_ms(&format!("{n}s")).unwrap(), i64::from(n) * 1000);
            prop_assert_eq!(parse_relative_ms(&format!("{n} seconds")).unwrap(), i64::from(n) * 1000);
        }

        #[test]
        fn prop_millis_resolve_forward(ms in 0u32..10_000_000) {
            let now = fixed_now();
            let resolved = resolve_expiry(&Expiry::from(ms), now).unwrap().unwrap();
            prop_assert_eq!((resolved - now).num_milliseconds(), i64::from(ms));
        }
    }
}
