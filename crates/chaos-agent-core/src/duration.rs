//! Human duration strings such as `30s`, `1h30m`, `250ms` or `-10m`.

use std::time::Duration;

use crate::ExperimentError;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// A signed offset split into whole seconds and a nanosecond remainder.
///
/// Both parts carry the same sign and `nsec` stays within `(-1e9, 1e9)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct SignedDuration {
    pub sec: i64,
    pub nsec: i64,
}

impl SignedDuration {
    #[must_use]
    pub fn from_nanos(total: i128) -> Option<Self> {
        let sec = i64::try_from(total / NANOS_PER_SEC).ok()?;
        let nsec = i64::try_from(total % NANOS_PER_SEC).ok()?;
        Some(Self { sec, nsec })
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

fn unit_nanos(unit: &str) -> Option<i128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(60 * NANOS_PER_SEC),
        "h" => Some(3_600 * NANOS_PER_SEC),
        _ => None,
    }
}

fn parse_nanos(input: &str) -> Result<i128, ExperimentError> {
    let bad = |reason: &str| ExperimentError::BadConfig(format!("invalid duration {input:?}: {reason}"));

    let trimmed = input.trim();
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if rest.is_empty() {
        return Err(bad("empty"));
    }
    if rest == "0" {
        return Ok(0);
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| bad("missing unit"))?;
        if number_end == 0 {
            return Err(bad("expected a number"));
        }
        let (number, tail) = rest.split_at(number_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale = unit_nanos(unit).ok_or_else(|| bad("unknown unit"))?;

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(bad("expected a number"));
        }
        let whole_value: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| bad("number out of range"))?
        };
        let mut value = whole_value
            .checked_mul(scale)
            .ok_or_else(|| bad("number out of range"))?;
        let mut divisor: i128 = 1;
        for digit in fraction.chars() {
            let digit = i128::from(digit.to_digit(10).ok_or_else(|| bad("bad fraction"))?);
            divisor = divisor.saturating_mul(10);
            value += digit * scale / divisor;
        }

        total = total
            .checked_add(value)
            .ok_or_else(|| bad("number out of range"))?;
        rest = tail;
    }

    Ok(if negative { -total } else { total })
}

/// Parses a non-negative duration.
///
/// # Errors
/// Returns [`ExperimentError::BadConfig`] for malformed or negative input.
pub fn parse_duration(input: &str) -> Result<Duration, ExperimentError> {
    let nanos = parse_nanos(input)?;
    if nanos < 0 {
        return Err(ExperimentError::BadConfig(format!(
            "duration {input:?} MUST NOT be negative"
        )));
    }
    let nanos = u64::try_from(nanos).map_err(|_| {
        ExperimentError::BadConfig(format!("duration {input:?} is out of range"))
    })?;
    Ok(Duration::from_nanos(nanos))
}

/// Parses a possibly negative offset.
///
/// # Errors
/// Returns [`ExperimentError::BadConfig`] for malformed input.
pub fn parse_signed_duration(input: &str) -> Result<SignedDuration, ExperimentError> {
    let nanos = parse_nanos(input)?;
    SignedDuration::from_nanos(nanos)
        .ok_or_else(|| ExperimentError::BadConfig(format!("offset {input:?} is out of range")))
}

/// Renders a duration in the largest units that divide it, e.g. `1m30s`.
#[must_use]
pub fn format_duration(value: Duration) -> String {
    let mut nanos = value.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, scale) in [
        ("h", 3_600_000_000_000_u128),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
        ("ns", 1),
    ] {
        if nanos >= scale {
            out.push_str(&format!("{}{unit}", nanos / scale));
            nanos %= scale;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn parses_compound_units() {
        assert_eq!(must_ok(parse_duration("30s")), Duration::from_secs(30));
        assert_eq!(must_ok(parse_duration("1h30m")), Duration::from_secs(5_400));
        assert_eq!(must_ok(parse_duration("250ms")), Duration::from_millis(250));
        assert_eq!(must_ok(parse_duration("1.5s")), Duration::from_millis(1_500));
        assert_eq!(must_ok(parse_duration("0")), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "10", "s", "5x", "-3s", "1..s"] {
            assert!(parse_duration(input).is_err(), "{input} should fail");
        }
    }

    #[test]
    fn signed_offsets_share_sign() {
        let offset = must_ok(parse_signed_duration("-10m30.5s"));
        assert_eq!(offset.sec, -630);
        assert_eq!(offset.nsec, -500_000_000);

        let offset = must_ok(parse_signed_duration("2s1ns"));
        assert_eq!(offset, SignedDuration { sec: 2, nsec: 1 });
        assert!(must_ok(parse_signed_duration("0")).is_zero());
    }

    #[test]
    fn format_picks_largest_units() {
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1_250)), "1s250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
