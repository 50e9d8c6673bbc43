// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Duration parsing for Go-style duration strings.
//!
//! Broker `relistDuration` values are written the way `time.Duration` prints them
//! (e.g. "15m", "1h30m", "15m0s", "500ms"). This module parses them into
//! `std::time::Duration`.

use std::time::Duration;
use thiserror::Error;

/// Why a duration string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("Duration string cannot be empty")]
    Empty,
    #[error("Duration must end with a unit (ns, us, ms, s, m or h)")]
    MissingUnit,
    #[error("Duration '{0}' has a unit without a value")]
    MissingValue(String),
    #[error("Duration value must be a positive integer")]
    InvalidValue,
    #[error("Unsupported duration unit '{0}'. Use ns, us, ms, s, m or h")]
    UnknownUnit(String),
    #[error("Duration value too large (overflow)")]
    Overflow,
    #[error("Duration '{0}' must be greater than zero")]
    Zero(String),
}

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_MINUTE: u64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: u64 = 60 * NANOS_PER_MINUTE;

fn unit_nanos(unit: &str) -> Option<u64> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(NANOS_PER_MINUTE),
        "h" => Some(NANOS_PER_HOUR),
        _ => None,
    }
}

/// Parse a Go-style duration string into a Rust `Duration`.
///
/// A duration is a sequence of `<integer><unit>` segments. Supported units are
/// `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. The bare string `"0"` is zero.
///
/// # Examples
///
/// ```
/// use svcat::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
/// assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_duration("15m0s").unwrap(), Duration::from_secs(900));
///
/// assert!(parse_duration("").is_err());
/// assert!(parse_duration("10").is_err());  // Missing unit
/// assert!(parse_duration("10x").is_err()); // Invalid unit
/// ```
///
/// # Errors
///
/// Returns an error if the format is invalid (missing unit, non-numeric value,
/// unknown unit) or the total overflows.
pub fn parse_duration(duration_str: &str) -> Result<Duration, DurationError> {
    if duration_str.is_empty() {
        return Err(DurationError::Empty);
    }
    if duration_str == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u64 = 0;
    let mut rest = duration_str;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or(DurationError::MissingUnit)?;
        if digits_end == 0 {
            return Err(DurationError::MissingValue(duration_str.to_string()));
        }
        let (value_str, tail) = rest.split_at(digits_end);
        let unit_end = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let value: u64 = value_str
            .parse()
            .map_err(|_| DurationError::InvalidValue)?;
        let nanos = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit(unit.to_string()))?;
        total = value
            .checked_mul(nanos)
            .and_then(|n| total.checked_add(n))
            .ok_or(DurationError::Overflow)?;
        rest = next;
    }

    Ok(Duration::from_nanos(total))
}

/// Parse a duration that must be strictly positive, as required for relist intervals.
///
/// # Errors
///
/// Returns an error if parsing fails or the duration is zero.
pub fn parse_positive_duration(duration_str: &str) -> Result<Duration, DurationError> {
    let duration = parse_duration(duration_str)?;
    if duration.is_zero() {
        return Err(DurationError::Zero(duration_str.to_string()));
    }
    Ok(duration)
}

#[cfg(test)]
#[path = "duration_tests.rs"]
mod duration_tests;
