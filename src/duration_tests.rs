// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for duration parsing (Go-style duration format)

#[cfg(test)]
mod tests {
    use super::super::{parse_duration, parse_positive_duration, DurationError};
    use std::time::Duration;

    // ========================================================================
    // Valid Duration Parsing Tests
    // ========================================================================

    #[test]
    fn test_parse_single_units() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("7us").unwrap(), Duration::from_micros(7));
        assert_eq!(parse_duration("7µs").unwrap(), Duration::from_micros(7));
        assert_eq!(parse_duration("9ns").unwrap(), Duration::from_nanos(9));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(5400),
            "1h30m should be 90 minutes"
        );
        assert_eq!(
            parse_duration("15m0s").unwrap(),
            Duration::from_secs(900),
            "the form Go prints for 15 minutes"
        );
        assert_eq!(
            parse_duration("1m1s500ms").unwrap(),
            Duration::from_millis(61_500)
        );
    }

    #[test]
    fn test_parse_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    // ========================================================================
    // Invalid Duration Tests
    // ========================================================================

    #[test]
    fn test_parse_invalid() {
        assert!(parse_duration("").is_err(), "empty string");
        assert!(parse_duration("10").is_err(), "missing unit");
        assert!(parse_duration("10x").is_err(), "unknown unit");
        assert!(parse_duration("h").is_err(), "unit without value");
        assert!(parse_duration("-5m").is_err(), "negative");
    }

    #[test]
    fn test_parse_overflow() {
        assert!(parse_duration("99999999999999999999h").is_err());
        assert!(parse_duration("9000000000h").is_err());
    }

    #[test]
    fn test_positive_duration_rejects_zero() {
        assert!(parse_positive_duration("0s").is_err());
        assert_eq!(
            parse_positive_duration("10m").unwrap(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert_eq!(parse_duration("10"), Err(DurationError::MissingUnit));
        assert_eq!(
            parse_duration("10x"),
            Err(DurationError::UnknownUnit("x".to_string()))
        );
        assert_eq!(parse_duration("9000000000h"), Err(DurationError::Overflow));
        assert_eq!(
            parse_positive_duration("0"),
            Err(DurationError::Zero("0".to_string()))
        );
    }
}
