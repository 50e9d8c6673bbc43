// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `retry.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        default_poll_backoff, delay_for_attempt, orphan_mitigation_delay, poll_backoff,
        retry_store_call, store_backoff, ExponentialBackoff,
    };
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test that the poll backoff has the documented bounds
    #[test]
    fn test_poll_backoff_configuration() {
        let backoff = default_poll_backoff();

        assert_eq!(backoff.initial_interval, Duration::from_secs(1));
        assert_eq!(backoff.max_interval, Duration::from_secs(3600));
        assert_eq!(backoff.max_elapsed_time, None, "Polling never gives up");

        #[allow(clippy::float_cmp)]
        {
            assert_eq!(backoff.multiplier, 2.0);
            assert_eq!(backoff.randomization_factor, 0.1);
        }
    }

    /// Test that jittered intervals stay within ±10% and grow to the cap
    #[test]
    fn test_poll_backoff_progression() {
        let mut backoff = poll_backoff(Duration::from_secs(1), Duration::from_secs(8));
        let expected = [1.0, 2.0, 4.0, 8.0, 8.0, 8.0];
        for secs in expected {
            let next = backoff.next_backoff().unwrap().as_secs_f64();
            assert!(
                next >= secs * 0.9 && next <= secs * 1.1,
                "expected ~{secs}s, got {next}s"
            );
        }
    }

    /// Test that reset returns to the initial interval
    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            None,
            2.0,
            0.0,
        );
        backoff.next_backoff();
        backoff.next_backoff();
        assert_eq!(backoff.current_interval, Duration::from_millis(400));
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    }

    /// Test that a max interval below the initial interval is raised to it
    #[test]
    fn test_poll_backoff_max_below_initial() {
        let backoff = poll_backoff(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.max_interval, Duration::from_secs(5));
    }

    /// Test the deterministic delay schedule
    #[test]
    fn test_delay_for_attempt() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(600);
        assert_eq!(delay_for_attempt(0, initial, max), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(1, initial, max), Duration::from_millis(200));
        assert_eq!(delay_for_attempt(4, initial, max), Duration::from_millis(1600));
        assert_eq!(delay_for_attempt(20, initial, max), max);
        // Overflowing exponents saturate.
        assert_eq!(delay_for_attempt(64, initial, max), max);
    }

    #[test]
    fn test_orphan_mitigation_delay() {
        assert_eq!(orphan_mitigation_delay(0), Duration::from_secs(1));
        assert_eq!(orphan_mitigation_delay(3), Duration::from_secs(8));
        assert_eq!(orphan_mitigation_delay(30), Duration::from_secs(300));
    }

    /// Test that store lookups give up quickly
    #[test]
    fn test_store_backoff_configuration() {
        let backoff = store_backoff();
        assert_eq!(backoff.initial_interval, Duration::from_millis(50));
        assert_eq!(backoff.max_elapsed_time, Some(Duration::from_secs(5)));
    }

    /// Test that transient errors are retried until success
    #[tokio::test]
    async fn test_retry_store_call_retries_transient() {
        let calls = AtomicUsize::new(0);
        let result = retry_store_call(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("connection reset".to_string()))
                } else {
                    Ok(42)
                }
            },
            "get thing",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Test that not-found fails immediately
    #[tokio::test]
    async fn test_retry_store_call_fails_fast() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StoreError> = retry_store_call(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NotFound {
                    kind: "ServiceInstance".to_string(),
                    key: "ns/a".to_string(),
                })
            },
            "get instance",
        )
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
