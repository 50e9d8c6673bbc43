// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Exponential backoff shared by the poller, orphan mitigation and store lookups.
//!
//! Broker calls are never retried here: a failed OSB call ends the reconcile pass
//! and the work queue decides when to try again. Store reads made outside a
//! reconcile pass (admission review) use [`retry_store_call`], which retries
//! transient [`StoreError`]s and fails fast on everything else.

use crate::constants::{
    DEFAULT_POLL_INITIAL_SECS, DEFAULT_POLL_MAX_SECS, ORPHAN_MITIGATION_INITIAL_DELAY_SECS,
    ORPHAN_MITIGATION_MAX_DELAY_SECS, POLL_RANDOMIZATION_FACTOR,
};
use crate::store::StoreError;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Backoff multiplier (exponential growth factor)
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Store lookup initial interval (50ms)
const STORE_INITIAL_INTERVAL_MILLIS: u64 = 50;

/// Store lookup maximum interval (1 second)
const STORE_MAX_INTERVAL_SECS: u64 = 1;

/// Store lookup maximum elapsed time (5 seconds), well inside an admission timeout
const STORE_MAX_ELAPSED_TIME_SECS: u64 = 5;

/// Store lookup randomization factor (±10%)
const STORE_RANDOMIZATION_FACTOR: f64 = 0.1;

/// Simple exponential backoff implementation.
///
/// Provides exponential backoff with randomization (jitter) to prevent thundering herd.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// Current interval duration
    pub current_interval: Duration,
    /// Initial interval duration, restored by [`ExponentialBackoff::reset`]
    pub initial_interval: Duration,
    /// Maximum interval duration
    pub max_interval: Duration,
    /// Maximum total elapsed time
    pub max_elapsed_time: Option<Duration>,
    /// Backoff multiplier (typically 2.0 for doubling)
    pub multiplier: f64,
    /// Randomization factor (e.g., 0.1 for ±10%)
    pub randomization_factor: f64,
    /// Start time for tracking total elapsed time
    start_time: Instant,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with specified parameters.
    #[must_use]
    pub fn new(
        initial_interval: Duration,
        max_interval: Duration,
        max_elapsed_time: Option<Duration>,
        multiplier: f64,
        randomization_factor: f64,
    ) -> Self {
        Self {
            current_interval: initial_interval,
            initial_interval,
            max_interval,
            max_elapsed_time,
            multiplier,
            randomization_factor,
            start_time: Instant::now(),
        }
    }

    /// Get the next backoff interval, or None if max elapsed time exceeded.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max_elapsed) = self.max_elapsed_time {
            if self.start_time.elapsed() >= max_elapsed {
                return None;
            }
        }

        let interval = self.current_interval;
        let jittered = self.apply_jitter(interval);

        let next = interval.as_secs_f64() * self.multiplier;
        self.current_interval = Duration::from_secs_f64(next).min(self.max_interval);

        Some(jittered)
    }

    /// Start over from the initial interval.
    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.start_time = Instant::now();
    }

    /// Apply randomization (jitter) to an interval.
    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.randomization_factor == 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor;
        // random::<f64>() is uniform in [0, 1)
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * delta;

        Duration::from_secs_f64((secs + offset).max(0.0))
    }
}

/// Backoff for `last_operation` polling.
///
/// Starts at `initial`, doubles up to `max`, jitter ±10%, never gives up.
#[must_use]
pub fn poll_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff::new(
        initial,
        max.max(initial),
        None,
        BACKOFF_MULTIPLIER,
        POLL_RANDOMIZATION_FACTOR,
    )
}

/// Poll backoff with the default bounds (1 second to 1 hour).
#[must_use]
pub fn default_poll_backoff() -> ExponentialBackoff {
    poll_backoff(
        Duration::from_secs(DEFAULT_POLL_INITIAL_SECS),
        Duration::from_secs(DEFAULT_POLL_MAX_SECS),
    )
}

/// Deterministic delay before retry number `attempt` (0 based): `initial * 2^attempt`,
/// capped at `max`.
#[must_use]
pub fn delay_for_attempt(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    initial.checked_mul(factor).unwrap_or(max).min(max)
}

/// Delay before orphan-mitigation deprovision attempt `attempt`.
#[must_use]
pub fn orphan_mitigation_delay(attempt: u32) -> Duration {
    delay_for_attempt(
        attempt,
        Duration::from_secs(ORPHAN_MITIGATION_INITIAL_DELAY_SECS),
        Duration::from_secs(ORPHAN_MITIGATION_MAX_DELAY_SECS),
    )
}

/// Backoff for store lookups made outside a reconcile pass.
#[must_use]
pub fn store_backoff() -> ExponentialBackoff {
    ExponentialBackoff::new(
        Duration::from_millis(STORE_INITIAL_INTERVAL_MILLIS),
        Duration::from_secs(STORE_MAX_INTERVAL_SECS),
        Some(Duration::from_secs(STORE_MAX_ELAPSED_TIME_SECS)),
        BACKOFF_MULTIPLIER,
        STORE_RANDOMIZATION_FACTOR,
    )
}

/// Retry a store call with exponential backoff.
///
/// Retries [`StoreError::Transient`] (network trouble, 429, 5xx) and fails
/// immediately on every other error, including conflicts.
///
/// # Errors
///
/// Returns the last error once it is non-retryable or the backoff is exhausted.
pub async fn retry_store_call<T, F, Fut>(mut operation: F, operation_name: &str) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut backoff = store_backoff();
    let start_time = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        elapsed = ?start_time.elapsed(),
                        "Store call succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                if !matches!(e, StoreError::Transient(_)) {
                    return Err(e);
                }

                if let Some(duration) = backoff.next_backoff() {
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        retry_after = ?duration,
                        error = %e,
                        "Transient store error, will retry"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    error!(
                        operation = operation_name,
                        attempt = attempt,
                        elapsed = ?start_time.elapsed(),
                        error = %e,
                        "Backoff exhausted, giving up"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;
