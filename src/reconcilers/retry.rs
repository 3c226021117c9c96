// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Retry and backoff policies for the reconcile loop.
//!
//! Two distinct policies live here:
//!
//! - **In-reconcile API retry**: transient backing-API errors inside one
//!   reconcile are retried with short exponential backoff, failing fast on
//!   permanent errors.
//! - **Queue-level error backoff**: a failed reconcile is requeued with
//!   per-key exponential backoff (base 1s, cap 60s); a successful reconcile
//!   resets the key.

use crate::constants::{ERROR_BACKOFF_BASE_SECS, ERROR_BACKOFF_CAP_SECS};
use crate::errors::{EngineError, Result};
use rand::RngExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Maximum total time to spend retrying inside one reconcile (30 seconds)
const MAX_ELAPSED_TIME_SECS: u64 = 30;

/// Initial retry interval (100ms)
const INITIAL_INTERVAL_MILLIS: u64 = 100;

/// Maximum interval between in-reconcile retries (5 seconds)
const MAX_INTERVAL_SECS: u64 = 5;

/// Backoff multiplier (exponential growth factor)
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Randomization factor to prevent thundering herd (±10%)
const RANDOMIZATION_FACTOR: f64 = 0.1;

/// Simple exponential backoff with jitter.
pub struct ExponentialBackoff {
    current_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Duration,
    multiplier: f64,
    randomization_factor: f64,
    start_time: Instant,
}

impl ExponentialBackoff {
    fn new() -> Self {
        Self {
            current_interval: Duration::from_millis(INITIAL_INTERVAL_MILLIS),
            max_interval: Duration::from_secs(MAX_INTERVAL_SECS),
            max_elapsed_time: Duration::from_secs(MAX_ELAPSED_TIME_SECS),
            multiplier: BACKOFF_MULTIPLIER,
            randomization_factor: RANDOMIZATION_FACTOR,
            start_time: Instant::now(),
        }
    }

    /// Get the next backoff interval, or None when the elapsed budget is
    /// spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.start_time.elapsed() >= self.max_elapsed_time {
            return None;
        }

        let interval = self.current_interval;
        let jittered = self.apply_jitter(interval);

        let next = interval.as_secs_f64() * self.multiplier;
        self.current_interval = Duration::from_secs_f64(next).min(self.max_interval);

        Some(jittered)
    }

    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.randomization_factor == 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor;
        let mut rng = rand::rng();
        let jittered = rng.random_range((secs - delta)..=(secs + delta));

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Retry an engine operation through transient backing-API failures.
///
/// Only [`EngineError::Transient`] is retried; validation, dependency, and
/// contract failures surface immediately and are handled by the queue-level
/// backoff instead.
///
/// # Errors
///
/// Returns the last error when the backoff budget is exhausted, or the
/// first non-transient error immediately.
pub async fn retry_transient<T, F, Fut>(mut operation: F, operation_name: &str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                if !matches!(e, EngineError::Transient { .. }) {
                    return Err(e);
                }
                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            operation = operation_name,
                            attempt = attempt,
                            retry_after = ?duration,
                            error = %e,
                            "Transient error, will retry"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => {
                        error!(
                            operation = operation_name,
                            attempt = attempt,
                            error = %e,
                            "Retry budget exhausted, giving up"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Per-key exponential backoff for requeueing failed reconciles.
///
/// Each consecutive failure of a key doubles its next delay from the base
/// (1s) up to the cap (60s); a success resets the key. Keys are plain
/// strings so the tracker is shared across dynamically-typed controllers.
#[derive(Default)]
pub struct RequeueTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl RequeueTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn backoff(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().expect("tracker poisoned");
        let count = failures.entry(key.to_string()).or_insert(0);
        *count += 1;

        let exp = count.saturating_sub(1).min(31);
        let delay = ERROR_BACKOFF_BASE_SECS
            .saturating_mul(1u64 << exp)
            .min(ERROR_BACKOFF_CAP_SECS);
        Duration::from_secs(delay)
    }

    /// Reset a key after a successful reconcile.
    pub fn reset(&self, key: &str) {
        self.failures.lock().expect("tracker poisoned").remove(key);
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;
