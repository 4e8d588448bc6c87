//! Retry execution: exponential backoff with jitter, allow/deny error
//! matching, and cancellation-aware waits.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::engine::error::{ExecutionError, ExecutionErrorKind};

/// Configuration for one retry-wrapped operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of additional retries after the first try. `0` means
    /// no retry.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound any computed delay is capped to.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Patterns that must match for an error to be retried. Empty means "all
    /// errors are retryable" unless denied below. Each entry is matched, in
    /// order, as: an exact `ExecutionErrorKind` name, a `/regex/` wrapped in
    /// slashes, or else a case-insensitive substring of the error message.
    pub retryable_errors: Vec<String>,
    /// Patterns that, if matched, veto a retry even if `retryable_errors`
    /// would otherwise allow it.
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt number `attempt` (1-based: the delay awaited
    /// before attempt 2, 3, ...), including jitter, capped at `max_delay`.
    fn delay_for_attempt(&self, attempt: usize, rng: &mut StdRng) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as i32;
        let raw_millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let raw_millis = if raw_millis.is_finite() {
            raw_millis
        } else {
            self.max_delay.as_millis() as f64
        };
        // +/-25% jitter applied before the cap, so a jittered-up delay still
        // respects max_delay.
        let jitter_factor = rng.gen_range(0.75..=1.25);
        let jittered = (raw_millis * jitter_factor).max(0.0);
        let capped = jittered.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn matches_pattern(pattern: &str, kind: ExecutionErrorKind, message: &str) -> bool {
        if let Some(parsed_kind) = ExecutionErrorKind::from_pattern_name(pattern) {
            return parsed_kind == kind;
        }
        if let Some(body) = pattern.strip_prefix('/').and_then(|p| p.strip_suffix('/')) {
            return Regex::new(body).map(|re| re.is_match(message)).unwrap_or(false);
        }
        message.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Whether `error` should be retried under this config. Denylist entries
    /// take precedence over allowlist entries.
    pub fn is_retryable(&self, error: &ExecutionError) -> bool {
        let denied = self
            .non_retryable_errors
            .iter()
            .any(|p| Self::matches_pattern(p, error.kind, &error.message));
        if denied {
            return false;
        }
        if self.retryable_errors.is_empty() {
            return true;
        }
        self.retryable_errors
            .iter()
            .any(|p| Self::matches_pattern(p, error.kind, &error.message))
    }
}

/// All attempts were exhausted (or a non-retryable error was hit) without a
/// successful result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("retry exhausted after {attempts} attempt(s) over {total_duration:?}: {reason}")]
pub struct RetryExhaustedError {
    /// Why retrying stopped (`"max attempts reached"`, `"non-retryable
    /// error"`, or `"cancelled"`).
    pub reason: String,
    /// Total attempts made.
    pub attempts: usize,
    /// Every error observed, in attempt order.
    pub errors: Vec<ExecutionError>,
    /// Wall-clock time spent across all attempts and waits.
    pub total_duration: Duration,
}

impl RetryExhaustedError {
    /// The last error observed, if any attempt ran at all.
    pub fn last_error(&self) -> Option<&ExecutionError> {
        self.errors.last()
    }
}

/// Per-attempt record kept by [`RetryExecutor::execute_with_metrics`].
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Attempt number, starting at 1.
    pub attempt: usize,
    /// Delay awaited before this attempt (zero for the first).
    pub delay: Duration,
    /// Error observed on this attempt, if it failed.
    pub error: Option<ExecutionError>,
}

/// Outcome of a metrics-collecting retry run.
#[derive(Debug, Clone)]
pub struct RetryMetrics {
    /// Every attempt made, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Total wall-clock time, including waits.
    pub duration: Duration,
    /// Whether the operation eventually succeeded.
    pub succeeded: bool,
}

/// Executes a fallible async operation under a [`RetryConfig`], with
/// deterministic jitter when seeded for tests and cooperative cancellation
/// via a `watch<bool>` signal.
pub struct RetryExecutor {
    config: RetryConfig,
    rng: parking_lot::Mutex<StdRng>,
}

impl RetryExecutor {
    /// Build an executor with OS-seeded randomness.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: parking_lot::Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Build an executor with a fixed seed, for deterministic tests.
    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: parking_lot::Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Run `operation` until it succeeds, a non-retryable error is hit,
    /// attempts are exhausted, or `cancel` fires. `cancel` is polled before
    /// each attempt and during each backoff wait.
    pub async fn execute<T, F, Fut>(
        &self,
        mut cancel: watch::Receiver<bool>,
        mut operation: F,
    ) -> Result<T, RetryExhaustedError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExecutionError>>,
    {
        let started = std::time::Instant::now();
        let mut errors = Vec::new();
        let total_tries = self.config.max_attempts + 1;

        for attempt in 1..=total_tries {
            if *cancel.borrow() {
                return Err(RetryExhaustedError {
                    reason: "cancelled".to_string(),
                    attempts: attempt - 1,
                    errors,
                    total_duration: started.elapsed(),
                });
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retryable = self.config.is_retryable(&error);
                    errors.push(error);
                    if !retryable {
                        return Err(RetryExhaustedError {
                            reason: "non-retryable error".to_string(),
                            attempts: attempt,
                            errors,
                            total_duration: started.elapsed(),
                        });
                    }
                    if attempt == total_tries {
                        break;
                    }
                    let delay = {
                        let mut rng = self.rng.lock();
                        self.config.delay_for_attempt(attempt, &mut rng)
                    };
                    if wait_cancellable(delay, &mut cancel).await.is_err() {
                        return Err(RetryExhaustedError {
                            reason: "cancelled".to_string(),
                            attempts: attempt,
                            errors,
                            total_duration: started.elapsed(),
                        });
                    }
                }
            }
        }

        Err(RetryExhaustedError {
            reason: "max attempts reached".to_string(),
            attempts: total_tries,
            errors,
            total_duration: started.elapsed(),
        })
    }

    /// As [`Self::execute`], but also returns the full per-attempt metrics
    /// regardless of outcome.
    pub async fn execute_with_metrics<T, F, Fut>(
        &self,
        mut cancel: watch::Receiver<bool>,
        mut operation: F,
    ) -> (Option<T>, RetryMetrics)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExecutionError>>,
    {
        let started = std::time::Instant::now();
        let mut attempts = Vec::new();
        let total_tries = self.config.max_attempts + 1;

        for attempt in 1..=total_tries {
            if *cancel.borrow() {
                break;
            }
            let delay = if attempt == 1 {
                Duration::ZERO
            } else {
                let mut rng = self.rng.lock();
                self.config.delay_for_attempt(attempt - 1, &mut rng)
            };
            if attempt > 1 && wait_cancellable(delay, &mut cancel).await.is_err() {
                break;
            }

            match operation().await {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        delay,
                        error: None,
                    });
                    return (
                        Some(value),
                        RetryMetrics {
                            attempts,
                            duration: started.elapsed(),
                            succeeded: true,
                        },
                    );
                }
                Err(error) => {
                    let retryable = self.config.is_retryable(&error);
                    attempts.push(AttemptRecord {
                        attempt,
                        delay,
                        error: Some(error),
                    });
                    if !retryable {
                        break;
                    }
                }
            }
        }

        (
            None,
            RetryMetrics {
                attempts,
                duration: started.elapsed(),
                succeeded: false,
            },
        )
    }
}

async fn wait_cancellable(delay: Duration, cancel: &mut watch::Receiver<bool>) -> Result<(), ()> {
    if *cancel.borrow() {
        return Err(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        result = cancel.changed() => {
            match result {
                Ok(()) if *cancel.borrow() => Err(()),
                _ => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let executor = RetryExecutor::with_seed(RetryConfig::default(), 1);
        let result = executor
            .execute(no_cancel(), || async { Ok::<_, ExecutionError>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn retries_recoverable_errors_until_success() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        let executor = RetryExecutor::with_seed(config, 7);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = executor
            .execute(no_cancel(), move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ExecutionError::connection_error("srv", "down"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let config = RetryConfig {
            max_attempts: 5,
            non_retryable_errors: vec!["validation".to_string()],
            ..Default::default()
        };
        let executor = RetryExecutor::with_seed(config, 2);
        let result = executor
            .execute(no_cancel(), || async {
                Err::<i32, _>(ExecutionError::validation_error("bad"))
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.reason, "non-retryable error");
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let config = RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..Default::default()
        };
        let executor = RetryExecutor::with_seed(config, 3);
        let result = executor
            .execute(no_cancel(), || async {
                Err::<i32, _>(ExecutionError::connection_error("srv", "down"))
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.reason, "max attempts reached");
        assert_eq!(err.errors.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let config = RetryConfig {
            max_attempts: 5,
            ..Default::default()
        };
        let executor = RetryExecutor::with_seed(config, 4);
        let result = executor
            .execute(rx, || async { Err::<i32, _>(ExecutionError::connection_error("srv", "down")) })
            .await;
        assert_eq!(result.unwrap_err().reason, "cancelled");
    }

    #[test]
    fn delay_is_capped_at_max_delay_even_with_upward_jitter() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1100),
            backoff_multiplier: 4.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(99);
        for attempt in 1..=5 {
            let delay = config.delay_for_attempt(attempt, &mut rng);
            assert!(delay <= config.max_delay);
        }
    }

    #[test]
    fn pattern_matching_prefers_kind_name_then_regex_then_substring() {
        let err = ExecutionError::new(ExecutionErrorKind::Timeout, "deadline exceeded for fetch");
        assert!(RetryConfig::matches_pattern("timeout", err.kind, &err.message));
        assert!(RetryConfig::matches_pattern("/deadline.*fetch/", err.kind, &err.message));
        assert!(RetryConfig::matches_pattern("EXCEEDED", err.kind, &err.message));
        assert!(!RetryConfig::matches_pattern("nope", err.kind, &err.message));
    }

    proptest::proptest! {
        /// However attempt count, initial delay, multiplier, or seed vary,
        /// `delay_for_attempt` never exceeds `max_delay` and never goes
        /// negative.
        #[test]
        fn delay_for_attempt_stays_within_bounds(
            attempt in 1usize..20,
            initial_ms in 1u64..2_000,
            max_ms in 1u64..5_000,
            multiplier in 0.1f64..5.0,
            seed in proptest::prelude::any::<u64>(),
        ) {
            let config = RetryConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
                ..Default::default()
            };
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = config.delay_for_attempt(attempt, &mut rng);
            proptest::prop_assert!(delay <= config.max_delay);
            proptest::prop_assert!(delay.as_millis() <= u128::from(max_ms));
        }
    }
}
