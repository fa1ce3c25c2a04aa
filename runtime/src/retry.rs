//! Bounded retry with exponential backoff for transient store failures.
//!
//! Only errors for which [`QueueError::is_retryable`] holds are retried.
//! Caller errors (unknown queue, invalid settings) fail on the first attempt.
//!
//! # Example
//!
//! ```rust
//! use waiting_room_runtime::retry::{RetryPolicy, retry_transient};
//! use std::time::Duration;
//!
//! # async fn example() -> waiting_room_core::Result<()> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_secs(2))
//!     .build();
//!
//! let value = retry_transient(&policy, "record_grant", || async {
//!     Ok::<_, waiting_room_core::QueueError>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use waiting_room_core::{QueueError, Result};

use crate::metrics::RetryMetrics;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 50ms
/// - `max_delay`: 2 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: on
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for exponential backoff.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: None,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::builder().max_retries(0).build()
    }

    /// Backoff delay for a given 0-based retry attempt, before jitter.
    ///
    /// `initial_delay * multiplier ^ attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Upper bound on the total time spent sleeping between attempts.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }

    fn sleep_for_attempt(&self, attempt: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter { jittered(delay) } else { delay }
    }
}

/// Pick a random duration in `[delay / 2, delay]`.
pub(crate) fn jittered(delay: Duration) -> Duration {
    let half = delay / 2;
    let spread = u64::try_from((delay - half).as_micros()).unwrap_or(u64::MAX);
    half + Duration::from_micros(rand::thread_rng().gen_range(0..=spread))
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(50)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(2)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter.unwrap_or(true),
        }
    }
}

/// Retry an async operation while it fails with a retryable error.
///
/// `operation` names the call in logs and in the
/// `waiting_room_retry_attempts_total` counter.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once
/// `policy.max_retries` retries are exhausted.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &'static str,
    call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_predicate(policy, operation, call, QueueError::is_retryable).await
}

/// Retry an async operation, deciding per error whether to try again.
///
/// # Errors
///
/// Returns the first error rejected by `is_retryable`, or the last error
/// once `policy.max_retries` retries are exhausted.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
    is_retryable: P,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(operation, attempt, "Operation succeeded after retry");
                    RetryMetrics::record_outcome(operation, "recovered");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(operation, error = %err, "Error is not retryable");
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    tracing::error!(
                        operation,
                        attempt,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    RetryMetrics::record_outcome(operation, "exhausted");
                    return Err(err);
                }

                let delay = policy.sleep_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                RetryMetrics::record_attempt(operation);

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .jitter(false)
            .build()
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(500))
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(80))
            .build();

        for _ in 0..100 {
            let delay = policy.sleep_for_attempt(0);
            assert!(delay >= Duration::from_millis(40));
            assert!(delay <= Duration::from_millis(80));
        }
    }

    #[test]
    fn test_total_backoff_sums_capped_delays() {
        let policy = RetryPolicy::builder()
            .max_retries(3)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(250))
            .build();

        assert_eq!(policy.total_backoff(), Duration::from_millis(550));
        assert_eq!(RetryPolicy::none().total_backoff(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&counter);

        let result = retry_transient(&fast_policy(3), "test", || {
            let c = Arc::clone(&calls);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueueError::Database("connection reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&counter);

        let result: Result<()> = retry_transient(&fast_policy(2), "test", || {
            let c = Arc::clone(&calls);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::Database(format!("attempt {attempt}")))
            }
        })
        .await;

        assert_eq!(result, Err(QueueError::Database("attempt 2".into())));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_caller_errors_fail_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&counter);

        let result: Result<()> = retry_transient(&fast_policy(5), "test", || {
            let c = Arc::clone(&calls);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::QueueNotFound)
            }
        })
        .await;

        assert_eq!(result, Err(QueueError::QueueNotFound));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
