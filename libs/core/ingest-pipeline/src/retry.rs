//! Retry policy with exponential backoff.
//!
//! Shared by the storage writer, the notification publisher and the
//! queue deletion path. Only [`ErrorKind::Transient`](crate::ErrorKind)
//! failures are retried; everything else is returned on the first attempt.

use crate::error::{PipelineError, PipelineResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Backoff before retry number `retry` (0-based): base * 2^retry, capped at max.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt ceiling is reached.
    ///
    /// `on_retry` is invoked before each backoff sleep, mainly for metrics.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt_fn: F,
        mut on_retry: impl FnMut(u32, &PipelineError),
    ) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_retry(attempt - 1);
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off before retry"
                    );
                    on_retry(attempt, &err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_exponential() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(1)); // Capped
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_attempts_never_zero() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::default();

        let result = policy
            .run(
                "test",
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::transient("throttled"))
                    } else {
                        Ok(7)
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retries = AtomicU32::new(0);
        let policy = RetryPolicy::default().with_max_attempts(4);

        let result: PipelineResult<()> = policy
            .run(
                "test",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::transient("timeout"))
                },
                |_, _| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: PipelineResult<()> = RetryPolicy::default()
            .run(
                "test",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::permanent("access denied"))
                },
                |_, _| {},
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let _: PipelineResult<()> = policy
            .run(
                "test",
                || async { Err(PipelineError::transient("down")) },
                |_, _| {},
            )
            .await;

        // 100ms + 200ms of backoff for two retries
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}
