//! Retry with exponential backoff and jitter

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::RetrySettings;
use crate::error::{Error, Result};

/// Retry policy for transient external failures
///
/// The delay before retry `n` (1-based) is
/// `min(max_delay, base_delay * 2^(n-1))` plus a random jitter of up to
/// `jitter_ms`. Only errors for which [`Error::is_retryable`] holds are
/// retried; anything else, including an open breaker, is returned at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_api_calls()
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            jitter_ms: settings.jitter_ms,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::from(settings)
    }

    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms,
            jitter_ms: 0,
        }
    }

    /// Language model and embedding calls
    pub fn for_api_calls() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }

    /// Generic network requests
    pub fn for_network_requests() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 100,
        }
    }

    /// Graph database queries
    pub fn for_database_operations() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            jitter_ms: 50,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(1, 0, 0)
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Backoff before retry `attempt` without jitter
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Backoff before retry `attempt` including jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.base_delay_for_attempt(attempt) + Duration::from_millis(jitter)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, |_, _, _| {}, None).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry(error, attempt, delay)`
    /// before each backoff sleep
    pub async fn execute_with<F, Fut, T, R>(&self, operation: F, on_retry: R) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(&Error, u32, Duration),
    {
        self.run(operation, on_retry, None).await
    }

    /// Like [`execute_with`](Self::execute_with); a cancelled token ends the
    /// backoff sleep with [`Error::Cancelled`]
    pub async fn execute_cancellable<F, Fut, T, R>(
        &self,
        operation: F,
        on_retry: R,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(&Error, u32, Duration),
    {
        self.run(operation, on_retry, Some(cancel)).await
    }

    async fn run<F, Fut, T, R>(
        &self,
        mut operation: F,
        mut on_retry: R,
        cancel: Option<&CancellationToken>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(&Error, u32, Duration),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                return Err(error);
            }

            let mut delay = self.delay_for_attempt(attempt);
            // Honour a server-provided wait when it is longer than our backoff
            if let Error::RateLimited {
                retry_after_secs, ..
            } = &error
            {
                delay = delay.max(Duration::from_secs(*retry_after_secs));
            }
            on_retry(&error, attempt, delay);

            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 350);
        assert_eq!(policy.base_delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.base_delay_for_attempt(80), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3, 100, 1000).with_jitter(20);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryPolicy::for_api_calls().max_attempts, 3);
        assert_eq!(RetryPolicy::for_network_requests().max_attempts, 5);
        assert_eq!(RetryPolicy::for_database_operations().max_delay_ms, 2000);
        assert_eq!(RetryPolicy::from_settings(&RetrySettings::default()).base_delay_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 10, 100);
        let counter = calls.clone();

        let result = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::transient("language-model", "503"))
                    } else {
                        Ok("MATCH (n) RETURN n")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "MATCH (n) RETURN n");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reraises_last_error_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let mut delays = Vec::new();
        let policy = RetryPolicy::new(3, 10, 100);

        let result: Result<()> = policy
            .execute_with(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(Error::transient("graph-store", format!("attempt {}", n + 1))) }
                },
                |_, attempt, delay| delays.push((attempt, delay)),
            )
            .await;

        assert!(result.unwrap_err().to_string().contains("attempt 3"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            delays,
            vec![
                (1, Duration::from_millis(10)),
                (2, Duration::from_millis(20))
            ]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 10, 100);

        let result: Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::BreakerOpen("graph-store".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::BreakerOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_at_least_retry_after() {
        let mut observed = Duration::ZERO;
        let policy = RetryPolicy::new(2, 10, 100);

        let _ = policy
            .execute_with(
                || async {
                    Err::<(), _>(Error::RateLimited {
                        dependency: "language-model".to_string(),
                        retry_after_secs: 3,
                    })
                },
                |_, _, delay| observed = delay,
            )
            .await;

        assert_eq!(observed, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(3, 60_000, 60_000);
        let cancel = token.clone();

        let result: Result<()> = policy
            .execute_cancellable(
                || async { Err(Error::transient("embedding", "reset")) },
                |_, _, _| cancel.cancel(),
                &token,
            )
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
