//! Retry-over-breaker composition for outbound calls

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::circuit_breaker::CircuitBreakerConfig;
use super::registry::CircuitBreakerRegistry;
use super::retry::RetryPolicy;
use crate::config::Config;
use crate::error::{Error, Result};

/// Wraps every outbound call in retry, breaker, timeout and cancellation
///
/// Each attempt passes through the dependency's breaker, so an open
/// breaker ends the retry loop immediately and every attempt's outcome is
/// recorded individually.
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    registry: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl ResilientCaller {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, policy: RetryPolicy) -> Self {
        Self {
            registry,
            policy,
            timeout: None,
        }
    }

    /// Build from loaded configuration with a fresh registry
    pub fn from_config(config: &Config) -> Self {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::from(&config.circuit_breaker));
        Self::new(Arc::new(registry), RetryPolicy::from(&config.retry))
    }

    /// Default per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `dependency` with the default per-attempt timeout
    pub async fn call<F, Fut, T>(
        &self,
        dependency: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_with_timeout(dependency, self.timeout, cancel, operation)
            .await
    }

    /// Call `dependency`, bounding each attempt by `timeout`
    ///
    /// A timed-out attempt yields [`Error::Timeout`], which is retryable and
    /// counts against the breaker. Cancellation yields [`Error::Cancelled`]
    /// and is neutral.
    pub async fn call_with_timeout<F, Fut, T>(
        &self,
        dependency: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let breaker = self.registry.get_or_create(dependency);
        let breaker = breaker.as_ref();

        self.policy
            .execute_cancellable(
                move || {
                    // The operation is only started once the breaker admits it
                    let admitted = breaker.acquire().map(|permit| (permit, operation()));
                    async move {
                        let (permit, attempt) = admitted?;
                        let result =
                            guarded_attempt(attempt, dependency.to_string(), timeout, cancel.clone())
                                .await;
                        permit.settle(&result);
                        result
                    }
                },
                |error, attempt, delay| {
                    warn!(
                        dependency,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "External call failed, retrying"
                    );
                },
                cancel,
            )
            .await
    }
}

async fn guarded_attempt<Fut, T>(
    attempt: Fut,
    dependency: String,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    dependency: dependency.clone(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => attempt.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = bounded => result,
    }
}
