//! Circuit breaker for one named external dependency
//!
//! ```text
//!   CLOSED ──(failures >= failure_threshold)──▶ OPEN
//!     ▲                                          │
//!     │                               (recovery timeout elapsed)
//!     │                                          ▼
//!     └──(successes >= success_threshold)── HALF_OPEN ──(any failure)──▶ OPEN
//! ```
//!
//! - **Closed**: calls pass through. A failure increments the failure
//!   counter, a success decrements it toward zero.
//! - **Open**: calls fail immediately with [`Error::BreakerOpen`] without
//!   running the operation.
//! - **HalfOpen**: one trial call at a time is let through.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerSettings;
use crate::error::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Testing recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is allowed
    pub recovery_timeout: Duration,
    /// Trial successes needed to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_secs),
            success_threshold: settings.success_threshold.max(1),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_failure_wall: None,
            trial_in_flight: false,
        }
    }

    fn recovery_elapsed(&self, timeout: Duration) -> bool {
        self.last_failure_at
            .map(|at| at.elapsed() >= timeout)
            .unwrap_or(true)
    }
}

#[derive(Debug, Default)]
struct BreakerStats {
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    state_transitions: AtomicU64,
}

/// Call statistics for one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatistics {
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub state_transitions: u64,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub stats: CircuitBreakerStatistics,
}

/// How a guarded call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Circuit breaker for fault tolerance
///
/// All state changes happen under one lock so concurrent callers see
/// consistent counters.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            stats: BreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    ///
    /// An open breaker whose recovery timeout has elapsed reports
    /// `HalfOpen`; the transition itself happens on the next call.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if inner.recovery_elapsed(self.config.recovery_timeout) => {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    pub fn stats(&self) -> CircuitBreakerStatistics {
        CircuitBreakerStatistics {
            total_calls: self.stats.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.stats.rejected_calls.load(Ordering::Relaxed),
            successful_calls: self.stats.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.stats.failed_calls.load(Ordering::Relaxed),
            state_transitions: self.stats.state_transitions.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_wall,
            stats: self.stats(),
        }
    }

    /// Run `operation` through the breaker
    ///
    /// When the breaker is open the operation is never invoked and
    /// [`Error::BreakerOpen`] is returned.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        permit.settle(&result);
        result
    }

    /// Force closed with zero counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.stats.state_transitions.fetch_add(1, Ordering::Relaxed);
        }
        *inner = BreakerInner::new();
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Admit one call, or reject it while open
    pub(super) fn acquire(&self) -> Result<CallPermit<'_>> {
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                if inner.recovery_elapsed(self.config.recovery_timeout) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    debug!(breaker = %self.name, "Recovery timeout elapsed, allowing trial call");
                    Ok(CallPermit::new(self, true))
                } else {
                    self.reject()
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    self.reject()
                } else {
                    inner.trial_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    fn reject<T>(&self) -> Result<T> {
        self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
        Err(Error::BreakerOpen(self.name.clone()))
    }

    fn record(&self, trial: bool, outcome: Outcome) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
        }

        match outcome {
            Outcome::Neutral => {}
            Outcome::Success => {
                self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                match inner.state {
                    CircuitState::Closed => {
                        inner.failure_count = inner.failure_count.saturating_sub(1);
                    }
                    CircuitState::HalfOpen if trial => {
                        inner.success_count += 1;
                        if inner.success_count >= self.config.success_threshold {
                            self.transition(&mut inner, CircuitState::Closed);
                            info!(breaker = %self.name, "Circuit breaker closed after recovery");
                        }
                    }
                    _ => {}
                }
            }
            Outcome::Failure => {
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                inner.last_failure_at = Some(Instant::now());
                inner.last_failure_wall = Some(Utc::now());
                match inner.state {
                    CircuitState::Closed => {
                        inner.failure_count += 1;
                        if inner.failure_count >= self.config.failure_threshold {
                            self.transition(&mut inner, CircuitState::Open);
                            warn!(
                                breaker = %self.name,
                                failures = inner.failure_count,
                                "Circuit breaker opened"
                            );
                        }
                    }
                    CircuitState::HalfOpen => {
                        self.transition(&mut inner, CircuitState::Open);
                        warn!(breaker = %self.name, "Trial call failed, circuit breaker re-opened");
                    }
                    CircuitState::Open => {}
                }
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }
        inner.state = new_state;
        self.stats.state_transitions.fetch_add(1, Ordering::Relaxed);

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.trial_in_flight = false;
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
            }
            CircuitState::Open => {
                inner.success_count = 0;
                inner.trial_in_flight = false;
            }
        }
    }
}

/// Admission to one guarded call
///
/// A permit dropped without being settled (the call's future was dropped)
/// is recorded as neutral so a half-open trial slot is released.
pub(super) struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub(super) fn settle<T>(mut self, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.counts_against_breaker() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        self.settled = true;
        self.breaker.record(self.trial, outcome);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.trial, Outcome::Neutral);
        }
    }
}
