//! Resilience for calls to external dependencies
//!
//! This module provides:
//! - Per-dependency circuit breakers that fail fast while a dependency is down
//! - Retry with exponential backoff and jitter for transient failures
//! - A registry so breakers are shared across components
//! - [`ResilientCaller`], composing retry over breaker with timeouts and cancellation

mod circuit_breaker;
mod guard;
mod registry;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitBreakerStatistics,
    CircuitState,
};
pub use guard::ResilientCaller;
pub use registry::CircuitBreakerRegistry;
pub use retry::RetryPolicy;
