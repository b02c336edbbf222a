//! Error types for Graphask

use thiserror::Error;

/// Result type alias using Graphask's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Graphask error types with stable codes and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Context errors (E100-E199)
    #[error("Context retrieval failed: {0}")]
    ContextRetrievalFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Schema unavailable: {0}")]
    SchemaUnavailable(String),

    // Generation errors (E200-E299)
    #[error("Generated query failed validation: {}", .0.join("; "))]
    GenerationInvalid(Vec<String>),

    #[error("Query drafting failed: {0}")]
    DraftFailed(String),

    #[error("No template matched and no query drafter is configured for: {0}")]
    NoDrafter(String),

    // Transient external errors (E300-E399)
    #[error("Transient failure from '{dependency}': {message}")]
    Transient { dependency: String, message: String },

    #[error("Call to '{dependency}' timed out after {timeout_ms}ms")]
    Timeout { dependency: String, timeout_ms: u64 },

    #[error("Rate limited by '{dependency}'. Retry after {retry_after_secs} seconds.")]
    RateLimited {
        dependency: String,
        retry_after_secs: u64,
    },

    #[error("Provider '{dependency}' returned an error: {message}")]
    Provider { dependency: String, message: String },

    // Breaker errors (E400-E499)
    #[error("Circuit breaker open for '{0}'. Calls are rejected until it recovers.")]
    BreakerOpen(String),

    // Policy errors (E500-E599)
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Cancellation (E700-E799)
    #[error("Operation cancelled")]
    Cancelled,

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a transient error for a named dependency
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Build a non-retryable provider error for a named dependency
    pub fn provider(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContextRetrievalFailed(_) => "E100",
            Self::EmbeddingFailed(_) => "E101",
            Self::SchemaUnavailable(_) => "E102",
            Self::GenerationInvalid(_) => "E200",
            Self::DraftFailed(_) => "E201",
            Self::NoDrafter(_) => "E202",
            Self::Transient { .. } => "E300",
            Self::Timeout { .. } => "E301",
            Self::RateLimited { .. } => "E302",
            Self::Provider { .. } => "E303",
            Self::BreakerOpen(_) => "E400",
            Self::PolicyViolation(_) => "E500",
            Self::ConfigError(_) => "E600",
            Self::Cancelled => "E700",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::SchemaUnavailable(_) => Some("Check that the graph store is reachable".to_string()),
            Self::NoDrafter(_) => Some("Configure a query drafter or add a matching template".to_string()),
            Self::Timeout { .. } => Some("Increase execution.timeout_ms".to_string()),
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(format!("Retry after {} seconds", retry_after_secs)),
            Self::BreakerOpen(name) => Some(format!(
                "Wait for the recovery timeout or reset the '{}' breaker",
                name
            )),
            Self::PolicyViolation(_) => {
                Some("Set generation.allow_write = true to permit write queries".to_string())
            }
            Self::ConfigError(_) => Some("Check config.toml against the documented keys".to_string()),
            _ => None,
        }
    }

    /// Whether the retry policy may attempt the call again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// Whether a circuit breaker records this outcome as a dependency failure
    ///
    /// Cancellation, policy and input errors say nothing about the health
    /// of the dependency and are recorded as neutral.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled
                | Self::BreakerOpen(_)
                | Self::PolicyViolation(_)
                | Self::InvalidInput(_)
                | Self::GenerationInvalid(_)
                | Self::ConfigError(_)
                | Self::NoDrafter(_)
        )
    }
}
