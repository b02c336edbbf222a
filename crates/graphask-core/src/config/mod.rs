//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Graphask configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub matching: MatchingConfig,
    pub context: ContextConfig,
    pub generation: GenerationConfig,
    pub execution: ExecutionConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
}

/// Similarity thresholds per matching category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub entity_threshold: f32,
    pub scope_threshold: f32,
    pub template_threshold: f32,
    /// Use embedding similarity when an embedding provider is available
    pub semantic_enabled: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            entity_threshold: 0.75,
            scope_threshold: 0.70,
            template_threshold: 0.80,
            semantic_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub exemplar_limit: usize,
    pub exemplar_threshold: f32,
    /// Token budget for assembled context; `None` disables trimming
    pub token_budget: Option<usize>,
    pub words_to_tokens_ratio: f32,
    pub include_schema: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            exemplar_limit: 5,
            exemplar_threshold: 0.70,
            token_budget: None,
            words_to_tokens_ratio: 1.3,
            include_schema: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub default_limit: usize,
    pub max_complexity: u32,
    pub allow_write: bool,
    /// Re-prompts after a draft fails validation
    pub max_correction_attempts: u32,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_complexity: 50,
            allow_write: false,
            max_correction_attempts: 1,
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub read_only: bool,
    pub default_limit: usize,
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            read_only: true,
            default_limit: 100,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

const KEYS: &[&str] = &[
    "matching.entity_threshold",
    "matching.scope_threshold",
    "matching.template_threshold",
    "matching.semantic_enabled",
    "context.exemplar_limit",
    "context.exemplar_threshold",
    "context.token_budget",
    "context.words_to_tokens_ratio",
    "context.include_schema",
    "generation.default_limit",
    "generation.max_complexity",
    "generation.allow_write",
    "generation.max_correction_attempts",
    "generation.temperature",
    "generation.max_tokens",
    "execution.read_only",
    "execution.default_limit",
    "execution.timeout_ms",
    "circuit_breaker.failure_threshold",
    "circuit_breaker.recovery_timeout_secs",
    "circuit_breaker.success_threshold",
    "retry.max_attempts",
    "retry.base_delay_ms",
    "retry.max_delay_ms",
    "retry.jitter_ms",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("GRAPHASK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("graphask")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("matching.entity_threshold", self.matching.entity_threshold),
            ("matching.scope_threshold", self.matching.scope_threshold),
            ("matching.template_threshold", self.matching.template_threshold),
            ("context.exemplar_threshold", self.context.exemplar_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0.0 and 1.0", name));
            }
        }

        if self.context.words_to_tokens_ratio <= 0.0 {
            return Err(anyhow!("context.words_to_tokens_ratio must be positive"));
        }
        if self.generation.default_limit == 0 || self.execution.default_limit == 0 {
            return Err(anyhow!("Default result limits must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(anyhow!("Circuit breaker thresholds must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("retry.base_delay_ms cannot exceed retry.max_delay_ms"));
        }

        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "matching.entity_threshold" => self.matching.entity_threshold.to_string(),
            "matching.scope_threshold" => self.matching.scope_threshold.to_string(),
            "matching.template_threshold" => self.matching.template_threshold.to_string(),
            "matching.semantic_enabled" => self.matching.semantic_enabled.to_string(),

            "context.exemplar_limit" => self.context.exemplar_limit.to_string(),
            "context.exemplar_threshold" => self.context.exemplar_threshold.to_string(),
            "context.token_budget" => self
                .context
                .token_budget
                .map(|b| b.to_string())
                .unwrap_or_else(|| "(unlimited)".to_string()),
            "context.words_to_tokens_ratio" => self.context.words_to_tokens_ratio.to_string(),
            "context.include_schema" => self.context.include_schema.to_string(),

            "generation.default_limit" => self.generation.default_limit.to_string(),
            "generation.max_complexity" => self.generation.max_complexity.to_string(),
            "generation.allow_write" => self.generation.allow_write.to_string(),
            "generation.max_correction_attempts" => {
                self.generation.max_correction_attempts.to_string()
            }
            "generation.temperature" => self.generation.temperature.to_string(),
            "generation.max_tokens" => self.generation.max_tokens.to_string(),

            "execution.read_only" => self.execution.read_only.to_string(),
            "execution.default_limit" => self.execution.default_limit.to_string(),
            "execution.timeout_ms" => self.execution.timeout_ms.to_string(),

            "circuit_breaker.failure_threshold" => self.circuit_breaker.failure_threshold.to_string(),
            "circuit_breaker.recovery_timeout_secs" => {
                self.circuit_breaker.recovery_timeout_secs.to_string()
            }
            "circuit_breaker.success_threshold" => self.circuit_breaker.success_threshold.to_string(),

            "retry.max_attempts" => self.retry.max_attempts.to_string(),
            "retry.base_delay_ms" => self.retry.base_delay_ms.to_string(),
            "retry.max_delay_ms" => self.retry.max_delay_ms.to_string(),
            "retry.jitter_ms" => self.retry.jitter_ms.to_string(),

            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        };
        Ok(value)
    }

    /// Set a configuration value by key
    ///
    /// The whole configuration is re-validated; an invalid value leaves
    /// `self` unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();
        match key {
            "matching.entity_threshold" => updated.matching.entity_threshold = parse(key, value)?,
            "matching.scope_threshold" => updated.matching.scope_threshold = parse(key, value)?,
            "matching.template_threshold" => {
                updated.matching.template_threshold = parse(key, value)?
            }
            "matching.semantic_enabled" => updated.matching.semantic_enabled = parse(key, value)?,

            "context.exemplar_limit" => updated.context.exemplar_limit = parse(key, value)?,
            "context.exemplar_threshold" => updated.context.exemplar_threshold = parse(key, value)?,
            "context.token_budget" => {
                updated.context.token_budget = match value.trim() {
                    "" | "none" | "unlimited" => None,
                    other => Some(parse(key, other)?),
                }
            }
            "context.words_to_tokens_ratio" => {
                updated.context.words_to_tokens_ratio = parse(key, value)?
            }
            "context.include_schema" => updated.context.include_schema = parse(key, value)?,

            "generation.default_limit" => updated.generation.default_limit = parse(key, value)?,
            "generation.max_complexity" => updated.generation.max_complexity = parse(key, value)?,
            "generation.allow_write" => updated.generation.allow_write = parse(key, value)?,
            "generation.max_correction_attempts" => {
                updated.generation.max_correction_attempts = parse(key, value)?
            }
            "generation.temperature" => {
                let temp: f32 = parse(key, value)?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                updated.generation.temperature = temp;
            }
            "generation.max_tokens" => updated.generation.max_tokens = parse(key, value)?,

            "execution.read_only" => updated.execution.read_only = parse(key, value)?,
            "execution.default_limit" => updated.execution.default_limit = parse(key, value)?,
            "execution.timeout_ms" => updated.execution.timeout_ms = parse(key, value)?,

            "circuit_breaker.failure_threshold" => {
                updated.circuit_breaker.failure_threshold = parse(key, value)?
            }
            "circuit_breaker.recovery_timeout_secs" => {
                updated.circuit_breaker.recovery_timeout_secs = parse(key, value)?
            }
            "circuit_breaker.success_threshold" => {
                updated.circuit_breaker.success_threshold = parse(key, value)?
            }

            "retry.max_attempts" => updated.retry.max_attempts = parse(key, value)?,
            "retry.base_delay_ms" => updated.retry.base_delay_ms = parse(key, value)?,
            "retry.max_delay_ms" => updated.retry.max_delay_ms = parse(key, value)?,
            "retry.jitter_ms" => updated.retry.jitter_ms = parse(key, value)?,

            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}
