//! Execution result types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::generation::ValidationResult;
use crate::providers::Row;

/// A failure reported inside a result rather than raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for ExecutionError {
    fn from(error: &Error) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub execution_time_ms: u64,
    pub row_count: usize,
}

/// Outcome of running one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub rows: Vec<Row>,
    pub stats: ExecutionStats,
    pub errors: Vec<ExecutionError>,
    /// The text actually sent to the store
    pub executed_query: String,
}

impl ExecutionResult {
    pub fn succeeded(executed_query: impl Into<String>, rows: Vec<Row>, elapsed: Duration) -> Self {
        Self {
            success: true,
            stats: ExecutionStats {
                execution_time_ms: elapsed.as_millis() as u64,
                row_count: rows.len(),
            },
            rows,
            errors: Vec::new(),
            executed_query: executed_query.into(),
        }
    }

    pub fn failed(executed_query: impl Into<String>, errors: Vec<ExecutionError>, elapsed: Duration) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            stats: ExecutionStats {
                execution_time_ms: elapsed.as_millis() as u64,
                row_count: 0,
            },
            errors,
            executed_query: executed_query.into(),
        }
    }

    pub fn from_error(executed_query: impl Into<String>, error: &Error, elapsed: Duration) -> Self {
        Self::failed(executed_query, vec![ExecutionError::from(error)], elapsed)
    }

    /// Code of the first error, if the run failed
    pub fn error_code(&self) -> Option<&str> {
        self.errors.first().map(|e| e.code.as_str())
    }
}

/// One page of a paginated query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult {
    pub result: ExecutionResult,
    /// 1-based page number
    pub page: usize,
    pub per_page: usize,
    pub has_more: bool,
}

/// Plan of a query, obtained without producing results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainResult {
    pub success: bool,
    pub validation: ValidationResult,
    pub plan: Vec<Row>,
    pub complexity_score: u32,
    pub errors: Vec<ExecutionError>,
}

/// Dry run of a query against at most one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTestResult {
    pub passed: bool,
    pub validation: ValidationResult,
    /// Absent when validation failed and nothing was run
    pub execution: Option<ExecutionResult>,
}
