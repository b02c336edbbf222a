//! Query execution under operational limits

mod executor;
mod result;

pub use executor::{ExecutionOptions, QueryExecutor};
pub use result::{
    ExecutionError, ExecutionResult, ExecutionStats, ExplainResult, PaginatedResult,
    QueryTestResult,
};
