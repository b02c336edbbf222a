//! Guarded query execution against the graph store

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::result::{
    ExecutionError, ExecutionResult, ExplainResult, PaginatedResult, QueryTestResult,
};
use crate::config::ExecutionConfig;
use crate::error::Error;
use crate::generation::{QueryValidator, ValidationResult, clause_separator};
use crate::providers::{GRAPH_STORE, GraphStore, Params};
use crate::resilience::ResilientCaller;

/// Per-call overrides of the executor's configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOptions {
    /// Permit write queries even in read-only mode
    pub allow_write: bool,
    /// Row limit applied when the query has none
    pub default_limit: Option<usize>,
    pub timeout: Option<Duration>,
}

impl ExecutionOptions {
    pub fn allowing_writes() -> Self {
        Self {
            allow_write: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = Some(limit);
        self
    }
}

/// Runs queries with read-only, limit and timeout policy
///
/// Every store call goes through the `graph-store` breaker and the retry
/// policy. Failures are reported in the returned result, never raised.
pub struct QueryExecutor {
    store: Arc<dyn GraphStore>,
    config: ExecutionConfig,
    caller: ResilientCaller,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn GraphStore>, config: ExecutionConfig, caller: ResilientCaller) -> Self {
        Self {
            store,
            config,
            caller,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn validator(&self, options: &ExecutionOptions) -> QueryValidator {
        QueryValidator::default()
            .with_allow_write(!self.config.read_only || options.allow_write)
            .with_default_limit(options.default_limit.unwrap_or(self.config.default_limit))
    }

    /// Run a query
    ///
    /// Write queries are rejected in read-only mode unless the options
    /// allow them. Read queries without a LIMIT get the default one.
    pub async fn execute(
        &self,
        query: &str,
        params: &Params,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let validator = self.validator(options);

        if query.trim().is_empty() {
            let error = Error::InvalidInput("query is empty".to_string());
            return ExecutionResult::from_error(query, &error, started.elapsed());
        }

        let is_write = validator.is_write_query(query);
        if is_write && !validator.allow_write() {
            let error = Error::PolicyViolation(
                "write queries are not allowed in read-only mode".to_string(),
            );
            warn!(error = %error, "Rejected query");
            return ExecutionResult::from_error(query, &error, started.elapsed());
        }

        let text = if is_write {
            query.trim().to_string()
        } else {
            validator.sanitize(query)
        };
        self.run(text, params, options, cancel, started).await
    }

    async fn run(
        &self,
        text: String,
        params: &Params,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
        started: Instant,
    ) -> ExecutionResult {
        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.timeout_ms));

        let store = &self.store;
        let query = text.as_str();
        let outcome = self
            .caller
            .call_with_timeout(GRAPH_STORE, Some(timeout), cancel, || {
                store.query(query, params, cancel)
            })
            .await;

        match outcome {
            Ok(rows) => {
                let result = ExecutionResult::succeeded(text, rows, started.elapsed());
                info!(
                    rows = result.stats.row_count,
                    elapsed_ms = result.stats.execution_time_ms,
                    "Query executed"
                );
                result
            }
            Err(e) => {
                warn!(code = e.code(), error = %e, "Query execution failed");
                ExecutionResult::from_error(text, &e, started.elapsed())
            }
        }
    }

    /// Run one page of a query
    ///
    /// Fetches one row beyond the page to tell whether more pages exist.
    /// Queries that already carry a LIMIT are paged as a subquery.
    pub async fn execute_paginated(
        &self,
        query: &str,
        params: &Params,
        page: usize,
        per_page: usize,
        options: &ExecutionOptions,
        cancel: &CancellationToken,
    ) -> PaginatedResult {
        let started = Instant::now();
        let page = page.max(1);

        if per_page == 0 {
            let error = Error::InvalidInput("per_page must be at least 1".to_string());
            return PaginatedResult {
                result: ExecutionResult::from_error(query, &error, started.elapsed()),
                page,
                per_page,
                has_more: false,
            };
        }

        let validator = self.validator(options);
        if validator.is_write_query(query) {
            let error = Error::InvalidInput("write queries cannot be paginated".to_string());
            return PaginatedResult {
                result: ExecutionResult::from_error(query, &error, started.elapsed()),
                page,
                per_page,
                has_more: false,
            };
        }

        let base = query.trim().trim_end_matches(';').trim_end();
        let separator = clause_separator(base);
        let skip = (page - 1) * per_page;
        let fetch = per_page + 1;
        let paged = if validator.has_limit(base) {
            format!("CALL {{ {}{}}} RETURN * SKIP {} LIMIT {}", base, separator, skip, fetch)
        } else {
            format!("{}{}SKIP {} LIMIT {}", base, separator, skip, fetch)
        };
        debug!(page, per_page, "Executing page");

        let mut result = self.run(paged, params, options, cancel, started).await;
        let has_more = result.rows.len() > per_page;
        if has_more {
            result.rows.truncate(per_page);
            result.stats.row_count = per_page;
        }

        PaginatedResult {
            result,
            page,
            per_page,
            has_more,
        }
    }

    /// Validate and fetch the store's plan without producing results
    pub async fn explain(&self, query: &str, cancel: &CancellationToken) -> ExplainResult {
        let validator = self.validator(&ExecutionOptions::default());
        let validation = validator.validate(query);
        let complexity_score = validation.complexity_score;

        if !validation.valid {
            return ExplainResult {
                success: false,
                errors: validation_errors(&validation),
                validation,
                plan: Vec::new(),
                complexity_score,
            };
        }

        let text = format!("EXPLAIN {}", query.trim().trim_end_matches(';').trim_end());
        let result = self
            .run(text, &Params::new(), &ExecutionOptions::default(), cancel, Instant::now())
            .await;

        ExplainResult {
            success: result.success,
            validation,
            plan: result.rows,
            complexity_score,
            errors: result.errors,
        }
    }

    /// Validate, then run against at most one row
    ///
    /// Write queries are only planned with `EXPLAIN`, so a test never
    /// changes the graph.
    pub async fn test(&self, query: &str, params: &Params, cancel: &CancellationToken) -> QueryTestResult {
        let validator = self.validator(&ExecutionOptions::default());
        let validation = validator.validate(query);
        if !validation.valid {
            return QueryTestResult {
                passed: false,
                validation,
                execution: None,
            };
        }

        let base = query.trim().trim_end_matches(';').trim_end();
        let separator = clause_separator(base);
        let text = if validator.is_write_query(base) {
            format!("EXPLAIN {}", base)
        } else if validator.has_limit(base) {
            format!("CALL {{ {}{}}} RETURN * LIMIT 1", base, separator)
        } else {
            format!("{}{}LIMIT 1", base, separator)
        };

        let execution = self
            .run(text, params, &ExecutionOptions::default(), cancel, Instant::now())
            .await;
        QueryTestResult {
            passed: execution.success,
            validation,
            execution: Some(execution),
        }
    }
}

fn validation_errors(validation: &ValidationResult) -> Vec<ExecutionError> {
    let code = if validation.policy_violation {
        Error::PolicyViolation(String::new()).code()
    } else {
        Error::GenerationInvalid(Vec::new()).code()
    };
    validation
        .errors
        .iter()
        .map(|message| ExecutionError::new(code, message.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Row, SchemaSnapshot};
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, RetryPolicy};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingStore {
        queries: Mutex<Vec<String>>,
        rows: usize,
        failures_left: AtomicU32,
        delay: Option<Duration>,
    }

    impl RecordingStore {
        fn with_rows(rows: usize) -> Self {
            Self {
                rows,
                ..Self::default()
            }
        }

        fn last_query(&self) -> String {
            self.queries.lock().unwrap().last().cloned().unwrap_or_default()
        }

        fn calls(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GraphStore for RecordingStore {
        async fn query(
            &self,
            text: &str,
            _params: &Params,
            _cancel: &CancellationToken,
        ) -> crate::error::Result<Vec<Row>> {
            self.queries.lock().unwrap().push(text.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::transient(GRAPH_STORE, "connection reset"));
            }
            Ok((0..self.rows)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("i".to_string(), json!(i));
                    row
                })
                .collect())
        }

        async fn get_schema(&self, _cancel: &CancellationToken) -> crate::error::Result<SchemaSnapshot> {
            Ok(SchemaSnapshot::default())
        }
    }

    fn executor(store: Arc<RecordingStore>, policy: RetryPolicy) -> (QueryExecutor, Arc<CircuitBreakerRegistry>) {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }));
        let caller = ResilientCaller::new(registry.clone(), policy);
        (QueryExecutor::new(store, ExecutionConfig::default(), caller), registry)
    }

    #[tokio::test]
    async fn test_execute_applies_default_limit() {
        let store = Arc::new(RecordingStore::with_rows(2));
        let (executor, _) = executor(store.clone(), RetryPolicy::none());

        let result = executor
            .execute("MATCH (n:Customer) RETURN n", &Params::new(), &ExecutionOptions::default(), &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.stats.row_count, 2);
        assert_eq!(store.last_query(), "MATCH (n:Customer) RETURN n LIMIT 100");
        assert_eq!(result.executed_query, store.last_query());
    }

    #[tokio::test]
    async fn test_execute_rejects_writes_in_read_only_mode() {
        let store = Arc::new(RecordingStore::with_rows(0));
        let (executor, _) = executor(store.clone(), RetryPolicy::none());

        let result = executor
            .execute("CREATE (n:Customer {name: $name})", &Params::new(), &ExecutionOptions::default(), &CancellationToken::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code(), Some("E500"));
        assert_eq!(store.calls(), 0);

        let result = executor
            .execute(
                "CREATE (n:Customer {name: $name})",
                &Params::new(),
                &ExecutionOptions::allowing_writes(),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(store.last_query(), "CREATE (n:Customer {name: $name})");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_transient_failures() {
        let store = Arc::new(RecordingStore {
            rows: 1,
            failures_left: AtomicU32::new(2),
            ..RecordingStore::default()
        });
        let (executor, _) = executor(store.clone(), RetryPolicy::new(3, 10, 100));

        let result = executor
            .execute("MATCH (n) RETURN n LIMIT 5", &Params::new(), &ExecutionOptions::default(), &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported_not_raised() {
        let store = Arc::new(RecordingStore {
            rows: 1,
            delay: Some(Duration::from_secs(5)),
            ..RecordingStore::default()
        });
        let (executor, _) = executor(store, RetryPolicy::none());

        let result = executor
            .execute(
                "MATCH (n) RETURN n LIMIT 5",
                &Params::new(),
                &ExecutionOptions::default().with_timeout(Duration::from_millis(100)),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code(), Some("E301"));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let store = Arc::new(RecordingStore {
            failures_left: AtomicU32::new(10),
            ..RecordingStore::default()
        });
        let (executor, registry) = executor(store.clone(), RetryPolicy::none());
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let result = executor
                .execute("MATCH (n) RETURN n LIMIT 5", &Params::new(), &ExecutionOptions::default(), &cancel)
                .await;
            assert_eq!(result.error_code(), Some("E300"));
        }
        assert_eq!(
            registry.get(GRAPH_STORE).map(|b| b.state()),
            Some(CircuitState::Open)
        );

        let result = executor
            .execute("MATCH (n) RETURN n LIMIT 5", &Params::new(), &ExecutionOptions::default(), &cancel)
            .await;
        assert_eq!(result.error_code(), Some("E400"));
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_paginated_detects_more_pages() {
        let store = Arc::new(RecordingStore::with_rows(11));
        let (executor, _) = executor(store.clone(), RetryPolicy::none());

        let page = executor
            .execute_paginated(
                "MATCH (n:Order) RETURN n ORDER BY n.placed_at",
                &Params::new(),
                2,
                10,
                &ExecutionOptions::default(),
                &CancellationToken::new(),
            )
            .await;

        assert!(page.has_more);
        assert_eq!(page.result.rows.len(), 10);
        assert_eq!(page.result.stats.row_count, 10);
        assert_eq!(
            store.last_query(),
            "MATCH (n:Order) RETURN n ORDER BY n.placed_at SKIP 10 LIMIT 11"
        );
    }

    #[tokio::test]
    async fn test_paginated_wraps_limited_queries() {
        let store = Arc::new(RecordingStore::with_rows(3));
        let (executor, _) = executor(store.clone(), RetryPolicy::none());

        let page = executor
            .execute_paginated("MATCH (n) RETURN n LIMIT 50", &Params::new(), 1, 5, &ExecutionOptions::default(), &CancellationToken::new())
            .await;

        assert!(!page.has_more);
        assert_eq!(store.last_query(), "CALL { MATCH (n) RETURN n LIMIT 50 } RETURN * SKIP 0 LIMIT 6");
    }

    #[tokio::test]
    async fn test_explain_rejects_invalid_queries_without_calling_store() {
        let store = Arc::new(RecordingStore::with_rows(1));
        let (executor, _) = executor(store.clone(), RetryPolicy::none());

        let explained = executor.explain("MATCH (n) DETACH DELETE n", &CancellationToken::new()).await;
        assert!(!explained.success);
        assert_eq!(explained.errors[0].code, "E500");
        assert_eq!(store.calls(), 0);

        let explained = executor.explain("MATCH (n:Customer) RETURN n", &CancellationToken::new()).await;
        assert!(explained.success);
        assert_eq!(explained.complexity_score, 5);
        assert_eq!(store.last_query(), "EXPLAIN MATCH (n:Customer) RETURN n");
    }

    #[tokio::test]
    async fn test_test_runs_against_one_row() {
        let store = Arc::new(RecordingStore::with_rows(1));
        let (executor, _) = executor(store.clone(), RetryPolicy::none());

        let tested = executor
            .test("MATCH (n:Customer) RETURN n", &Params::new(), &CancellationToken::new())
            .await;
        assert!(tested.passed);
        assert_eq!(store.last_query(), "MATCH (n:Customer) RETURN n LIMIT 1");

        let tested = executor
            .test("MATCH (n:Customer RETURN n", &Params::new(), &CancellationToken::new())
            .await;
        assert!(!tested.passed);
        assert!(tested.execution.is_none());
    }

    #[tokio::test]
    async fn test_test_only_plans_write_queries() {
        let store = Arc::new(RecordingStore::with_rows(1));
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let config = ExecutionConfig {
            read_only: false,
            ..ExecutionConfig::default()
        };
        let executor = QueryExecutor::new(
            store.clone(),
            config,
            ResilientCaller::new(registry, RetryPolicy::none()),
        );

        let tested = executor
            .test(
                "CREATE (c:Customer {name: $name}) RETURN c",
                &Params::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(tested.passed);
        assert_eq!(
            store.queries.lock().unwrap().clone(),
            vec!["EXPLAIN CREATE (c:Customer {name: $name}) RETURN c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_appended_clauses_stay_out_of_trailing_comments() {
        let store = Arc::new(RecordingStore::with_rows(6));
        let (executor, _) = executor(store.clone(), RetryPolicy::none());

        let page = executor
            .execute_paginated(
                "MATCH (n:Order) RETURN n // every order",
                &Params::new(),
                1,
                5,
                &ExecutionOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(page.has_more);
        assert_eq!(page.result.rows.len(), 5);
        assert_eq!(
            store.last_query(),
            "MATCH (n:Order) RETURN n // every order\nSKIP 0 LIMIT 6"
        );

        executor
            .execute_paginated(
                "MATCH (n) RETURN n LIMIT 50 // capped",
                &Params::new(),
                1,
                5,
                &ExecutionOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            store.last_query(),
            "CALL { MATCH (n) RETURN n LIMIT 50 // capped\n} RETURN * SKIP 0 LIMIT 6"
        );

        executor
            .test("MATCH (n:Order) RETURN n // first one", &Params::new(), &CancellationToken::new())
            .await;
        assert_eq!(store.last_query(), "MATCH (n:Order) RETURN n // first one\nLIMIT 1");
    }
}
