//! Question to executed query, end to end
//!
//! Context assembly, generation and execution run in sequence for one
//! question. The outcome is either the candidate with its validation and
//! execution, or a [`PipelineFailure`] naming the stage that stopped it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{ContextAssembler, ContextIssue, TokenStats};
use crate::domain::{DomainCatalog, Question};
use crate::error::Error;
use crate::execution::{ExecutionOptions, ExecutionResult, QueryExecutor};
use crate::generation::{QueryCandidate, QueryGenerator, TemplateLibrary, ValidationResult};
use crate::matching::ScopeEntityMatcher;
use crate::providers::{
    EmbeddingProvider, GraphStore, QueryDrafter, SchemaProvider, SimilaritySearch,
    StoreSchemaProvider,
};
use crate::resilience::{CircuitBreakerRegistry, ResilientCaller};

/// Stage that stopped a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    InvalidQuestion,
    ContextAssemblyDegraded,
    GenerationFailed,
    GenerationInvalid,
    PolicyViolation,
    ExecutionFailed,
    BreakerOpen,
    Timeout,
    Cancelled,
}

impl FailureStage {
    /// Stage implied by an error, or `fallback` for ordinary failures
    fn for_error(error: &Error, fallback: FailureStage) -> Self {
        match error {
            Error::BreakerOpen(_) => Self::BreakerOpen,
            Error::Timeout { .. } => Self::Timeout,
            Error::Cancelled => Self::Cancelled,
            Error::PolicyViolation(_) => Self::PolicyViolation,
            Error::InvalidInput(_) => Self::InvalidQuestion,
            _ => fallback,
        }
    }

    /// Stage implied by an execution error code
    fn for_execution_code(code: &str) -> Self {
        match code {
            "E400" => Self::BreakerOpen,
            "E301" => Self::Timeout,
            "E500" => Self::PolicyViolation,
            "E700" => Self::Cancelled,
            _ => Self::ExecutionFailed,
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidQuestion => "invalid-question",
            Self::ContextAssemblyDegraded => "context-assembly-degraded",
            Self::GenerationFailed => "generation-failed",
            Self::GenerationInvalid => "generation-invalid",
            Self::PolicyViolation => "policy-violation",
            Self::ExecutionFailed => "execution-failed",
            Self::BreakerOpen => "breaker-open",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A question that could not be answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{stage} [{code}]: {reason}")]
pub struct PipelineFailure {
    pub request_id: Uuid,
    pub stage: FailureStage,
    pub code: String,
    pub reason: String,
    pub errors: Vec<String>,
    /// The rejected or failed candidate, when one was produced
    pub candidate: Option<QueryCandidate>,
}

impl PipelineFailure {
    fn from_error(request_id: Uuid, error: &Error, fallback: FailureStage) -> Self {
        Self {
            request_id,
            stage: FailureStage::for_error(error, fallback),
            code: error.code().to_string(),
            reason: error.to_string(),
            errors: error.suggestion().into_iter().collect(),
            candidate: None,
        }
    }
}

/// A question answered with a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub request_id: Uuid,
    pub candidate: QueryCandidate,
    pub validation: ValidationResult,
    /// `None` for dry runs
    pub execution: Option<ExecutionResult>,
    pub context_stats: TokenStats,
    pub context_errors: Vec<ContextIssue>,
    pub degraded: bool,
}

/// Per-question switches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOptions {
    /// Stop after validation
    pub dry_run: bool,
    /// Fail instead of continuing with partial context
    pub fail_on_degraded_context: bool,
    /// Overrides the configured token budget
    pub token_budget: Option<usize>,
    pub execution: ExecutionOptions,
}

impl PipelineOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }
}

/// Runs questions through assembly, generation and execution
pub struct QueryPipeline {
    assembler: ContextAssembler,
    generator: QueryGenerator,
    executor: QueryExecutor,
    registry: Arc<CircuitBreakerRegistry>,
}

impl QueryPipeline {
    pub fn new(
        assembler: ContextAssembler,
        generator: QueryGenerator,
        executor: QueryExecutor,
        registry: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            assembler,
            generator,
            executor,
            registry,
        }
    }

    /// Start wiring a pipeline from configuration and the graph store
    pub fn builder(
        config: Config,
        catalog: Arc<DomainCatalog>,
        store: Arc<dyn GraphStore>,
    ) -> QueryPipelineBuilder {
        QueryPipelineBuilder::new(config, catalog, store)
    }

    /// Breakers shared by every component of this pipeline
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    pub fn generator(&self) -> &QueryGenerator {
        &self.generator
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Answer one question
    pub async fn ask(
        &self,
        question: &Question,
        options: &PipelineOptions,
        cancel: &CancellationToken,
    ) -> std::result::Result<PipelineOutcome, PipelineFailure> {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask", %request_id);
        self.run(request_id, question, options, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        request_id: Uuid,
        question: &Question,
        options: &PipelineOptions,
        cancel: &CancellationToken,
    ) -> std::result::Result<PipelineOutcome, PipelineFailure> {
        if let Err(e) = question.validate() {
            return Err(PipelineFailure::from_error(request_id, &e, FailureStage::InvalidQuestion));
        }

        let budget = options.token_budget.or(self.assembler.config().token_budget);
        let bundle = self
            .assembler
            .assemble_with_budget(question, budget, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(PipelineFailure::from_error(request_id, &Error::Cancelled, FailureStage::Cancelled));
        }

        let degraded = bundle.is_degraded();
        if degraded && options.fail_on_degraded_context {
            warn!(errors = bundle.errors.len(), "Context degraded, stopping");
            return Err(PipelineFailure {
                request_id,
                stage: FailureStage::ContextAssemblyDegraded,
                code: bundle
                    .errors
                    .first()
                    .map(|issue| issue.code.clone())
                    .unwrap_or_else(|| "E100".to_string()),
                reason: "One or more context sources failed".to_string(),
                errors: bundle.errors.iter().map(ToString::to_string).collect(),
                candidate: None,
            });
        }

        let generated = match self.generator.generate(question, &bundle, cancel).await {
            Ok(generated) => generated,
            Err(e) => {
                warn!(error = %e, "Query generation failed");
                return Err(PipelineFailure::from_error(request_id, &e, FailureStage::GenerationFailed));
            }
        };

        if !generated.validation.valid {
            let error = if generated.validation.policy_violation {
                Error::PolicyViolation(generated.validation.errors.join("; "))
            } else {
                Error::GenerationInvalid(generated.validation.errors.clone())
            };
            return Err(PipelineFailure {
                request_id,
                stage: if generated.validation.policy_violation {
                    FailureStage::PolicyViolation
                } else {
                    FailureStage::GenerationInvalid
                },
                code: error.code().to_string(),
                reason: error.to_string(),
                errors: generated.validation.errors,
                candidate: Some(generated.candidate),
            });
        }

        let context_stats = bundle.token_stats.clone();
        let context_errors = bundle.errors;

        if options.dry_run {
            info!(origin = %generated.candidate.origin, "Dry run, query not executed");
            return Ok(PipelineOutcome {
                request_id,
                candidate: generated.candidate,
                validation: generated.validation,
                execution: None,
                context_stats,
                context_errors,
                degraded,
            });
        }

        let execution = self
            .executor
            .execute(
                &generated.candidate.query_text,
                &generated.candidate.parameters,
                &options.execution,
                cancel,
            )
            .await;

        if !execution.success {
            let code = execution.error_code().unwrap_or("E9999").to_string();
            return Err(PipelineFailure {
                request_id,
                stage: FailureStage::for_execution_code(&code),
                reason: execution
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "Query execution failed".to_string()),
                code,
                errors: execution.errors.iter().map(ToString::to_string).collect(),
                candidate: Some(generated.candidate),
            });
        }

        info!(
            origin = %generated.candidate.origin,
            rows = execution.stats.row_count,
            degraded,
            "Question answered"
        );
        Ok(PipelineOutcome {
            request_id,
            candidate: generated.candidate,
            validation: generated.validation,
            execution: Some(execution),
            context_stats,
            context_errors,
            degraded,
        })
    }
}

/// Wires a [`QueryPipeline`] from configuration and collaborators
///
/// The schema defaults to the graph store's own schema. Without a drafter
/// only template questions can be answered.
pub struct QueryPipelineBuilder {
    config: Config,
    catalog: Arc<DomainCatalog>,
    store: Arc<dyn GraphStore>,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    schema_provider: Option<Arc<dyn SchemaProvider>>,
    similarity: Option<Arc<dyn SimilaritySearch>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    drafter: Option<Arc<dyn QueryDrafter>>,
    templates: Option<TemplateLibrary>,
}

impl QueryPipelineBuilder {
    pub fn new(config: Config, catalog: Arc<DomainCatalog>, store: Arc<dyn GraphStore>) -> Self {
        Self {
            config,
            catalog,
            store,
            registry: None,
            schema_provider: None,
            similarity: None,
            embedder: None,
            drafter: None,
            templates: None,
        }
    }

    /// Share breakers with other pipelines in the process
    pub fn with_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema_provider = Some(provider);
        self
    }

    pub fn with_similarity_search(mut self, search: Arc<dyn SimilaritySearch>) -> Self {
        self.similarity = Some(search);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_drafter(mut self, drafter: Arc<dyn QueryDrafter>) -> Self {
        self.drafter = Some(drafter);
        self
    }

    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn build(self) -> QueryPipeline {
        let config = self.config;
        let caller = match self.registry {
            Some(registry) => ResilientCaller::new(registry, (&config.retry).into()),
            None => ResilientCaller::from_config(&config),
        }
        .with_timeout(Duration::from_millis(config.execution.timeout_ms));
        let registry = caller.registry().clone();

        let mut matcher =
            ScopeEntityMatcher::new(self.catalog.clone(), config.matching.clone(), caller.clone());
        if let Some(embedder) = &self.embedder {
            matcher = matcher.with_embedder(embedder.clone());
        }

        let schema_provider = self
            .schema_provider
            .unwrap_or_else(|| Arc::new(StoreSchemaProvider::new(self.store.clone())));
        let mut assembler =
            ContextAssembler::new(config.context.clone(), Arc::new(matcher), caller.clone())
                .with_schema_provider(schema_provider);
        if let Some(search) = self.similarity {
            assembler = assembler.with_similarity_search(search);
        }

        let mut generator = QueryGenerator::new(
            self.catalog,
            config.generation.clone(),
            config.matching.template_threshold,
            caller.clone(),
        );
        if let Some(templates) = self.templates {
            generator = generator.with_templates(templates);
        }
        if let Some(drafter) = self.drafter {
            generator = generator.with_drafter(drafter);
        }
        if let Some(embedder) = self.embedder {
            if config.matching.semantic_enabled {
                generator = generator.with_embedder(embedder.clone());
            }
            assembler = assembler.with_embedder(embedder);
        }

        let executor = QueryExecutor::new(self.store, config.execution.clone(), caller);
        QueryPipeline::new(assembler, generator, executor, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_for_error() {
        assert_eq!(
            FailureStage::for_error(&Error::BreakerOpen("x".into()), FailureStage::GenerationFailed),
            FailureStage::BreakerOpen
        );
        assert_eq!(
            FailureStage::for_error(
                &Error::Timeout {
                    dependency: "x".into(),
                    timeout_ms: 5
                },
                FailureStage::GenerationFailed
            ),
            FailureStage::Timeout
        );
        assert_eq!(
            FailureStage::for_error(&Error::transient("x", "y"), FailureStage::GenerationFailed),
            FailureStage::GenerationFailed
        );
    }

    #[test]
    fn test_stage_for_execution_code() {
        assert_eq!(FailureStage::for_execution_code("E400"), FailureStage::BreakerOpen);
        assert_eq!(FailureStage::for_execution_code("E301"), FailureStage::Timeout);
        assert_eq!(FailureStage::for_execution_code("E300"), FailureStage::ExecutionFailed);
    }

    #[test]
    fn test_failure_display() {
        let failure = PipelineFailure::from_error(
            Uuid::nil(),
            &Error::BreakerOpen("graph-store".into()),
            FailureStage::ExecutionFailed,
        );
        assert!(failure.to_string().starts_with("breaker-open [E400]:"));
    }
}
