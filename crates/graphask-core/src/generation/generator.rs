//! Question to query candidate
//!
//! Templates are tried first. When none qualifies, a prompt is built from
//! the context bundle and handed to the drafter; a draft that fails
//! validation gets one corrected attempt before it is surfaced as invalid.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::params::{
    extract_limit, extract_number_after, extract_property, extract_quoted, label_from_schema,
};
use super::prompt::{Correction, PromptBuilder};
use super::templates::{QueryTemplate, TemplateLibrary, TemplateParam};
use super::validator::{QueryValidator, ValidationResult};
use crate::config::GenerationConfig;
use crate::context::ContextBundle;
use crate::domain::{DomainCatalog, Question, is_identifier};
use crate::error::{Error, Result};
use crate::llm::{DraftOptions, extract_cypher};
use crate::matching::similarity::tokenize;
use crate::providers::{EMBEDDING, EmbeddingProvider, LANGUAGE_MODEL, Params, QueryDrafter};
use crate::resilience::ResilientCaller;

/// Confidence of a drafted query that no catalog entity grounds
const UNGROUNDED_DRAFT_CONFIDENCE: f32 = 0.5;

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    Template,
    Generated,
}

impl std::fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateOrigin::Template => write!(f, "template"),
            CandidateOrigin::Generated => write!(f, "generated"),
        }
    }
}

/// A query produced for one question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCandidate {
    pub query_text: String,
    pub parameters: Params,
    pub origin: CandidateOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub confidence_score: f32,
}

/// A candidate with its validation
///
/// Valid candidates are sanitized; invalid ones keep the rejected text and
/// must not be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub candidate: QueryCandidate,
    pub validation: ValidationResult,
    /// Drafter calls made; zero for template candidates
    pub attempts: u32,
}

impl GenerationOutcome {
    pub fn is_valid(&self) -> bool {
        self.validation.valid
    }
}

/// Turns questions plus context into validated query candidates
pub struct QueryGenerator {
    catalog: Arc<DomainCatalog>,
    config: GenerationConfig,
    template_threshold: f32,
    templates: TemplateLibrary,
    validator: QueryValidator,
    prompts: PromptBuilder,
    caller: ResilientCaller,
    drafter: Option<Arc<dyn QueryDrafter>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    trigger_vectors: OnceCell<Vec<Vec<f32>>>,
}

impl QueryGenerator {
    pub fn new(
        catalog: Arc<DomainCatalog>,
        config: GenerationConfig,
        template_threshold: f32,
        caller: ResilientCaller,
    ) -> Self {
        Self {
            prompts: PromptBuilder::new(catalog.clone()),
            validator: QueryValidator::new(&config),
            catalog,
            config,
            template_threshold,
            templates: TemplateLibrary::builtin(),
            caller,
            drafter: None,
            embedder: None,
            trigger_vectors: OnceCell::new(),
        }
    }

    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = templates;
        self.trigger_vectors = OnceCell::new();
        self
    }

    pub fn with_drafter(mut self, drafter: Arc<dyn QueryDrafter>) -> Self {
        self.drafter = Some(drafter);
        self
    }

    /// Enable semantic template matching
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn templates(&self) -> &TemplateLibrary {
        &self.templates
    }

    pub fn validator(&self) -> &QueryValidator {
        &self.validator
    }

    /// Produce a candidate for the question
    ///
    /// Returns `Ok` with an invalid outcome when the final draft fails
    /// validation. Errors are reserved for drafting failures, a missing
    /// drafter and cancellation.
    pub async fn generate(
        &self,
        question: &Question,
        bundle: &ContextBundle,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(candidate) = self.match_template(question, bundle, cancel).await {
            info!(
                template = candidate.template_id.as_deref().unwrap_or_default(),
                confidence = candidate.confidence_score,
                "Question matched a template"
            );
            let (candidate, validation) = self.finalize(candidate);
            return Ok(GenerationOutcome {
                candidate,
                validation,
                attempts: 0,
            });
        }

        self.draft(question, bundle, cancel).await
    }

    /// Best qualifying template instantiated for the question
    pub async fn match_template(
        &self,
        question: &Question,
        bundle: &ContextBundle,
        cancel: &CancellationToken,
    ) -> Option<QueryCandidate> {
        let words = tokenize(question.text());
        let vectors = match bundle.question_embedding.as_deref() {
            Some(_) if self.embedder.is_some() => match self.trigger_vectors(cancel).await {
                Ok(vectors) => Some(vectors),
                Err(e) => {
                    warn!(error = %e, "Template embeddings unavailable, using lexical matching");
                    None
                }
            },
            _ => None,
        };
        let semantic = bundle
            .question_embedding
            .as_deref()
            .zip(vectors.map(Vec::as_slice));

        for scored in self.templates.rank(&words, semantic, self.template_threshold) {
            match self.instantiate(scored.template, question.text(), bundle) {
                Some((query_text, parameters)) => {
                    return Some(QueryCandidate {
                        query_text,
                        parameters,
                        origin: CandidateOrigin::Template,
                        template_id: Some(scored.template.id.clone()),
                        confidence_score: scored.score,
                    });
                }
                None => debug!(
                    template = %scored.template.id,
                    score = scored.score,
                    "Template parameters not found in question"
                ),
            }
        }
        None
    }

    async fn trigger_vectors(&self, cancel: &CancellationToken) -> Result<&Vec<Vec<f32>>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::EmbeddingFailed("no embedding provider".to_string()))?;

        self.trigger_vectors
            .get_or_try_init(|| async {
                let texts = self.templates.trigger_texts();
                let vectors = self
                    .caller
                    .call(EMBEDDING, cancel, || embedder.embed_batch(&texts, cancel))
                    .await?;
                if vectors.len() != texts.len() {
                    return Err(Error::EmbeddingFailed(format!(
                        "expected {} vectors, got {}",
                        texts.len(),
                        vectors.len()
                    )));
                }
                Ok(vectors)
            })
            .await
    }

    /// Fill a template's parameters from the question and context
    fn instantiate(
        &self,
        template: &QueryTemplate,
        question: &str,
        bundle: &ContextBundle,
    ) -> Option<(String, Params)> {
        let top_entity = bundle.top_entity();
        let label = top_entity
            .map(|m| m.label.clone())
            .or_else(|| {
                bundle
                    .schema
                    .as_ref()
                    .and_then(|schema| label_from_schema(question, schema))
            })
            .filter(|label| is_identifier(label))?;

        let mut params = Params::new();

        let property = if template.requires(TemplateParam::Property) {
            let mut candidates: Vec<String> = top_entity
                .and_then(|m| self.catalog.entity(&m.name))
                .map(|entity| entity.properties.clone())
                .unwrap_or_default();
            if let Some(schema) = &bundle.schema {
                for key in &schema.property_keys {
                    if !candidates.contains(key) {
                        candidates.push(key.clone());
                    }
                }
            }
            Some(extract_property(question, &candidates).filter(|p| is_identifier(p))?)
        } else {
            None
        };

        if template.requires(TemplateParam::Value) {
            let value = extract_quoted(question)
                .map(serde_json::Value::String)
                .or_else(|| {
                    property
                        .as_deref()
                        .and_then(|p| extract_number_after(question, p))
                })?;
            params.insert("value".to_string(), value);
        }

        let limit = match extract_limit(question) {
            Some(limit) => limit,
            None if template.requires(TemplateParam::Limit) => return None,
            None => self.config.default_limit,
        };
        if template.body.contains("$limit") {
            params.insert("limit".to_string(), json!(limit));
        }

        let entity_name = top_entity.map(|m| m.name.as_str());
        let mut predicates = Vec::new();
        for m in &bundle.scope_matches {
            let Some(scope) = self.catalog.scope(&m.name) else {
                continue;
            };
            let applies = match (&scope.entity, entity_name) {
                (None, _) => true,
                (Some(owner), Some(name)) => owner.eq_ignore_ascii_case(name),
                (Some(_), None) => false,
            };
            if !applies {
                continue;
            }
            match scope.to_cypher("n", &mut params) {
                Ok(predicate) if !predicate.is_empty() => predicates.push(predicate),
                Ok(_) => {}
                Err(e) => {
                    debug!(scope = %scope.name, error = %e, "Scope filter not applicable");
                    return None;
                }
            }
        }

        Some((template.render(&label, property.as_deref(), &predicates), params))
    }

    async fn draft(
        &self,
        question: &Question,
        bundle: &ContextBundle,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let drafter = self
            .drafter
            .as_ref()
            .ok_or_else(|| Error::NoDrafter(question.text().to_string()))?;
        let options = DraftOptions {
            model: None,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let grounding = bundle
            .top_entity()
            .map(|m| m.confidence_score)
            .unwrap_or(UNGROUNDED_DRAFT_CONFIDENCE);

        let mut correction: Option<Correction> = None;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let (prompt, parameters) = self.prompts.build(question, bundle, correction.as_ref());
            let response = self
                .caller
                .call(LANGUAGE_MODEL, cancel, || drafter.draft(&prompt, &options, cancel))
                .await?;
            let query_text = extract_cypher(&response);
            let validation = self.validator.validate(&query_text);

            let candidate = QueryCandidate {
                query_text,
                parameters,
                origin: CandidateOrigin::Generated,
                template_id: None,
                confidence_score: grounding / attempts as f32,
            };

            if validation.valid {
                let (candidate, validation) = self.finalize(candidate);
                return Ok(GenerationOutcome {
                    candidate,
                    validation,
                    attempts,
                });
            }

            if attempts > self.config.max_correction_attempts {
                warn!(
                    attempts,
                    errors = ?validation.errors,
                    "Drafted query failed validation"
                );
                return Ok(GenerationOutcome {
                    candidate,
                    validation,
                    attempts,
                });
            }

            debug!(
                attempt = attempts,
                errors = ?validation.errors,
                "Draft rejected, requesting a correction"
            );
            correction = Some(Correction {
                query: candidate.query_text,
                errors: validation.errors,
            });
        }
    }

    /// Sanitize a candidate and validate the sanitized text
    fn finalize(&self, mut candidate: QueryCandidate) -> (QueryCandidate, ValidationResult) {
        let validation = self.validator.validate(&candidate.query_text);
        if !validation.valid {
            return (candidate, validation);
        }

        let had_limit = self.validator.has_limit(&candidate.query_text);
        candidate.query_text = self.validator.sanitize(&candidate.query_text);
        let mut validation = self.validator.validate(&candidate.query_text);
        if !had_limit {
            validation.warnings.push(format!(
                "Default LIMIT {} appended",
                self.validator.default_limit()
            ));
        }
        (candidate, validation)
    }
}
