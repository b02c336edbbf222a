//! Context assembly under a token budget

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bundle::{
    ContextBundle, ContextIssue, ContextItemKind, Exemplar, ExcludedItem, TokenStats,
};
use super::tokens::TokenEstimator;
use crate::config::ContextConfig;
use crate::domain::{DomainCatalog, Question};
use crate::error::Result;
use crate::matching::{EntityMatch, MatchResults, ScopeEntityMatcher, ScopeMatch};
use crate::providers::{
    EMBEDDING, EmbeddingProvider, SCHEMA, SIMILARITY_SEARCH, SchemaProvider, SchemaSnapshot,
    SearchHit, SimilaritySearch,
};
use crate::resilience::ResilientCaller;

/// A candidate item considered for the budget
#[derive(Debug, Clone)]
struct Candidate {
    kind: ContextItemKind,
    index: usize,
    name: String,
    score: f32,
    tokens: usize,
}

/// Builds one [`ContextBundle`] per question
///
/// Similarity search, schema retrieval and matching run concurrently. A
/// failing source leaves its section empty and is recorded in
/// [`ContextBundle::errors`]; assembly itself never fails.
pub struct ContextAssembler {
    config: ContextConfig,
    matcher: Arc<ScopeEntityMatcher>,
    caller: ResilientCaller,
    estimator: TokenEstimator,
    schema_provider: Option<Arc<dyn SchemaProvider>>,
    similarity: Option<Arc<dyn SimilaritySearch>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig, matcher: Arc<ScopeEntityMatcher>, caller: ResilientCaller) -> Self {
        let estimator = TokenEstimator::new(config.words_to_tokens_ratio);
        Self {
            config,
            matcher,
            caller,
            estimator,
            schema_provider: None,
            similarity: None,
            embedder: None,
        }
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

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Assemble with the configured token budget
    pub async fn assemble(&self, question: &Question, cancel: &CancellationToken) -> ContextBundle {
        self.assemble_with_budget(question, self.config.token_budget, cancel)
            .await
    }

    /// Assemble with an explicit token budget; `None` keeps every item
    pub async fn assemble_with_budget(
        &self,
        question: &Question,
        budget: Option<usize>,
        cancel: &CancellationToken,
    ) -> ContextBundle {
        let text = question.text();
        let mut errors = Vec::new();

        let question_vector = match self.embed_question(text, cancel).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "Question embedding failed");
                errors.push(ContextIssue::from_error(EMBEDDING, &e));
                None
            }
        };

        let (exemplars, schema, matches) = tokio::join!(
            self.search_exemplars(question_vector.as_deref(), cancel),
            self.fetch_schema(cancel),
            self.matcher
                .match_with_embedding(text, question_vector.as_deref(), cancel),
        );

        let exemplars = match exemplars {
            Ok(exemplars) => exemplars,
            Err(e) => {
                warn!(error = %e, "Exemplar search failed, continuing without exemplars");
                errors.push(ContextIssue::from_error(SIMILARITY_SEARCH, &e));
                Vec::new()
            }
        };
        let schema = match schema {
            Ok(schema) => schema,
            Err(e) => {
                warn!(error = %e, "Schema retrieval failed, continuing without schema");
                errors.push(ContextIssue::from_error(SCHEMA, &e));
                None
            }
        };
        errors.extend(matches.errors.iter().map(|message| ContextIssue {
            source: "matching".to_string(),
            code: message
                .strip_prefix('[')
                .and_then(|rest| rest.split_once(']'))
                .map(|(code, _)| code.to_string())
                .unwrap_or_else(|| "E101".to_string()),
            message: message.clone(),
        }));

        let mut bundle = self.apply_budget(schema, exemplars, matches, budget, errors);
        bundle.question_embedding = question_vector;
        debug!(
            tokens = bundle.token_stats.estimated_tokens,
            included = bundle.token_stats.items_included,
            excluded = bundle.token_stats.items_excluded,
            degraded = bundle.is_degraded(),
            "Assembled context"
        );
        bundle
    }

    async fn embed_question(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<f32>>> {
        let Some(embedder) = self.embedder.as_ref() else {
            return Ok(None);
        };
        if self.similarity.is_none() && !self.matcher.semantic_available() {
            return Ok(None);
        }
        let vector = self
            .caller
            .call(EMBEDDING, cancel, || embedder.embed(text, cancel))
            .await?;
        Ok(Some(vector))
    }

    async fn search_exemplars(
        &self,
        question_vector: Option<&[f32]>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Exemplar>> {
        let (Some(search), Some(vector)) = (self.similarity.as_ref(), question_vector) else {
            return Ok(Vec::new());
        };
        if self.config.exemplar_limit == 0 {
            return Ok(Vec::new());
        }

        let limit = self.config.exemplar_limit;
        let hits = self
            .caller
            .call(SIMILARITY_SEARCH, cancel, || search.search(vector, limit, cancel))
            .await?;

        let mut exemplars: Vec<Exemplar> = hits
            .iter()
            .filter(|hit| hit.score >= self.config.exemplar_threshold)
            .filter_map(exemplar_from_hit)
            .collect();
        exemplars.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
        exemplars.truncate(limit);
        Ok(exemplars)
    }

    async fn fetch_schema(&self, cancel: &CancellationToken) -> Result<Option<SchemaSnapshot>> {
        if !self.config.include_schema {
            return Ok(None);
        }
        let Some(provider) = self.schema_provider.as_ref() else {
            return Ok(None);
        };
        let schema = self
            .caller
            .call(SCHEMA, cancel, || provider.get_schema(cancel))
            .await?;
        Ok(Some(schema))
    }

    /// Rank every item and keep the longest prefix that fits the budget
    ///
    /// Ranking is by score descending; the schema scores 1.0 and wins ties,
    /// so it is only dropped when nothing else fits. Stopping at the first
    /// item that does not fit keeps every excluded item ranked below every
    /// included one.
    fn apply_budget(
        &self,
        schema: Option<SchemaSnapshot>,
        exemplars: Vec<Exemplar>,
        matches: MatchResults,
        budget: Option<usize>,
        errors: Vec<ContextIssue>,
    ) -> ContextBundle {
        let catalog = self.matcher.catalog();
        let mut candidates = Vec::new();

        if let Some(schema) = &schema {
            candidates.push(Candidate {
                kind: ContextItemKind::Schema,
                index: 0,
                name: "schema".to_string(),
                score: 1.0,
                tokens: self.estimator.estimate(&schema.to_prompt_text()),
            });
        }
        for (index, m) in matches.entities.iter().enumerate() {
            candidates.push(Candidate {
                kind: ContextItemKind::Entity,
                index,
                name: m.name.clone(),
                score: m.confidence_score,
                tokens: self.estimator.estimate(&describe_entity(catalog, m)),
            });
        }
        for (index, m) in matches.scopes.iter().enumerate() {
            candidates.push(Candidate {
                kind: ContextItemKind::Scope,
                index,
                name: m.name.clone(),
                score: m.confidence_score,
                tokens: self.estimator.estimate(&describe_scope(catalog, m)),
            });
        }
        for (index, e) in exemplars.iter().enumerate() {
            candidates.push(Candidate {
                kind: ContextItemKind::Exemplar,
                index,
                name: e.prior_question.clone(),
                score: e.similarity_score,
                tokens: self.estimator.estimate(&describe_exemplar(e)),
            });
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.kind.cmp(&b.kind))
                .then(a.index.cmp(&b.index))
        });

        let mut used = 0usize;
        let mut cut = candidates.len();
        if let Some(budget) = budget {
            for (i, candidate) in candidates.iter().enumerate() {
                if used + candidate.tokens > budget {
                    cut = i;
                    break;
                }
                used += candidate.tokens;
            }
        } else {
            used = candidates.iter().map(|c| c.tokens).sum();
        }

        let excluded_candidates = candidates.split_off(cut);
        let keeps = |kind: ContextItemKind, index: usize| {
            candidates
                .iter()
                .any(|c| c.kind == kind && c.index == index)
        };

        let schema = schema.filter(|_| keeps(ContextItemKind::Schema, 0));
        let exemplars = retain_indexed(exemplars, |i| keeps(ContextItemKind::Exemplar, i));
        let entity_matches = retain_indexed(matches.entities, |i| keeps(ContextItemKind::Entity, i));
        let scope_matches = retain_indexed(matches.scopes, |i| keeps(ContextItemKind::Scope, i));

        let excluded: Vec<ExcludedItem> = excluded_candidates
            .into_iter()
            .map(|c| ExcludedItem {
                kind: c.kind,
                name: c.name,
                score: c.score,
                tokens: c.tokens,
            })
            .collect();

        if !excluded.is_empty() {
            debug!(
                excluded = excluded.len(),
                budget = ?budget,
                "Trimmed context to token budget"
            );
        }

        ContextBundle {
            schema,
            exemplars,
            entity_matches,
            scope_matches,
            token_stats: TokenStats {
                estimated_tokens: used,
                budget,
                items_included: candidates.len(),
                items_excluded: excluded.len(),
            },
            excluded,
            match_mode: matches.mode,
            errors,
            question_embedding: None,
        }
    }
}

fn retain_indexed<T>(items: Vec<T>, mut keep: impl FnMut(usize) -> bool) -> Vec<T> {
    items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| keep(i).then_some(item))
        .collect()
}

/// Read an exemplar from a search payload
///
/// Payloads carry `question` and `query` (or `cypher`) string fields.
fn exemplar_from_hit(hit: &SearchHit) -> Option<Exemplar> {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| hit.payload.get(*name).and_then(Value::as_str))
            .map(str::to_string)
    };
    let question = field(&["question", "prior_question"])?;
    let query = field(&["query", "cypher", "prior_query"])?;
    Some(Exemplar::new(question, query, hit.score))
}

/// Prompt text for a matched entity
pub(crate) fn describe_entity(catalog: &DomainCatalog, m: &EntityMatch) -> String {
    let mut text = format!("Entity {} is stored as (:{})", m.name, m.label);
    if let Some(entity) = catalog.entity(&m.name) {
        if !entity.properties.is_empty() {
            text.push_str(&format!(" with properties {}", entity.properties.join(", ")));
        }
        for relationship in &entity.relationships {
            text.push_str(&format!("; {}", relationship.pattern(entity.label())));
        }
    }
    text
}

/// Prompt text for a matched scope
pub(crate) fn describe_scope(catalog: &DomainCatalog, m: &ScopeMatch) -> String {
    let description = catalog
        .scope(&m.name)
        .map(|s| s.description.as_str())
        .unwrap_or_default();
    format!("Scope \"{}\": {}", m.name, description)
}

pub(crate) fn describe_exemplar(exemplar: &Exemplar) -> String {
    format!(
        "Question: {}\nCypher: {}",
        exemplar.prior_question, exemplar.prior_query
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingConfig;
    use crate::domain::{EntityDefinition, ScopeDefinition};
    use crate::error::Error;
    use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedSchema(Option<SchemaSnapshot>);

    #[async_trait]
    impl SchemaProvider for FixedSchema {
        async fn get_schema(&self, _cancel: &CancellationToken) -> Result<SchemaSnapshot> {
            self.0
                .clone()
                .ok_or_else(|| Error::SchemaUnavailable("connection refused".to_string()))
        }
    }

    struct FixedSearch(Vec<SearchHit>);

    #[async_trait]
    impl SimilaritySearch for FixedSearch {
        async fn search(
            &self,
            _embedding: &[f32],
            limit: usize,
            _cancel: &CancellationToken,
        ) -> Result<Vec<SearchHit>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    struct FailingSearch;

    #[async_trait]
    impl SimilaritySearch for FailingSearch {
        async fn search(
            &self,
            _embedding: &[f32],
            _limit: usize,
            _cancel: &CancellationToken,
        ) -> Result<Vec<SearchHit>> {
            Err(Error::provider("similarity-search", "index missing"))
        }
    }

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        async fn embed(&self, _text: &str, _cancel: &CancellationToken) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn caller() -> ResilientCaller {
        ResilientCaller::new(Arc::new(CircuitBreakerRegistry::default()), RetryPolicy::none())
    }

    fn matcher() -> Arc<ScopeEntityMatcher> {
        let catalog = DomainCatalog::new(
            vec![
                EntityDefinition::new("Customer")
                    .with_aliases(["client"])
                    .with_properties(["name", "email"]),
                EntityDefinition::new("Order"),
            ],
            vec![ScopeDefinition::new("active", "Customers who ordered recently")],
        );
        let config = MatchingConfig {
            semantic_enabled: false,
            ..MatchingConfig::default()
        };
        Arc::new(ScopeEntityMatcher::new(Arc::new(catalog), config, caller()))
    }

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(
            vec!["Customer".into(), "Order".into()],
            vec!["PLACED".into()],
            vec!["name".into(), "email".into(), "total".into()],
        )
    }

    fn hits() -> Vec<SearchHit> {
        vec![
            SearchHit {
                payload: json!({"question": "list clients", "query": "MATCH (c:Customer) RETURN c"}),
                score: 0.92,
            },
            SearchHit {
                payload: json!({"question": "count orders", "cypher": "MATCH (o:Order) RETURN count(o)"}),
                score: 0.81,
            },
            SearchHit {
                payload: json!({"question": "unrelated", "query": "RETURN 1"}),
                score: 0.40,
            },
            SearchHit {
                payload: json!({"note": "no question field"}),
                score: 0.99,
            },
        ]
    }

    fn assembler() -> ContextAssembler {
        ContextAssembler::new(ContextConfig::default(), matcher(), caller())
            .with_schema_provider(Arc::new(FixedSchema(Some(schema()))))
            .with_similarity_search(Arc::new(FixedSearch(hits())))
            .with_embedder(Arc::new(UnitEmbedder))
    }

    #[tokio::test]
    async fn test_assembles_all_sources() {
        let bundle = assembler()
            .assemble(&Question::new("show active clients"), &CancellationToken::new())
            .await;

        assert!(!bundle.is_degraded());
        assert_eq!(bundle.schema, Some(schema()));
        assert_eq!(bundle.exemplars.len(), 2);
        assert_eq!(bundle.exemplars[0].prior_question, "list clients");
        assert_eq!(bundle.exemplars[1].prior_query, "MATCH (o:Order) RETURN count(o)");
        assert_eq!(bundle.top_entity().unwrap().name, "Customer");
        assert_eq!(bundle.scope_matches[0].name, "active");
        assert_eq!(bundle.token_stats.items_included, 5);
        assert_eq!(bundle.token_stats.items_excluded, 0);
        assert_eq!(bundle.token_stats.budget, None);
    }

    #[tokio::test]
    async fn test_failed_sources_degrade_gracefully() {
        let assembler = ContextAssembler::new(ContextConfig::default(), matcher(), caller())
            .with_schema_provider(Arc::new(FixedSchema(None)))
            .with_similarity_search(Arc::new(FailingSearch))
            .with_embedder(Arc::new(UnitEmbedder));

        let bundle = assembler
            .assemble(&Question::new("show clients"), &CancellationToken::new())
            .await;

        assert!(bundle.is_degraded());
        assert!(bundle.schema.is_none());
        assert!(bundle.exemplars.is_empty());
        let sources: Vec<_> = bundle.errors.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(sources, vec!["similarity-search", "schema"]);
        assert_eq!(bundle.errors[1].code, "E102");
        assert_eq!(bundle.top_entity().unwrap().name, "Customer");
    }

    #[tokio::test]
    async fn test_schema_can_be_disabled() {
        let config = ContextConfig {
            include_schema: false,
            ..ContextConfig::default()
        };
        let assembler = ContextAssembler::new(config, matcher(), caller())
            .with_schema_provider(Arc::new(FixedSchema(Some(schema()))));
        let bundle = assembler
            .assemble(&Question::new("anything"), &CancellationToken::new())
            .await;
        assert!(bundle.schema.is_none());
        assert!(!bundle.is_degraded());
    }

    #[tokio::test]
    async fn test_budget_holds_and_drops_lowest_first() {
        let assembler = assembler();
        let question = Question::new("show active clients");
        let full = assembler
            .assemble_with_budget(&question, None, &CancellationToken::new())
            .await;

        for budget in 0..=full.token_stats.estimated_tokens + 5 {
            let bundle = assembler
                .assemble_with_budget(&question, Some(budget), &CancellationToken::new())
                .await;
            let stats = &bundle.token_stats;
            assert!(stats.estimated_tokens <= budget);
            assert_eq!(stats.items_included + stats.items_excluded, 5);

            let mut included_scores: Vec<f32> = bundle
                .exemplars
                .iter()
                .map(|e| e.similarity_score)
                .chain(bundle.entity_matches.iter().map(|m| m.confidence_score))
                .chain(bundle.scope_matches.iter().map(|m| m.confidence_score))
                .collect();
            if bundle.schema.is_some() {
                included_scores.push(1.0);
            }
            let min_included = included_scores.iter().cloned().fold(f32::INFINITY, f32::min);
            for excluded in &bundle.excluded {
                assert!(excluded.score <= min_included);
            }
        }
    }

    #[tokio::test]
    async fn test_tight_budget_drops_exemplars_before_schema() {
        let assembler = assembler();
        let question = Question::new("show active clients");
        let full = assembler
            .assemble_with_budget(&question, None, &CancellationToken::new())
            .await;
        let exemplar_tokens: usize = full
            .exemplars
            .iter()
            .map(|e| assembler.estimator().estimate(&describe_exemplar(e)))
            .sum();

        let budget = full.token_stats.estimated_tokens - exemplar_tokens;
        let bundle = assembler
            .assemble_with_budget(&question, Some(budget), &CancellationToken::new())
            .await;

        assert!(bundle.schema.is_some());
        assert!(bundle.exemplars.is_empty());
        assert_eq!(bundle.token_stats.items_excluded, 2);
        assert!(
            bundle
                .excluded
                .iter()
                .all(|item| item.kind == ContextItemKind::Exemplar)
        );
    }

    #[test]
    fn test_exemplar_from_hit_requires_fields() {
        let hit = SearchHit {
            payload: json!({"question": "q"}),
            score: 0.9,
        };
        assert!(exemplar_from_hit(&hit).is_none());
    }
}
