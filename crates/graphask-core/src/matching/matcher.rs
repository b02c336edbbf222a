//! Scope and entity matching
//!
//! Maps phrases in a question onto catalog entities (by canonical name or
//! alias) and scopes (by name, description or example phrasing). Semantic
//! mode scores each target by embedding cosine similarity, while lexical
//! mode only accepts case-insensitive word matches, which score 1.0.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::similarity::{cosine_similarity, find_phrase, tokenize};
use crate::config::MatchingConfig;
use crate::domain::DomainCatalog;
use crate::error::{Error, Result};
use crate::providers::{EMBEDDING, EmbeddingProvider};
use crate::resilience::ResilientCaller;

/// Which kind of target produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    EntityName,
    EntityAlias,
    ScopeName,
    ScopeDescription,
    ScopeExample,
}

/// A question phrase resolved to a catalog entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMatch {
    pub name: String,
    /// Graph label of the entity
    pub label: String,
    pub matched_phrase: String,
    pub confidence_score: f32,
    pub source_category: SourceCategory,
}

/// A question phrase resolved to a named scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeMatch {
    pub name: String,
    pub entity: Option<String>,
    pub matched_phrase: String,
    pub confidence_score: f32,
    pub source_category: SourceCategory,
}

/// How the scores were computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Semantic,
    Lexical,
}

/// Matches for one question, each list sorted by descending score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResults {
    pub entities: Vec<EntityMatch>,
    pub scopes: Vec<ScopeMatch>,
    pub mode: MatchMode,
    /// Non-fatal problems, e.g. the embedding service being down
    pub errors: Vec<String>,
}

impl MatchResults {
    pub fn top_entity(&self) -> Option<&EntityMatch> {
        self.entities.first()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.scopes.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Target {
    owner: usize,
    text: String,
    category: SourceCategory,
}

#[derive(Debug, Clone)]
struct Candidate {
    score: f32,
    phrase: String,
    category: SourceCategory,
}

/// Scores catalog entities and scopes against question text
pub struct ScopeEntityMatcher {
    catalog: Arc<DomainCatalog>,
    config: MatchingConfig,
    caller: ResilientCaller,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    entity_targets: Vec<Target>,
    scope_targets: Vec<Target>,
    target_vectors: OnceCell<Vec<Vec<f32>>>,
}

impl ScopeEntityMatcher {
    pub fn new(catalog: Arc<DomainCatalog>, config: MatchingConfig, caller: ResilientCaller) -> Self {
        let entity_targets = catalog
            .entities
            .iter()
            .enumerate()
            .flat_map(|(owner, entity)| {
                entity
                    .match_targets()
                    .into_iter()
                    .enumerate()
                    .map(move |(i, text)| Target {
                        owner,
                        text: text.to_string(),
                        category: if i == 0 {
                            SourceCategory::EntityName
                        } else {
                            SourceCategory::EntityAlias
                        },
                    })
            })
            .collect();

        let mut scope_targets = Vec::new();
        for (owner, scope) in catalog.scopes.iter().enumerate() {
            let has_description = !scope.description.trim().is_empty();
            for (i, text) in scope.match_targets().into_iter().enumerate() {
                let category = match i {
                    0 => SourceCategory::ScopeName,
                    1 if has_description => SourceCategory::ScopeDescription,
                    _ => SourceCategory::ScopeExample,
                };
                scope_targets.push(Target {
                    owner,
                    text: text.to_string(),
                    category,
                });
            }
        }

        Self {
            catalog,
            config,
            caller,
            embedder: None,
            entity_targets,
            scope_targets,
            target_vectors: OnceCell::new(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn catalog(&self) -> &DomainCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Whether embedding similarity can be used at all
    pub fn semantic_available(&self) -> bool {
        self.config.semantic_enabled && self.embedder.is_some()
    }

    /// Lexical-only matching, no external calls
    pub fn match_lexical(&self, question: &str) -> MatchResults {
        self.score(question, None, Vec::new())
    }

    /// Match a question, embedding it first when semantic matching is on
    pub async fn match_question(&self, question: &str, cancel: &CancellationToken) -> MatchResults {
        if !self.semantic_available() {
            return self.match_lexical(question);
        }
        let Some(embedder) = self.embedder.as_ref() else {
            return self.match_lexical(question);
        };

        let vector = self
            .caller
            .call(EMBEDDING, cancel, || embedder.embed(question, cancel))
            .await;
        match vector {
            Ok(vector) => self.match_with_embedding(question, Some(&vector), cancel).await,
            Err(e) => {
                warn!(error = %e, "Question embedding failed, using lexical matching");
                self.score(question, None, vec![format!("[{}] {}", e.code(), e)])
            }
        }
    }

    /// Match a question whose embedding was already computed by the caller
    pub async fn match_with_embedding(
        &self,
        question: &str,
        question_vector: Option<&[f32]>,
        cancel: &CancellationToken,
    ) -> MatchResults {
        let Some(question_vector) = question_vector.filter(|_| self.semantic_available()) else {
            return self.match_lexical(question);
        };

        match self.target_vectors(cancel).await {
            Ok(targets) => self.score(question, Some((question_vector, targets)), Vec::new()),
            Err(e) => {
                warn!(error = %e, "Target embeddings unavailable, using lexical matching");
                self.score(question, None, vec![format!("[{}] {}", e.code(), e)])
            }
        }
    }

    async fn target_vectors(&self, cancel: &CancellationToken) -> Result<&Vec<Vec<f32>>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::EmbeddingFailed("no embedding provider".to_string()))?;
        let expected = self.entity_targets.len() + self.scope_targets.len();

        self.target_vectors
            .get_or_try_init(|| async {
                let texts: Vec<String> = self
                    .entity_targets
                    .iter()
                    .chain(&self.scope_targets)
                    .map(|t| t.text.clone())
                    .collect();
                let vectors = self
                    .caller
                    .call(EMBEDDING, cancel, || embedder.embed_batch(&texts, cancel))
                    .await?;
                if vectors.len() != expected {
                    return Err(Error::EmbeddingFailed(format!(
                        "expected {} vectors, got {}",
                        expected,
                        vectors.len()
                    )));
                }
                debug!(targets = expected, "Embedded catalog match targets");
                Ok(vectors)
            })
            .await
    }

    fn score(
        &self,
        question: &str,
        semantic: Option<(&[f32], &Vec<Vec<f32>>)>,
        errors: Vec<String>,
    ) -> MatchResults {
        let words = tokenize(question);
        let (entity_vectors, scope_vectors) = match semantic {
            Some((_, vectors)) => {
                let (e, s) = vectors.split_at(self.entity_targets.len().min(vectors.len()));
                (Some(e), Some(s))
            }
            None => (None, None),
        };
        let question_vector = semantic.map(|(q, _)| q);

        let entity_best = best_per_owner(
            &self.entity_targets,
            self.catalog.entities.len(),
            &words,
            question_vector.zip(entity_vectors),
        );
        let scope_best = best_per_owner(
            &self.scope_targets,
            self.catalog.scopes.len(),
            &words,
            question_vector.zip(scope_vectors),
        );

        let mut entities: Vec<EntityMatch> = entity_best
            .into_iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|c| (i, c)))
            .filter(|(_, c)| c.score >= self.config.entity_threshold)
            .map(|(i, c)| {
                let entity = &self.catalog.entities[i];
                EntityMatch {
                    name: entity.name.clone(),
                    label: entity.label().to_string(),
                    matched_phrase: c.phrase,
                    confidence_score: c.score,
                    source_category: c.category,
                }
            })
            .collect();

        let mut scopes: Vec<ScopeMatch> = scope_best
            .into_iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|c| (i, c)))
            .filter(|(_, c)| c.score >= self.config.scope_threshold)
            .map(|(i, c)| {
                let scope = &self.catalog.scopes[i];
                ScopeMatch {
                    name: scope.name.clone(),
                    entity: scope.entity.clone(),
                    matched_phrase: c.phrase,
                    confidence_score: c.score,
                    source_category: c.category,
                }
            })
            .collect();

        // Stable sorts keep declaration order for equal scores
        entities.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
        scopes.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));

        let mode = if semantic.is_some() {
            MatchMode::Semantic
        } else {
            MatchMode::Lexical
        };
        debug!(
            ?mode,
            entities = entities.len(),
            scopes = scopes.len(),
            "Matched question against catalog"
        );

        MatchResults {
            entities,
            scopes,
            mode,
            errors,
        }
    }
}

/// Highest-scoring target per owner; the first declared target wins ties
fn best_per_owner(
    targets: &[Target],
    owners: usize,
    words: &[String],
    semantic: Option<(&[f32], &[Vec<f32>])>,
) -> Vec<Option<Candidate>> {
    let mut best: Vec<Option<Candidate>> = vec![None; owners];

    for (i, target) in targets.iter().enumerate() {
        let lexical = find_phrase(words, &target.text).map(|phrase| Candidate {
            score: 1.0,
            phrase,
            category: target.category,
        });
        let semantic = semantic
            .and_then(|(question, vectors)| vectors.get(i).map(|v| cosine_similarity(question, v)))
            .map(|score| Candidate {
                score,
                phrase: target.text.clone(),
                category: target.category,
            });

        let candidate = match (lexical, semantic) {
            (Some(l), Some(s)) if s.score > l.score => Some(s),
            (Some(l), _) => Some(l),
            (None, s) => s,
        };

        if let Some(candidate) = candidate {
            let slot = &mut best[target.owner];
            let better = slot.as_ref().map(|b| candidate.score > b.score).unwrap_or(true);
            if better {
                *slot = Some(candidate);
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityDefinition, ScopeDefinition};
    use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn caller() -> ResilientCaller {
        ResilientCaller::new(Arc::new(CircuitBreakerRegistry::default()), RetryPolicy::none())
    }

    fn catalog() -> Arc<DomainCatalog> {
        Arc::new(DomainCatalog::new(
            vec![
                EntityDefinition::new("Customer").with_aliases(["client", "buyer"]),
                EntityDefinition::new("Order").with_aliases(["purchase"]),
                EntityDefinition::new("Product"),
            ],
            vec![
                ScopeDefinition::new("active", "Customers with an order in the last 30 days")
                    .for_entity("Customer")
                    .with_examples(["recent customers"]),
            ],
        ))
    }

    /// Embeds known phrases onto fixed axes
    struct TableEmbedder {
        table: HashMap<&'static str, Vec<f32>>,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for TableEmbedder {
        async fn embed(&self, text: &str, _cancel: &CancellationToken) -> Result<Vec<f32>> {
            if self.fail {
                return Err(Error::provider("embedding", "offline"));
            }
            Ok(self
                .table
                .get(text)
                .cloned()
                .unwrap_or_else(|| vec![0.0, 0.0, 0.0, 1.0]))
        }
    }

    fn embedder(fail: bool) -> Arc<dyn EmbeddingProvider> {
        let table = HashMap::from([
            ("Customer", vec![1.0, 0.0, 0.0, 0.0]),
            ("client", vec![0.95, 0.05, 0.0, 0.0]),
            ("buyer", vec![0.9, 0.1, 0.0, 0.0]),
            ("Order", vec![0.0, 1.0, 0.0, 0.0]),
            ("purchase", vec![0.0, 0.95, 0.05, 0.0]),
            ("Product", vec![0.0, 0.0, 1.0, 0.0]),
            ("who are my patrons", vec![0.97, 0.0, 0.0, 0.1]),
        ]);
        Arc::new(TableEmbedder { table, fail })
    }

    #[test]
    fn test_alias_scenario_lexical() {
        let matcher = ScopeEntityMatcher::new(catalog(), MatchingConfig::default(), caller());
        let results = matcher.match_lexical("Show all clients");

        assert_eq!(results.mode, MatchMode::Lexical);
        let top = results.top_entity().unwrap();
        assert_eq!(top.name, "Customer");
        assert_eq!(top.matched_phrase, "clients");
        assert_eq!(top.source_category, SourceCategory::EntityAlias);
        assert!(top.confidence_score >= 0.75);
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let matcher = ScopeEntityMatcher::new(catalog(), MatchingConfig::default(), caller());
        let results = matcher.match_lexical("which products did each customer order");
        let names: Vec<_> = results.entities.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Customer", "Order", "Product"]);
    }

    #[test]
    fn test_scope_matches_name_and_examples() {
        let matcher = ScopeEntityMatcher::new(catalog(), MatchingConfig::default(), caller());
        let results = matcher.match_lexical("list recent customers");
        assert_eq!(results.scopes.len(), 1);
        assert_eq!(results.scopes[0].source_category, SourceCategory::ScopeExample);
        assert_eq!(results.scopes[0].entity.as_deref(), Some("Customer"));

        let results = matcher.match_lexical("how many active buyers");
        assert_eq!(results.scopes[0].source_category, SourceCategory::ScopeName);
    }

    #[test]
    fn test_scope_without_description_matches_examples() {
        let catalog = Arc::new(DomainCatalog::new(
            vec![EntityDefinition::new("Customer")],
            vec![ScopeDefinition::new("vip", "  ").with_examples(["big spenders"])],
        ));
        let matcher = ScopeEntityMatcher::new(catalog, MatchingConfig::default(), caller());
        let results = matcher.match_lexical("show the big spenders");
        assert_eq!(results.scopes.len(), 1);
        assert_eq!(results.scopes[0].name, "vip");
        assert_eq!(results.scopes[0].source_category, SourceCategory::ScopeExample);
    }

    #[tokio::test]
    async fn test_semantic_matches_respect_thresholds() {
        let matcher = ScopeEntityMatcher::new(catalog(), MatchingConfig::default(), caller())
            .with_embedder(embedder(false));
        let results = matcher
            .match_question("who are my patrons", &CancellationToken::new())
            .await;

        assert_eq!(results.mode, MatchMode::Semantic);
        assert_eq!(results.top_entity().unwrap().name, "Customer");
        for m in &results.entities {
            assert!(m.confidence_score >= 0.75);
        }
        for m in &results.scopes {
            assert!(m.confidence_score >= 0.70);
        }
        assert!(results.entities.iter().all(|m| m.name != "Product"));
    }

    #[tokio::test]
    async fn test_semantic_keeps_lexical_hits() {
        let matcher = ScopeEntityMatcher::new(catalog(), MatchingConfig::default(), caller())
            .with_embedder(embedder(false));
        let results = matcher
            .match_question("Show all clients", &CancellationToken::new())
            .await;
        let top = results.top_entity().unwrap();
        assert_eq!(top.name, "Customer");
        assert_eq!(top.confidence_score, 1.0);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_lexical() {
        let matcher = ScopeEntityMatcher::new(catalog(), MatchingConfig::default(), caller())
            .with_embedder(embedder(true));
        let results = matcher
            .match_question("Show all clients", &CancellationToken::new())
            .await;

        assert_eq!(results.mode, MatchMode::Lexical);
        assert_eq!(results.errors.len(), 1);
        assert!(results.errors[0].starts_with("[E303]"));
        assert_eq!(results.top_entity().unwrap().name, "Customer");
    }

    #[tokio::test]
    async fn test_semantic_disabled_uses_lexical() {
        let config = MatchingConfig {
            semantic_enabled: false,
            ..MatchingConfig::default()
        };
        let matcher =
            ScopeEntityMatcher::new(catalog(), config, caller()).with_embedder(embedder(false));
        assert!(!matcher.semantic_available());
        let results = matcher
            .match_question("who are my patrons", &CancellationToken::new())
            .await;
        assert_eq!(results.mode, MatchMode::Lexical);
        assert!(results.is_empty());
    }
}
