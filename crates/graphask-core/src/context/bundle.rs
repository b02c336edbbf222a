//! The assembled context for one question

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::matching::{EntityMatch, MatchMode, ScopeMatch};
use crate::providers::SchemaSnapshot;

/// A previously answered question used as a few-shot hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub prior_question: String,
    pub prior_query: String,
    pub similarity_score: f32,
}

impl Exemplar {
    pub fn new(
        prior_question: impl Into<String>,
        prior_query: impl Into<String>,
        similarity_score: f32,
    ) -> Self {
        Self {
            prior_question: prior_question.into(),
            prior_query: prior_query.into(),
            similarity_score,
        }
    }
}

/// Token accounting for an assembled bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    /// Estimated tokens of the included items
    pub estimated_tokens: usize,
    pub budget: Option<usize>,
    pub items_included: usize,
    pub items_excluded: usize,
}

/// Kind of a candidate context item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextItemKind {
    Schema,
    Entity,
    Scope,
    Exemplar,
}

/// A context item dropped to stay within the token budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedItem {
    pub kind: ContextItemKind,
    pub name: String,
    pub score: f32,
    pub tokens: usize,
}

/// A context source that failed while assembling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextIssue {
    /// Which source failed (`schema`, `similarity-search`, ...)
    pub source: String,
    pub code: String,
    pub message: String,
}

impl ContextIssue {
    pub fn from_error(source: impl Into<String>, error: &Error) -> Self {
        Self {
            source: source.into(),
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for ContextIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.source, self.message)
    }
}

/// Context for one question
///
/// Built fresh per question and not modified after assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub schema: Option<SchemaSnapshot>,
    pub exemplars: Vec<Exemplar>,
    pub entity_matches: Vec<EntityMatch>,
    pub scope_matches: Vec<ScopeMatch>,
    pub token_stats: TokenStats,
    pub excluded: Vec<ExcludedItem>,
    pub match_mode: MatchMode,
    /// Non-fatal failures of individual sources
    pub errors: Vec<ContextIssue>,
    /// Embedding of the question text, when one was computed
    #[serde(skip)]
    pub question_embedding: Option<Vec<f32>>,
}

impl ContextBundle {
    /// An empty bundle, used when no context sources are configured
    pub fn empty() -> Self {
        Self {
            schema: None,
            exemplars: Vec::new(),
            entity_matches: Vec::new(),
            scope_matches: Vec::new(),
            token_stats: TokenStats::default(),
            excluded: Vec::new(),
            match_mode: MatchMode::Lexical,
            errors: Vec::new(),
            question_embedding: None,
        }
    }

    /// Whether any source failed
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn top_entity(&self) -> Option<&EntityMatch> {
        self.entity_matches.first()
    }
}
