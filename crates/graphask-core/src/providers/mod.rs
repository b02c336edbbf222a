//! Collaborator contracts consumed by the core
//!
//! Implementations (vector store, embedding service, language model, graph
//! database driver) live outside this crate. Every call takes a
//! [`CancellationToken`] so an abandoned question can stop in-flight work.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::llm::{DraftOptions, Prompt};

/// Breaker/dependency name of the graph database
pub const GRAPH_STORE: &str = "graph-store";
/// Breaker/dependency name of the query-drafting model
pub const LANGUAGE_MODEL: &str = "language-model";
/// Breaker/dependency name of the embedding service
pub const EMBEDDING: &str = "embedding";
/// Breaker/dependency name of the exemplar vector search
pub const SIMILARITY_SEARCH: &str = "similarity-search";
/// Breaker/dependency name of the schema source
pub const SCHEMA: &str = "schema";

/// One result row keyed by column name
pub type Row = serde_json::Map<String, Value>;

/// Bound query parameters
pub type Params = BTreeMap<String, Value>;

/// A similarity search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub payload: Value,
    pub score: f32,
}

/// Labels, relationship types and property keys of the graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub labels: Vec<String>,
    pub relationship_types: Vec<String>,
    pub property_keys: Vec<String>,
}

impl SchemaSnapshot {
    pub fn new(
        labels: Vec<String>,
        relationship_types: Vec<String>,
        property_keys: Vec<String>,
    ) -> Self {
        Self {
            labels,
            relationship_types,
            property_keys,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.relationship_types.is_empty() && self.property_keys.is_empty()
    }

    /// Render for inclusion in a prompt
    pub fn to_prompt_text(&self) -> String {
        format!(
            "Node labels: {}\nRelationship types: {}\nProperty keys: {}",
            self.labels.join(", "),
            self.relationship_types.join(", "),
            self.property_keys.join(", ")
        )
    }
}

/// Vector search over previously answered questions
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>>;
}

/// Text embedding service
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order
    async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text, cancel).await?);
        }
        Ok(vectors)
    }
}

/// Source of the current graph schema
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_schema(&self, cancel: &CancellationToken) -> Result<SchemaSnapshot>;
}

/// Language model that drafts Cypher from a prompt
#[async_trait]
pub trait QueryDrafter: Send + Sync {
    async fn draft(
        &self,
        prompt: &Prompt,
        options: &DraftOptions,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Graph database driver
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn query(&self, text: &str, params: &Params, cancel: &CancellationToken)
    -> Result<Vec<Row>>;

    async fn get_schema(&self, cancel: &CancellationToken) -> Result<SchemaSnapshot>;
}

/// Serves the schema straight from a graph store
pub struct StoreSchemaProvider {
    store: Arc<dyn GraphStore>,
}

impl StoreSchemaProvider {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SchemaProvider for StoreSchemaProvider {
    async fn get_schema(&self, cancel: &CancellationToken) -> Result<SchemaSnapshot> {
        self.store.get_schema(cancel).await
    }
}
