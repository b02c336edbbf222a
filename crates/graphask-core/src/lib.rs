//! Graphask Core Library
//!
//! This crate turns natural-language questions into validated, guarded
//! graph queries:
//! - Context assembly (schema, exemplars, vocabulary) under a token budget
//! - Entity and scope matching against a domain catalog
//! - Template matching with a language-model fallback for query drafting
//! - Cypher validation, sanitization and complexity scoring
//! - Execution behind retry and circuit-breaker guards
//!
//! Network clients for the graph store, vector search, embeddings and the
//! language model are supplied by the caller through [`providers`].

pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod execution;
pub mod generation;
pub mod llm;
pub mod matching;
pub mod pipeline;
pub mod providers;
pub mod resilience;
pub mod telemetry;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::{DomainCatalog, Question, Turn};
    pub use crate::error::{Error, Result};
    pub use crate::execution::{ExecutionOptions, ExecutionResult};
    pub use crate::generation::{CandidateOrigin, QueryCandidate, ValidationResult};
    pub use crate::pipeline::{
        FailureStage, PipelineFailure, PipelineOptions, PipelineOutcome, QueryPipeline,
    };
    pub use crate::providers::{
        EmbeddingProvider, GraphStore, Params, QueryDrafter, Row, SchemaProvider, SchemaSnapshot,
        SimilaritySearch,
    };
    pub use tokio_util::sync::CancellationToken;
}
