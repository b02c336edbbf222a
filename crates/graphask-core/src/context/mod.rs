//! Context assembly for query generation
//!
//! Gathers, per question:
//! - The graph schema snapshot
//! - Exemplars: similar questions answered before, with their queries
//! - Entity and scope matches from the domain catalog
//!
//! and trims them to a token budget so downstream prompts stay small.

mod assembler;
mod bundle;
mod tokens;

pub use assembler::ContextAssembler;
pub(crate) use assembler::{describe_entity, describe_exemplar, describe_scope};
pub use bundle::{
    ContextBundle, ContextIssue, ContextItemKind, ExcludedItem, Exemplar, TokenStats,
};
pub use tokens::TokenEstimator;
