//! Business-vocabulary matching
//!
//! Resolves what a question talks about (entities such as "Customer") and
//! which named filters it implies (scopes such as "active").

mod matcher;
pub mod similarity;

pub use matcher::{
    EntityMatch, MatchMode, MatchResults, ScopeEntityMatcher, ScopeMatch, SourceCategory,
};
pub use similarity::cosine_similarity;
