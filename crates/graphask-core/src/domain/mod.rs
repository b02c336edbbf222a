//! Domain vocabulary and request input

mod catalog;
mod question;

pub use catalog::{
    DomainCatalog, EntityDefinition, FilterOperator, RelationshipDefinition,
    RelationshipDirection, ScopeDefinition, ScopeFilter, is_identifier,
};
pub use question::{MAX_QUESTION_CHARS, Question, Turn};
