//! Query generation
//!
//! Pipeline for one question:
//! 1. Match the question against parameterized templates
//! 2. Otherwise draft a query from a context-grounded prompt
//! 3. Validate, sanitize and score the result

mod generator;
mod params;
mod prompt;
mod templates;
mod validator;

pub use generator::{CandidateOrigin, GenerationOutcome, QueryCandidate, QueryGenerator};
pub use params::{extract_limit, extract_property, extract_quoted};
pub use prompt::{Correction, PromptBuilder};
pub use templates::{QueryTemplate, TemplateLibrary, TemplateParam, TemplateScore};
pub use validator::{QueryValidator, ValidationResult};

pub(crate) use validator::clause_separator;
