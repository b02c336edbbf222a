//! Prompt construction for drafted queries

use std::sync::Arc;

use tracing::debug;

use crate::context::{ContextBundle, describe_entity, describe_scope};
use crate::domain::{DomainCatalog, Question};
use crate::llm::{Message, Prompt};
use crate::providers::Params;

/// Conversation turns carried into the prompt
const HISTORY_TURNS: usize = 3;

const RULES: &str = r#"You translate questions about a graph database into Cypher.

Rules:
- Write a single read-only Cypher query (MATCH, OPTIONAL MATCH, WITH, WHERE, RETURN, ORDER BY, LIMIT)
- Never use CREATE, MERGE, SET, DELETE, REMOVE or DROP
- Use only the labels, relationship types and properties listed below
- Use the node variable `n` for the main entity so named filters apply as written
- Prefer $parameters over literal values
- Always end with a LIMIT clause

Return ONLY the Cypher query, no explanations."#;

/// A rejected draft fed back for one corrected attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub query: String,
    pub errors: Vec<String>,
}

/// Builds drafter prompts from a context bundle
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    catalog: Arc<DomainCatalog>,
}

impl PromptBuilder {
    pub fn new(catalog: Arc<DomainCatalog>) -> Self {
        Self { catalog }
    }

    /// Build the message sequence and the scope parameters it references
    ///
    /// Order: system rules with schema and vocabulary, exemplars as few-shot
    /// pairs, recent history, the question, then the correction request.
    pub fn build(
        &self,
        question: &Question,
        bundle: &ContextBundle,
        correction: Option<&Correction>,
    ) -> (Prompt, Params) {
        let mut params = Params::new();
        let mut messages = vec![Message::system(self.system_text(bundle, &mut params))];

        for exemplar in &bundle.exemplars {
            messages.push(Message::user(exemplar.prior_question.clone()));
            messages.push(Message::assistant(exemplar.prior_query.clone()));
        }

        let history = question.history();
        for turn in &history[history.len().saturating_sub(HISTORY_TURNS)..] {
            messages.push(Message::user(turn.question.clone()));
            if let Some(query) = &turn.query {
                messages.push(Message::assistant(query.clone()));
            }
        }

        messages.push(Message::user(question.text()));

        if let Some(correction) = correction {
            messages.push(Message::assistant(correction.query.clone()));
            messages.push(Message::user(format!(
                "That query was rejected:\n- {}\n\nReturn a corrected query.",
                correction.errors.join("\n- ")
            )));
        }

        (Prompt::new(messages), params)
    }

    fn system_text(&self, bundle: &ContextBundle, params: &mut Params) -> String {
        let mut sections = vec![RULES.to_string()];

        if let Some(schema) = bundle.schema.as_ref().filter(|s| !s.is_empty()) {
            sections.push(format!("Graph schema:\n{}", schema.to_prompt_text()));
        }

        if !bundle.entity_matches.is_empty() {
            let lines: Vec<String> = bundle
                .entity_matches
                .iter()
                .map(|m| format!("- {}", describe_entity(&self.catalog, m)))
                .collect();
            sections.push(format!("Entities mentioned:\n{}", lines.join("\n")));
        }

        let mut scope_lines = Vec::new();
        for m in &bundle.scope_matches {
            let mut line = format!("- {}", describe_scope(&self.catalog, m));
            if let Some(scope) = self.catalog.scope(&m.name) {
                match scope.to_cypher("n", params) {
                    Ok(predicate) if !predicate.is_empty() => {
                        line.push_str(&format!("\n  Filter: WHERE {}", predicate));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(scope = %m.name, error = %e, "Scope filter skipped"),
                }
            }
            scope_lines.push(line);
        }
        if !scope_lines.is_empty() {
            sections.push(format!("Named filters:\n{}", scope_lines.join("\n")));
        }

        sections.join("\n\n")
    }
}
