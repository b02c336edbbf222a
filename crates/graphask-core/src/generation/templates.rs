//! Parameterized query templates
//!
//! A template carries trigger phrases, the parameters it needs and a
//! Cypher body with `{label}`, `{property}` and `{where}` placeholders.
//! Values and limits are always bound as `$value` and `$limit`.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::matching::cosine_similarity;
use crate::matching::similarity::{find_phrase, word_overlap};

/// A parameter a template needs before it can be instantiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateParam {
    Label,
    Property,
    Value,
    Limit,
}

/// A parameterized query pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub id: String,
    pub description: String,
    pub trigger_phrases: Vec<String>,
    /// Body with `{label}`, `{property}` and `{where}` placeholders
    pub body: String,
    #[serde(default)]
    pub required: Vec<TemplateParam>,
    /// Extra predicates on `n`, e.g. `n.{property} = $value`
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl QueryTemplate {
    pub fn new(id: impl Into<String>, description: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            trigger_phrases: Vec::new(),
            body: body.into(),
            required: vec![TemplateParam::Label],
            conditions: Vec::new(),
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_phrases = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required(mut self, required: Vec<TemplateParam>) -> Self {
        self.required = required;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn requires(&self, param: TemplateParam) -> bool {
        self.required.contains(&param)
    }

    /// Substitute label, property and WHERE predicates into the body
    pub fn render(&self, label: &str, property: Option<&str>, predicates: &[String]) -> String {
        let property = property.unwrap_or("");
        let mut all_predicates: Vec<String> = self
            .conditions
            .iter()
            .map(|c| c.replace("{property}", property))
            .collect();
        all_predicates.extend(predicates.iter().cloned());

        let where_clause = if all_predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", all_predicates.join(" AND "))
        };

        self.body
            .replace("{label}", label)
            .replace("{property}", property)
            .replace("{where}", &where_clause)
    }

    /// Lexical score of this template against question words
    ///
    /// A trigger phrase found verbatim scores 1.0; otherwise the fraction of
    /// its words present in the question.
    pub fn lexical_score(&self, words: &[String]) -> f32 {
        self.trigger_phrases
            .iter()
            .map(|trigger| {
                if find_phrase(words, trigger).is_some() {
                    1.0
                } else {
                    word_overlap(words, trigger)
                }
            })
            .fold(0.0, f32::max)
    }
}

/// A template scored against a question
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateScore<'a> {
    pub template: &'a QueryTemplate,
    pub score: f32,
}

/// The set of templates tried before falling back to drafting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLibrary {
    #[serde(default)]
    templates: Vec<QueryTemplate>,
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateLibrary {
    pub fn new(templates: Vec<QueryTemplate>) -> Self {
        Self { templates }
    }

    /// `list_all`, `count_all`, `top_n`, `find_by_property`, `count_by_property`
    pub fn builtin() -> Self {
        use TemplateParam::*;

        Self::new(vec![
            QueryTemplate::new(
                "list_all",
                "List nodes of one label",
                "MATCH (n:{label}){where} RETURN n LIMIT $limit",
            )
            .with_triggers(["show all", "list all", "show me all", "get all", "display all", "list"]),
            QueryTemplate::new(
                "count_all",
                "Count nodes of one label",
                "MATCH (n:{label}){where} RETURN count(n) AS total",
            )
            .with_triggers(["how many", "count", "number of", "total number"]),
            QueryTemplate::new(
                "top_n",
                "Top N nodes ordered by a property",
                "MATCH (n:{label}){where} RETURN n ORDER BY n.{property} DESC LIMIT $limit",
            )
            .with_triggers(["top", "highest", "largest", "biggest", "most expensive"])
            .with_required(vec![Label, Property, Limit]),
            QueryTemplate::new(
                "find_by_property",
                "Nodes whose property equals a value",
                "MATCH (n:{label}){where} RETURN n LIMIT $limit",
            )
            .with_triggers(["with", "named", "called", "whose", "where", "find"])
            .with_required(vec![Label, Property, Value])
            .with_condition("n.{property} = $value"),
            QueryTemplate::new(
                "count_by_property",
                "Counts grouped by a property",
                "MATCH (n:{label}){where} RETURN n.{property} AS {property}, count(n) AS total ORDER BY total DESC LIMIT $limit",
            )
            .with_triggers(["how many by", "count by", "count per", "breakdown by", "grouped by", "group by"])
            .with_required(vec![Label, Property]),
        ])
    }

    /// Built-in templates plus those in a TOML `[[templates]]` list
    ///
    /// A configured template replaces the built-in one with the same id.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let configured: TemplateLibrary =
            toml::from_str(contents).context("Failed to parse query templates")?;
        let mut library = Self::builtin();
        for template in configured.templates {
            if template.trigger_phrases.is_empty() {
                anyhow::bail!("Template '{}' has no trigger phrases", template.id);
            }
            if !template.body.contains("{label}") {
                anyhow::bail!("Template '{}' body has no {{label}} placeholder", template.id);
            }
            library.add(template);
        }
        Ok(library)
    }

    /// Load templates from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read query templates: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid query templates: {}", path.display()))
    }

    /// Add a template, replacing any with the same id
    pub fn add(&mut self, template: QueryTemplate) {
        self.templates.retain(|t| t.id != template.id);
        self.templates.push(template);
    }

    pub fn get(&self, id: &str) -> Option<&QueryTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn templates(&self) -> &[QueryTemplate] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Trigger phrases of every template in declaration order
    pub fn trigger_texts(&self) -> Vec<String> {
        self.templates
            .iter()
            .flat_map(|t| t.trigger_phrases.iter().cloned())
            .collect()
    }

    /// Templates scoring at least `threshold`, best first
    ///
    /// `semantic` pairs the question embedding with one vector per trigger
    /// phrase (in [`trigger_texts`](Self::trigger_texts) order); the score
    /// of a trigger is then the larger of its lexical and cosine scores.
    /// Equal scores prefer templates needing more parameters, as they are
    /// the more specific reading of the question.
    pub fn rank(
        &self,
        words: &[String],
        semantic: Option<(&[f32], &[Vec<f32>])>,
        threshold: f32,
    ) -> Vec<TemplateScore<'_>> {
        let mut offset = 0;
        let mut scored = Vec::new();

        for template in &self.templates {
            let mut score = template.lexical_score(words);
            if let Some((question, vectors)) = semantic {
                for i in 0..template.trigger_phrases.len() {
                    if let Some(vector) = vectors.get(offset + i) {
                        score = score.max(cosine_similarity(question, vector));
                    }
                }
            }
            offset += template.trigger_phrases.len();

            if score >= threshold {
                scored.push(TemplateScore { template, score });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.template.required.len().cmp(&a.template.required.len()))
        });
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::similarity::tokenize;

    fn ids(scores: &[TemplateScore<'_>]) -> Vec<String> {
        scores.iter().map(|s| s.template.id.clone()).collect()
    }

    #[test]
    fn test_how_many_ranks_count_all() {
        let library = TemplateLibrary::builtin();
        let ranked = library.rank(&tokenize("How many orders?"), None, 0.8);
        assert_eq!(ids(&ranked), vec!["count_all"]);
        assert_eq!(ranked[0].score, 1.0);
    }

    #[test]
    fn test_specific_templates_rank_first_on_ties() {
        let library = TemplateLibrary::builtin();
        let ranked = library.rank(&tokenize("how many orders by status"), None, 0.8);
        assert_eq!(ids(&ranked), vec!["count_by_property", "count_all"]);

        let ranked = library.rank(&tokenize("top 5 products by price"), None, 0.8);
        assert_eq!(ids(&ranked)[0], "top_n");
    }

    #[test]
    fn test_semantic_scores_lift_paraphrases() {
        let library = TemplateLibrary::new(vec![
            QueryTemplate::new("count_all", "count", "MATCH (n:{label}) RETURN count(n) AS total")
                .with_triggers(["how many"]),
        ]);
        let words = tokenize("what is the tally of orders");
        assert!(library.rank(&words, None, 0.8).is_empty());

        let question: Vec<f32> = vec![0.9, 0.1];
        let vectors: Vec<Vec<f32>> = vec![vec![1.0, 0.0]];
        let ranked = library.rank(&words, Some((question.as_slice(), vectors.as_slice())), 0.8);
        assert_eq!(ids(&ranked), vec!["count_all"]);
    }

    #[test]
    fn test_render_with_conditions_and_scopes() {
        let library = TemplateLibrary::builtin();
        let find = library.get("find_by_property").unwrap();
        assert_eq!(
            find.render("Customer", Some("email"), &["n.status = $scope_active_0".to_string()]),
            "MATCH (n:Customer) WHERE n.email = $value AND n.status = $scope_active_0 RETURN n LIMIT $limit"
        );

        let count = library.get("count_all").unwrap();
        assert_eq!(
            count.render("Order", None, &[]),
            "MATCH (n:Order) RETURN count(n) AS total"
        );
    }

    #[test]
    fn test_from_toml_adds_to_builtins() {
        let library = TemplateLibrary::from_toml_str(
            r#"
            [[templates]]
            id = "recent"
            description = "Most recent nodes"
            trigger_phrases = ["latest", "most recent"]
            body = "MATCH (n:{label}){where} RETURN n ORDER BY n.created_at DESC LIMIT $limit"
            required = ["label", "limit"]
            "#,
        )
        .unwrap();

        assert_eq!(library.len(), TemplateLibrary::builtin().len() + 1);
        let recent = library.get("recent").unwrap();
        assert!(recent.requires(TemplateParam::Limit));
        assert!(recent.conditions.is_empty());
    }

    #[test]
    fn test_from_toml_rejects_template_without_label() {
        let result = TemplateLibrary::from_toml_str(
            r#"
            [[templates]]
            id = "broken"
            description = "x"
            trigger_phrases = ["broken"]
            body = "MATCH (n) RETURN n"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_add_replaces_by_id() {
        let mut library = TemplateLibrary::builtin();
        let before = library.len();
        library.add(QueryTemplate::new("count_all", "custom", "MATCH (n:{label}) RETURN count(*) AS c"));
        assert_eq!(library.len(), before);
        assert_eq!(library.get("count_all").unwrap().description, "custom");
    }
}
