//! Domain catalog: the business vocabulary mapped onto the graph
//!
//! Loaded once at startup from TOML. Each entity names the graph label it
//! maps to, the words people use for it, and its properties. Scopes are
//! reusable filter predicates written as a small declarative DSL
//! (`field`, `operator`, `value`) and translated to Cypher predicates with
//! bound parameters.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Direction of a relationship relative to the owning entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipDirection {
    #[default]
    Outgoing,
    Incoming,
}

/// A relationship an entity participates in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    #[serde(rename = "type")]
    pub rel_type: String,
    pub target: String,
    #[serde(default)]
    pub direction: RelationshipDirection,
}

impl RelationshipDefinition {
    /// Render as a Cypher pattern fragment, e.g. `(:Customer)-[:PLACED]->(:Order)`
    pub fn pattern(&self, source_label: &str) -> String {
        match self.direction {
            RelationshipDirection::Outgoing => format!(
                "(:{})-[:{}]->(:{})",
                source_label, self.rel_type, self.target
            ),
            RelationshipDirection::Incoming => format!(
                "(:{})<-[:{}]-(:{})",
                source_label, self.rel_type, self.target
            ),
        }
    }
}

/// A business entity mapped to a graph label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    /// Graph label; defaults to `name` when omitted
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDefinition>,
    #[serde(default)]
    pub description: Option<String>,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            aliases: Vec::new(),
            properties: Vec::new(),
            relationships: Vec::new(),
            description: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties.extend(properties.into_iter().map(Into::into));
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipDefinition) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// The graph label this entity maps to
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Canonical name followed by every alias
    pub fn match_targets(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }
}

/// Comparison operator of a scope filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Inclusive range; value must be a two-element array
    Between,
    /// Membership; value must be an array
    In,
    Contains,
    StartsWith,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "IN",
            Self::Contains => "CONTAINS",
            Self::StartsWith => "STARTS WITH",
            Self::Between | Self::IsNull | Self::IsNotNull => "",
        }
    }
}

/// One predicate of a scope: `field operator value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<Value>,
}

impl ScopeFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Translate to a Cypher predicate on `var`, binding values into `params`
    pub fn to_cypher(
        &self,
        var: &str,
        param_name: &str,
        params: &mut BTreeMap<String, Value>,
    ) -> Result<String> {
        if !is_identifier(&self.field) {
            return Err(Error::InvalidInput(format!(
                "Scope filter field '{}' is not a valid property name",
                self.field
            )));
        }
        let target = format!("{}.{}", var, self.field);

        match self.operator {
            FilterOperator::IsNull => Ok(format!("{} IS NULL", target)),
            FilterOperator::IsNotNull => Ok(format!("{} IS NOT NULL", target)),
            FilterOperator::Between => {
                let bounds = self
                    .value
                    .as_ref()
                    .and_then(Value::as_array)
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "Scope filter '{}' uses between without a [low, high] value",
                            self.field
                        ))
                    })?;
                let low = format!("{}_low", param_name);
                let high = format!("{}_high", param_name);
                params.insert(low.clone(), bounds[0].clone());
                params.insert(high.clone(), bounds[1].clone());
                Ok(format!("{t} >= ${low} AND {t} <= ${high}", t = target))
            }
            op => {
                let value = self.value.clone().ok_or_else(|| {
                    Error::InvalidInput(format!("Scope filter '{}' is missing a value", self.field))
                })?;
                if op == FilterOperator::In && !value.is_array() {
                    return Err(Error::InvalidInput(format!(
                        "Scope filter '{}' uses in without an array value",
                        self.field
                    )));
                }
                params.insert(param_name.to_string(), value);
                Ok(format!("{} {} ${}", target, op.symbol(), param_name))
            }
        }
    }
}

/// A named, reusable filter predicate in business vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeDefinition {
    pub name: String,
    /// Entity the scope applies to, if restricted
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Example phrasings used for matching
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub filters: Vec<ScopeFilter>,
}

impl ScopeDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: None,
            description: description.into(),
            examples: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn for_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples.extend(examples.into_iter().map(Into::into));
        self
    }

    pub fn with_filter(mut self, filter: ScopeFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Name, description and example phrasings
    pub fn match_targets(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(Some(self.description.as_str()).filter(|d| !d.trim().is_empty()))
            .chain(self.examples.iter().map(String::as_str))
            .collect()
    }

    /// Translate all filters to one Cypher predicate joined with AND
    pub fn to_cypher(&self, var: &str, params: &mut BTreeMap<String, Value>) -> Result<String> {
        let prefix = format!("scope_{}", sanitize_param(&self.name));
        let predicates = self
            .filters
            .iter()
            .enumerate()
            .map(|(i, f)| f.to_cypher(var, &format!("{}_{}", prefix, i), params))
            .collect::<Result<Vec<_>>>()?;

        Ok(match predicates.len() {
            0 => String::new(),
            1 => predicates.into_iter().next().unwrap_or_default(),
            _ => format!("({})", predicates.join(" AND ")),
        })
    }
}

/// Entities and scopes known to the system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainCatalog {
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub scopes: Vec<ScopeDefinition>,
}

impl DomainCatalog {
    pub fn new(entities: Vec<EntityDefinition>, scopes: Vec<ScopeDefinition>) -> Self {
        Self { entities, scopes }
    }

    /// Parse a catalog from TOML
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let catalog: DomainCatalog =
            toml::from_str(contents).context("Failed to parse domain catalog")?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read domain catalog: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid domain catalog: {}", path.display()))
    }

    /// Check names are unique and scopes reference known entities
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entity in &self.entities {
            if !seen.insert(entity.name.to_lowercase()) {
                anyhow::bail!("Duplicate entity '{}'", entity.name);
            }
            if !is_identifier(entity.label()) {
                anyhow::bail!("Entity '{}' has an invalid label '{}'", entity.name, entity.label());
            }
        }

        let mut scope_names = std::collections::HashSet::new();
        for scope in &self.scopes {
            if !scope_names.insert(scope.name.to_lowercase()) {
                anyhow::bail!("Duplicate scope '{}'", scope.name);
            }
            if let Some(entity) = &scope.entity {
                if self.entity(entity).is_none() {
                    anyhow::bail!("Scope '{}' references unknown entity '{}'", scope.name, entity);
                }
            }
        }
        Ok(())
    }

    /// Look up an entity by name (case-insensitive)
    pub fn entity(&self, name: &str) -> Option<&EntityDefinition> {
        self.entities
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Look up a scope by name (case-insensitive)
    pub fn scope(&self, name: &str) -> Option<&ScopeDefinition> {
        self.scopes.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// Whether `s` is safe to splice into a query as a label or property name
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn sanitize_param(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
