//! Cypher validation, sanitization and complexity scoring
//!
//! The validator never parses Cypher fully. It lexes the query just enough
//! to mask string literals and comments, finds clause keywords, and checks
//! structure (balanced brackets, clause order) and policy (writes and
//! destructive operations) on that view.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;

static CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(OPTIONAL\s+MATCH|MATCH|WHERE|WITH|RETURN|ORDER\s+BY|SKIP|LIMIT|UNWIND|CALL|CREATE|MERGE|SET|REMOVE|DETACH\s+DELETE|DELETE|UNION|FOREACH|LOAD\s+CSV)\b",
    )
    .expect("clause regex")
});

static DELETE_ALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bMATCH\s*\(\s*\w*\s*\)\s*(DETACH\s+)?DELETE\b").expect("delete-all regex")
});

static DETACH_DELETE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bDETACH\s+DELETE\b").expect("detach delete regex"));

static DROP_SCHEMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bDROP\s+(INDEX|CONSTRAINT|DATABASE|GRAPH|ALIAS)\b").expect("drop regex")
});

static APOC_SCHEMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bapoc\.(schema\.assert|periodic\.truncate)\b").expect("apoc regex")
});

static WHERE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where regex"));

static BINDING_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(MATCH|WITH|UNION)\b").expect("binding clause regex"));

static CASE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCASE\b").expect("case regex"));

static END_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bEND\b").expect("end regex"));

static AGGREGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(count|sum|avg|min|max|collect|stdev|stdevp|percentilecont|percentiledisc)\s*\(",
    )
    .expect("aggregation regex")
});

static RELATIONSHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\)\s*<?-\s*[\[\->]").expect("relationship regex"));

static VARIABLE_LENGTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\*[^\]]*\]").expect("variable length regex"));

static UNBOUNDED_LENGTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\s*(\d*\s*\.\.\s*)?\]").expect("unbounded regex"));

static CARTESIAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\)\s*,\s*\(").expect("cartesian regex"));

static NUMERIC_COMPARISON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:<>|<=|>=|=|<|>)\s*(-?\d+(?:\.\d+)?)\b").expect("numeric literal regex")
});

static LEADING_MODIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(EXPLAIN|PROFILE)\b").expect("modifier regex"));

/// Structural weight of each clause kind
const WEIGHT_MATCH: u32 = 5;
const WEIGHT_OPTIONAL_MATCH: u32 = 7;
const WEIGHT_WHERE: u32 = 3;
const WEIGHT_WITH: u32 = 2;
const WEIGHT_UNWIND: u32 = 4;
const WEIGHT_ORDER_BY: u32 = 2;
const WEIGHT_CALL_SUBQUERY: u32 = 8;
const WEIGHT_AGGREGATION: u32 = 4;
const WEIGHT_RELATIONSHIP: u32 = 3;
const WEIGHT_VARIABLE_LENGTH: u32 = 10;

/// Outcome of validating one query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Additive structural weight; higher is costlier
    pub complexity_score: u32,
    /// Whether any error is a write/destructive policy violation
    #[serde(default)]
    pub policy_violation: bool,
}

impl ValidationResult {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>, complexity_score: u32, policy_violation: bool) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
            complexity_score,
            policy_violation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseKind {
    Match,
    OptionalMatch,
    Where,
    With,
    Return,
    OrderBy,
    Skip,
    Limit,
    Unwind,
    Call,
    Create,
    Merge,
    Set,
    Remove,
    Delete,
    DetachDelete,
    Union,
    Foreach,
    LoadCsv,
}

impl ClauseKind {
    fn parse(keyword: &str) -> Option<Self> {
        let normalized = keyword
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
        Some(match normalized.as_str() {
            "MATCH" => Self::Match,
            "OPTIONAL MATCH" => Self::OptionalMatch,
            "WHERE" => Self::Where,
            "WITH" => Self::With,
            "RETURN" => Self::Return,
            "ORDER BY" => Self::OrderBy,
            "SKIP" => Self::Skip,
            "LIMIT" => Self::Limit,
            "UNWIND" => Self::Unwind,
            "CALL" => Self::Call,
            "CREATE" => Self::Create,
            "MERGE" => Self::Merge,
            "SET" => Self::Set,
            "REMOVE" => Self::Remove,
            "DELETE" => Self::Delete,
            "DETACH DELETE" => Self::DetachDelete,
            "UNION" => Self::Union,
            "FOREACH" => Self::Foreach,
            "LOAD CSV" => Self::LoadCsv,
            _ => return None,
        })
    }

    fn write_keyword(&self) -> Option<&'static str> {
        match self {
            Self::Create => Some("CREATE"),
            Self::Merge => Some("MERGE"),
            Self::Set => Some("SET"),
            Self::Remove => Some("REMOVE"),
            Self::Delete => Some("DELETE"),
            Self::DetachDelete => Some("DETACH DELETE"),
            Self::Foreach => Some("FOREACH"),
            Self::LoadCsv => Some("LOAD CSV"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Clause {
    kind: ClauseKind,
    start: usize,
    end: usize,
    depth: usize,
}

/// A query with literals and comments blanked out
#[derive(Debug)]
struct Lexed {
    masked: String,
    literals: Vec<String>,
    unterminated: Option<&'static str>,
}

fn blank(out: &mut String, c: char) {
    for _ in 0..c.len_utf8() {
        out.push(' ');
    }
}

/// Mask string literals, quoted identifiers and comments
///
/// The masked text has the same byte length as the input, so offsets found
/// in it are valid in the original.
fn lex(query: &str) -> Lexed {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Str(char),
        LineComment,
        BlockComment,
    }

    let chars: Vec<char> = query.chars().collect();
    let mut masked = String::with_capacity(query.len());
    let mut literals = Vec::new();
    let mut current = String::new();
    let mut state = State::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Code => match c {
                '\'' | '"' | '`' => {
                    masked.push(c);
                    current.clear();
                    state = State::Str(c);
                }
                '/' if next == Some('/') => {
                    masked.push_str("  ");
                    i += 1;
                    state = State::LineComment;
                }
                '/' if next == Some('*') => {
                    masked.push_str("  ");
                    i += 1;
                    state = State::BlockComment;
                }
                _ => masked.push(c),
            },
            State::Str(quote) => {
                if c == '\\' && quote != '`' {
                    blank(&mut masked, c);
                    if let Some(escaped) = next {
                        blank(&mut masked, escaped);
                        current.push(escaped);
                        i += 1;
                    }
                } else if c == quote {
                    masked.push(c);
                    if quote != '`' {
                        literals.push(std::mem::take(&mut current));
                    }
                    state = State::Code;
                } else {
                    blank(&mut masked, c);
                    current.push(c);
                }
            }
            State::LineComment => {
                if c == '\n' {
                    masked.push('\n');
                    state = State::Code;
                } else {
                    blank(&mut masked, c);
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    masked.push_str("  ");
                    i += 1;
                    state = State::Code;
                } else if c == '\n' {
                    masked.push('\n');
                } else {
                    blank(&mut masked, c);
                }
            }
        }
        i += 1;
    }

    let unterminated = match state {
        State::Str('`') => Some("quoted identifier"),
        State::Str(_) => Some("string literal"),
        State::BlockComment => Some("block comment"),
        _ => None,
    };

    Lexed {
        masked,
        literals,
        unterminated,
    }
}

/// Bracket nesting depth before each byte of `masked`
fn depths(masked: &str) -> Vec<usize> {
    let mut depth = 0usize;
    let mut out = Vec::with_capacity(masked.len() + 1);
    for b in masked.bytes() {
        out.push(depth);
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    out.push(depth);
    out
}

fn bracket_errors(masked: &str) -> Vec<String> {
    let mut stack = Vec::new();
    for c in masked.chars() {
        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return vec![format!("Unbalanced brackets: unexpected '{}'", c)];
                }
            }
            _ => {}
        }
    }
    stack
        .last()
        .map(|open| vec![format!("Unbalanced brackets: '{}' is never closed", open)])
        .unwrap_or_default()
}

fn find_clauses(masked: &str) -> Vec<Clause> {
    let depth_at = depths(masked);
    let mut clauses: Vec<Clause> = Vec::new();

    for m in CLAUSE.find_iter(masked) {
        let before = &masked[..m.start()];
        // Property access, labels, parameters and map keys are not clauses
        if let Some(prev) = before.chars().last() {
            if matches!(prev, '.' | ':' | '$') || prev.is_alphanumeric() || prev == '_' {
                continue;
            }
        }
        let Some(kind) = ClauseKind::parse(m.as_str()) else {
            continue;
        };
        if kind == ClauseKind::With {
            let prev_word = before
                .trim_end()
                .rsplit(|c: char| !c.is_alphanumeric())
                .next()
                .unwrap_or("")
                .to_uppercase();
            if prev_word == "STARTS" || prev_word == "ENDS" {
                continue;
            }
        }
        clauses.push(Clause {
            kind,
            start: m.start(),
            end: masked.len(),
            depth: depth_at[m.start()],
        });
    }

    for i in 1..clauses.len() {
        let start = clauses[i].start;
        clauses[i - 1].end = start;
    }
    clauses
}

/// Separator that keeps an appended clause out of a trailing line comment
pub(crate) fn clause_separator(query: &str) -> &'static str {
    if query.lines().last().is_some_and(|line| line.contains("//")) {
        "\n"
    } else {
        " "
    }
}

/// Occurrences of a keyword, skipping property accesses, labels,
/// parameters and map keys such as `e.end` or `{end: 1}`
fn keyword_count(keyword: &Regex, masked: &str) -> usize {
    keyword
        .find_iter(masked)
        .filter(|m| {
            let prev = masked[..m.start()].chars().last();
            let next = masked[m.end()..].trim_start().chars().next();
            !matches!(prev, Some('.' | ':' | '$')) && next != Some(':')
        })
        .count()
}

fn has_top_level_limit(query: &str) -> bool {
    let lexed = lex(query);
    find_clauses(&lexed.masked)
        .iter()
        .any(|c| c.kind == ClauseKind::Limit && c.depth == 0)
}

fn complexity_of(masked: &str, clauses: &[Clause]) -> u32 {
    let mut score = 0;
    for clause in clauses {
        score += match clause.kind {
            ClauseKind::Match => WEIGHT_MATCH,
            ClauseKind::OptionalMatch => WEIGHT_OPTIONAL_MATCH,
            ClauseKind::Where => WEIGHT_WHERE,
            ClauseKind::With => WEIGHT_WITH,
            ClauseKind::Unwind => WEIGHT_UNWIND,
            ClauseKind::OrderBy => WEIGHT_ORDER_BY,
            ClauseKind::Call if masked[clause.start + 4..clause.end].trim_start().starts_with('{') => {
                WEIGHT_CALL_SUBQUERY
            }
            _ => 0,
        };
    }
    score += AGGREGATION.find_iter(masked).count() as u32 * WEIGHT_AGGREGATION;
    score += RELATIONSHIP.find_iter(masked).count() as u32 * WEIGHT_RELATIONSHIP;
    score += VARIABLE_LENGTH.find_iter(masked).count() as u32 * WEIGHT_VARIABLE_LENGTH;
    score
}

/// Validates and sanitizes Cypher before execution
#[derive(Debug, Clone, PartialEq)]
pub struct QueryValidator {
    allow_write: bool,
    max_complexity: u32,
    default_limit: usize,
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new(&GenerationConfig::default())
    }
}

impl QueryValidator {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            allow_write: config.allow_write,
            max_complexity: config.max_complexity,
            default_limit: config.default_limit,
        }
    }

    pub fn with_allow_write(mut self, allow_write: bool) -> Self {
        self.allow_write = allow_write;
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn allow_write(&self) -> bool {
        self.allow_write
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Check structure and policy; collect errors and warnings
    pub fn validate(&self, query: &str) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut policy_violation = false;

        let trimmed = query.trim().trim_end_matches(';').trim_end();
        if trimmed.is_empty() {
            return ValidationResult::from_parts(vec!["Query is empty".to_string()], warnings, 0, false);
        }

        // Destructive patterns are checked on the raw text, so they are
        // caught wherever they appear
        for violation in destructive_operations(trimmed) {
            if self.allow_write {
                warnings.push(format!("Destructive operation permitted: {}", violation));
            } else {
                errors.push(format!("Destructive operation not allowed: {}", violation));
                policy_violation = true;
            }
        }

        let lexed = lex(trimmed);
        if let Some(what) = lexed.unterminated {
            errors.push(format!("Unterminated {}", what));
        }
        errors.extend(bracket_errors(&lexed.masked));
        if lexed.masked.contains(';') {
            errors.push("Multiple statements are not allowed".to_string());
        }

        let case_count = keyword_count(&CASE_KEYWORD, &lexed.masked);
        let end_count = keyword_count(&END_KEYWORD, &lexed.masked);
        if case_count != end_count {
            errors.push(format!(
                "Unbalanced CASE expression: {} CASE, {} END",
                case_count, end_count
            ));
        }

        let clauses = find_clauses(&lexed.masked);
        let body_start = LEADING_MODIFIER
            .find(&lexed.masked)
            .map(|m| m.end())
            .unwrap_or(0);
        let first_code = lexed.masked[body_start..]
            .find(|c: char| !c.is_whitespace())
            .map(|offset| body_start + offset);
        match (clauses.first(), first_code) {
            (Some(first), Some(code)) if first.start == code => {}
            _ => errors.push("Query must start with a clause such as MATCH or RETURN".to_string()),
        }

        let top_level: Vec<&Clause> = clauses.iter().filter(|c| c.depth == 0).collect();
        for (i, clause) in top_level.iter().enumerate() {
            let previous = i.checked_sub(1).map(|p| top_level[p].kind);
            match clause.kind {
                ClauseKind::Where
                    if !matches!(
                        previous,
                        Some(ClauseKind::Match | ClauseKind::OptionalMatch | ClauseKind::With | ClauseKind::Call)
                    ) =>
                {
                    errors.push("WHERE must follow MATCH, OPTIONAL MATCH or WITH".to_string());
                }
                ClauseKind::OrderBy
                    if !matches!(previous, Some(ClauseKind::Return | ClauseKind::With)) =>
                {
                    errors.push("ORDER BY must follow RETURN or WITH".to_string());
                }
                _ => {}
            }
        }

        let mut write_keywords: Vec<&'static str> = Vec::new();
        for clause in &clauses {
            if let Some(keyword) = clause.kind.write_keyword() {
                if !write_keywords.contains(&keyword) {
                    write_keywords.push(keyword);
                }
            }
        }
        if !write_keywords.is_empty() && !self.allow_write {
            for keyword in &write_keywords {
                errors.push(format!("Write operation not allowed in read-only mode: {}", keyword));
            }
            policy_violation = true;
        }

        let has_return = top_level.iter().any(|c| c.kind == ClauseKind::Return);
        let starts_with_call = clauses.first().map(|c| c.kind == ClauseKind::Call).unwrap_or(false);
        if write_keywords.is_empty() && !has_return && !starts_with_call {
            errors.push("Read query has no RETURN clause".to_string());
        }

        if !top_level.iter().any(|c| c.kind == ClauseKind::Limit) {
            warnings.push(format!(
                "No LIMIT clause; a default limit of {} will be applied",
                self.default_limit
            ));
        }

        if UNBOUNDED_LENGTH.is_match(&lexed.masked) {
            warnings.push("Unbounded variable-length path; add an upper bound such as *1..5".to_string());
        }

        for clause in clauses
            .iter()
            .filter(|c| matches!(c.kind, ClauseKind::Match | ClauseKind::OptionalMatch))
        {
            if CARTESIAN.is_match(&lexed.masked[clause.start..clause.end]) {
                warnings.push(
                    "Possible cartesian product: comma-separated patterns in one MATCH".to_string(),
                );
                break;
            }
        }

        let mut seen_literals = Vec::new();
        for literal in &lexed.literals {
            if !seen_literals.contains(literal) {
                warnings.push(format!(
                    "Literal value '{}' should be passed as a parameter",
                    literal
                ));
                seen_literals.push(literal.clone());
            }
        }
        for caps in NUMERIC_COMPARISON.captures_iter(&lexed.masked) {
            warnings.push(format!(
                "Literal value {} should be passed as a parameter",
                &caps[1]
            ));
        }

        let complexity_score = complexity_of(&lexed.masked, &clauses);
        if complexity_score > self.max_complexity {
            warnings.push(format!(
                "Complexity score {} exceeds maximum {}",
                complexity_score, self.max_complexity
            ));
        }

        ValidationResult::from_parts(errors, warnings, complexity_score, policy_violation)
    }

    /// Trim, drop trailing semicolons, and append the default LIMIT if missing
    ///
    /// Idempotent: sanitizing a sanitized query returns it unchanged.
    pub fn sanitize(&self, query: &str) -> String {
        let mut text = query.trim();
        while let Some(stripped) = text.strip_suffix(';') {
            text = stripped.trim_end();
        }

        if has_top_level_limit(text) {
            return text.to_string();
        }

        let separator = if text.is_empty() { "" } else { clause_separator(text) };
        format!("{}{}LIMIT {}", text, separator, self.default_limit)
    }

    /// Additive structural weight of the query
    pub fn complexity(&self, query: &str) -> u32 {
        let lexed = lex(query);
        let clauses = find_clauses(&lexed.masked);
        complexity_of(&lexed.masked, &clauses)
    }

    /// Whether the query has a top-level LIMIT
    pub fn has_limit(&self, query: &str) -> bool {
        has_top_level_limit(query)
    }

    /// Whether the query contains any write clause
    pub fn is_write_query(&self, query: &str) -> bool {
        let lexed = lex(query);
        find_clauses(&lexed.masked)
            .iter()
            .any(|c| c.kind.write_keyword().is_some())
            || !destructive_operations(query).is_empty()
    }
}

/// Names of destructive operations found anywhere in the text
///
/// A DETACH DELETE is guarded only by a WHERE between the nearest
/// preceding MATCH, WITH or UNION and the delete itself. WHERE inside
/// string literals or comments does not count.
fn destructive_operations(query: &str) -> Vec<String> {
    let mut found = Vec::new();
    let masked = lex(query).masked;

    if let Some(m) = DELETE_ALL.find(query) {
        let pattern = m.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
        found.push(format!("delete-all pattern '{}' removes every node", pattern.to_uppercase()));
    } else if DETACH_DELETE
        .find_iter(query)
        .any(|m| !guarded_by_where(&masked, m.start()))
    {
        found.push("DETACH DELETE without a WHERE condition".to_string());
    }
    for caps in DROP_SCHEMA.captures_iter(query) {
        found.push(format!("DROP {}", caps[1].to_uppercase()));
    }
    for caps in APOC_SCHEMA.captures_iter(query) {
        found.push(format!("apoc.{}", &caps[1]));
    }
    found
}

/// Whether the clause that binds variables for a delete at `at` has a WHERE
fn guarded_by_where(masked: &str, at: usize) -> bool {
    let before = masked.get(..at).unwrap_or_default();
    let start = BINDING_CLAUSE
        .find_iter(before)
        .filter(|m| {
            let prev_word = before[..m.start()]
                .trim_end()
                .rsplit(|c: char| !c.is_alphanumeric())
                .next()
                .unwrap_or("")
                .to_uppercase();
            prev_word != "STARTS" && prev_word != "ENDS"
        })
        .last()
        .map(|m| m.end())
        .unwrap_or(0);
    WHERE_KEYWORD.is_match(&before[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> QueryValidator {
        QueryValidator::default()
    }

    #[test]
    fn test_simple_read_query_is_valid() {
        let result = validator().validate("MATCH (n:Customer) RETURN n LIMIT 10");
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert_eq!(result.complexity_score, WEIGHT_MATCH);
        assert!(!result.policy_violation);
    }

    #[test]
    fn test_missing_limit_is_a_warning() {
        let result = validator().validate("MATCH (n:Customer) RETURN n");
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("LIMIT")));
    }

    #[test]
    fn test_delete_all_is_rejected_with_operation_named() {
        for query in [
            "MATCH (n) DETACH DELETE n",
            "// cleanup\nmatch (n)   detach delete n",
            "MATCH (n) DELETE n",
            "MATCH (c:Customer) RETURN c UNION MATCH (n) DETACH DELETE n RETURN 1",
        ] {
            let result = validator().validate(query);
            assert!(!result.valid, "{}", query);
            assert!(result.policy_violation);
            assert!(
                result.errors.iter().any(|e| e.contains("DELETE")),
                "{:?}",
                result.errors
            );
        }
    }

    #[test]
    fn test_unguarded_delete_after_earlier_where_is_flagged() {
        let validator = validator().with_allow_write(true);
        for query in [
            "MATCH (c:Customer) WHERE c.vip = true WITH count(c) AS vips MATCH (n) DETACH DELETE n",
            "MATCH (o:Order) WHERE o.total > $min WITH count(o) AS c MATCH (n:Customer) DETACH DELETE n",
            "MATCH (n:Customer {note: 'WHERE'}) DETACH DELETE n",
            "MATCH (c:Customer) WHERE c.vip RETURN c UNION MATCH (n:Order) DETACH DELETE n RETURN 1",
        ] {
            let result = validator.validate(query);
            assert!(
                result.warnings.iter().any(|w| w.starts_with("Destructive operation")),
                "{}: {:?}",
                query,
                result.warnings
            );
        }

        for query in [
            "MATCH (n:Customer) WHERE n.id = $id DETACH DELETE n",
            "MATCH (n:Customer) WHERE n.email STARTS WITH $domain DETACH DELETE n",
        ] {
            let result = validator.validate(query);
            assert!(
                !result.warnings.iter().any(|w| w.starts_with("Destructive operation")),
                "{}: {:?}",
                query,
                result.warnings
            );
        }
    }

    #[test]
    fn test_drop_is_rejected() {
        let result = validator().validate("DROP INDEX customer_email");
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("DROP INDEX")));
    }

    #[test]
    fn test_writes_allowed_when_enabled() {
        let validator = validator().with_allow_write(true);
        let result = validator.validate("MATCH (n) DETACH DELETE n");
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.iter().any(|w| w.contains("Destructive")));

        let result = validator.validate("CREATE (c:Customer {name: $name}) RETURN c");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_write_keywords_rejected_in_read_only_mode() {
        let result = validator().validate("MATCH (c:Customer) SET c.vip = true RETURN c");
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.ends_with("SET")));
    }

    #[test]
    fn test_keywords_inside_strings_and_properties_are_ignored() {
        let result = validator()
            .validate("MATCH (n:Order) WHERE n.set = $v AND n.note STARTS WITH $p RETURN n LIMIT 5");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_end_and_case_properties_are_not_keywords() {
        let v = validator();
        for query in [
            "MATCH (e:Event) RETURN e.end LIMIT 5",
            "MATCH (e:Event) RETURN e.case, e.end AS finished LIMIT 5",
            "MATCH (e:Event) RETURN {end: e.end} AS window LIMIT 5",
            "MATCH (e:Event) RETURN CASE WHEN e.end > $cutoff THEN 1 ELSE 0 END AS late LIMIT 5",
        ] {
            let result = v.validate(query);
            assert!(result.valid, "{}: {:?}", query, result.errors);
        }

        let result = v.validate("MATCH (e:Event) RETURN CASE WHEN e.end > $cutoff THEN 1 LIMIT 5");
        assert!(result.errors.iter().any(|e| e.starts_with("Unbalanced CASE")));
    }

    #[test]
    fn test_structural_errors() {
        let v = validator();
        assert_eq!(v.validate("   ").errors, vec!["Query is empty"]);
        assert!(
            v.validate("MATCH (n:Customer RETURN n")
                .errors
                .iter()
                .any(|e| e.contains("never closed"))
        );
        assert!(
            v.validate("MATCH (n) WHERE n.name = 'x RETURN n")
                .errors
                .iter()
                .any(|e| e.contains("Unterminated string"))
        );
        assert!(
            v.validate("RETURN 1 WHERE true")
                .errors
                .iter()
                .any(|e| e.starts_with("WHERE must follow"))
        );
        assert!(
            v.validate("MATCH (n) ORDER BY n.name RETURN n")
                .errors
                .iter()
                .any(|e| e.starts_with("ORDER BY must follow"))
        );
        assert!(
            v.validate("MATCH (n:Customer)")
                .errors
                .contains(&"Read query has no RETURN clause".to_string())
        );
        assert!(
            v.validate("show me customers")
                .errors
                .iter()
                .any(|e| e.starts_with("Query must start"))
        );
        assert!(
            v.validate("MATCH (n) RETURN n; MATCH (m) RETURN m")
                .errors
                .contains(&"Multiple statements are not allowed".to_string())
        );
    }

    #[test]
    fn test_risk_warnings() {
        let result =
            validator().validate("MATCH (a:Customer), (b:Product) WHERE a.name = 'Alice' AND b.price > 10 RETURN a, b LIMIT 5");
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("cartesian")));
        assert!(result.warnings.iter().any(|w| w.contains("'Alice'")));
        assert!(result.warnings.iter().any(|w| w.contains("Literal value 10")));

        let result = validator().validate("MATCH (a)-[:KNOWS*]->(b) RETURN b LIMIT 5");
        assert!(result.warnings.iter().any(|w| w.contains("Unbounded")));
        let result = validator().validate("MATCH (a)-[:KNOWS*1..3]->(b) RETURN b LIMIT 5");
        assert!(!result.warnings.iter().any(|w| w.contains("Unbounded")));
    }

    #[test]
    fn test_complexity_is_additive() {
        let v = validator();
        let simple = v.complexity("MATCH (n) RETURN n");
        let richer = v.complexity(
            "MATCH (c:Customer)-[:PLACED]->(o:Order) WHERE o.total > $min RETURN c.name, count(o) AS orders ORDER BY orders DESC",
        );
        assert_eq!(simple, WEIGHT_MATCH);
        assert_eq!(
            richer,
            WEIGHT_MATCH + WEIGHT_WHERE + WEIGHT_ORDER_BY + WEIGHT_AGGREGATION + WEIGHT_RELATIONSHIP
        );
    }

    #[test]
    fn test_complexity_over_maximum_only_warns() {
        let config = GenerationConfig {
            max_complexity: 5,
            ..GenerationConfig::default()
        };
        let result = QueryValidator::new(&config)
            .validate("MATCH (a)-[:R*1..2]->(b) OPTIONAL MATCH (b)-->(c) RETURN count(c) LIMIT 1");
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.complexity_score > 5);
        assert!(result.warnings.iter().any(|w| w.starts_with("Complexity score")));
    }

    #[test]
    fn test_sanitize_appends_default_limit() {
        let v = validator();
        assert_eq!(
            v.sanitize("MATCH (n:Customer) RETURN n"),
            "MATCH (n:Customer) RETURN n LIMIT 100"
        );
        assert_eq!(
            v.sanitize("  MATCH (n) RETURN n LIMIT 5 ;; "),
            "MATCH (n) RETURN n LIMIT 5"
        );
        assert_eq!(
            v.sanitize("MATCH (n) RETURN n // all of them"),
            "MATCH (n) RETURN n // all of them\nLIMIT 100"
        );
    }

    #[test]
    fn test_sanitize_ignores_nested_limits() {
        let v = validator().with_default_limit(25);
        let query = "CALL { MATCH (n) RETURN n LIMIT 5 } RETURN n";
        assert_eq!(v.sanitize(query), format!("{} LIMIT 25", query));
        assert!(!v.has_limit(query));
        assert!(!v.has_limit("MATCH (n) WHERE n.name = 'LIMIT 3' RETURN n"));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let v = validator();
        for query in [
            "MATCH (n:Customer) RETURN n",
            "MATCH (n) RETURN n LIMIT 3;",
            "MATCH (n) RETURN n // trailing comment",
            "",
            "RETURN 1;",
        ] {
            let once = v.sanitize(query);
            assert_eq!(v.sanitize(&once), once);
            assert!(v.has_limit(&once), "{}", once);
        }
    }

    #[test]
    fn test_is_write_query() {
        let v = validator();
        assert!(v.is_write_query("MERGE (c:Customer {id: $id}) RETURN c"));
        assert!(!v.is_write_query("MATCH (c:Customer) RETURN c.created"));
    }
}
