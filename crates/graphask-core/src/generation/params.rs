//! Lexical extraction of template parameters from question text

use std::sync::LazyLock;

use regex::Regex;

use crate::matching::similarity::{find_phrase, tokenize};
use crate::providers::SchemaSnapshot;

static TOP_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:top|first|last|best|highest|lowest|largest|biggest)\s+(\w+)\b")
        .expect("top-n regex")
});

static COUNT_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:list|show|give|get|find|return|display|fetch)\s+(?:me\s+)?(?:the\s+|only\s+|just\s+)?(\w+)\s+[A-Za-z]",
    )
    .expect("count phrase regex")
});

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]+)"|'([^']+)'|“([^”]+)”|‘([^’]+)’"#).expect("quoted regex")
});

static PROPERTY_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:by|with|where|whose|per|on)\s+(?:the\s+|a\s+|an\s+|their\s+|its\s+)?([A-Za-z_][A-Za-z0-9_]*)")
        .expect("property cue regex")
});

const NUMBER_WORDS: [(&str, usize); 20] = [
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
    ("eleven", 11),
    ("twelve", 12),
    ("fifteen", 15),
    ("twenty", 20),
    ("thirty", 30),
    ("fifty", 50),
    ("hundred", 100),
    ("dozen", 12),
    ("single", 1),
    ("couple", 2),
];

fn parse_count(word: &str) -> Option<usize> {
    word.parse().ok().or_else(|| {
        let lower = word.to_lowercase();
        NUMBER_WORDS
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, n)| *n)
    })
}

/// Text with quoted values removed, so numbers inside quotes are ignored
fn without_quotes(question: &str) -> String {
    QUOTED.replace_all(question, " ").into_owned()
}

/// Row limit from "top N" or "list N things" phrases
///
/// Other numbers in the question (years, amounts) are never limits.
pub fn extract_limit(question: &str) -> Option<usize> {
    let text = without_quotes(question);
    if let Some(n) = TOP_N
        .captures_iter(&text)
        .find_map(|caps| parse_count(&caps[1]))
    {
        return Some(n).filter(|n| *n > 0);
    }
    COUNT_PHRASE
        .captures_iter(&text)
        .find_map(|caps| parse_count(&caps[1]))
        .filter(|n| *n > 0)
}

/// First quoted value in the question
pub fn extract_quoted(question: &str) -> Option<String> {
    QUOTED.captures(question).and_then(|caps| {
        (1..=4)
            .find_map(|i| caps.get(i))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Property named after a cue word (`by`, `with`, `where`, ...)
///
/// Only words that resolve to one of `candidates` count; "named"/"called"
/// resolve to a `name` property when one exists.
pub fn extract_property(question: &str, candidates: &[String]) -> Option<String> {
    let text = without_quotes(question);
    let resolve = |word: &str| -> Option<String> {
        let words = tokenize(word);
        candidates
            .iter()
            .find(|c| {
                c.eq_ignore_ascii_case(word)
                    || find_phrase(&words, &c.replace('_', " ")).is_some()
                    || find_phrase(&words, c).is_some()
            })
            .cloned()
    };

    for caps in PROPERTY_CUE.captures_iter(&text) {
        if let Some(property) = resolve(&caps[1]) {
            return Some(property);
        }
    }

    let words = tokenize(&text);
    if words.iter().any(|w| w == "named" || w == "called") {
        if let Some(name) = candidates.iter().find(|c| c.eq_ignore_ascii_case("name")) {
            return Some(name.clone());
        }
    }
    None
}

/// Numeric value following the property word, e.g. "total 250"
pub fn extract_number_after(question: &str, property: &str) -> Option<serde_json::Value> {
    let text = without_quotes(question);
    let words: Vec<&str> = text.split_whitespace().collect();
    let position = words
        .iter()
        .position(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '_').eq_ignore_ascii_case(property))?;
    let candidate = words
        .get(position + 1..)?
        .iter()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_digit() && c != '.' && c != '-'))
        .find(|w| !w.is_empty() && !matches!(w.to_lowercase().as_str(), "of" | "is" | "=" | "equals"))?;

    if let Ok(n) = candidate.parse::<i64>() {
        return Some(n.into());
    }
    candidate
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
}

/// Schema label mentioned in the question, tolerating plurals
pub fn label_from_schema(question: &str, schema: &SchemaSnapshot) -> Option<String> {
    let words = tokenize(question);
    schema
        .labels
        .iter()
        .find(|label| find_phrase(&words, label).is_some())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_limit() {
        assert_eq!(extract_limit("top 5 products by price"), Some(5));
        assert_eq!(extract_limit("Show the top ten customers"), Some(10));
        assert_eq!(extract_limit("list 20 orders"), Some(20));
        assert_eq!(extract_limit("How many orders?"), None);
        assert_eq!(extract_limit("customers named '42'"), None);
        assert_eq!(extract_limit("show me 5 customers"), Some(5));
    }

    #[test]
    fn test_extract_limit_ignores_unrelated_numbers() {
        assert_eq!(extract_limit("orders from 2023"), None);
        assert_eq!(extract_limit("list orders placed in 2023"), None);
        assert_eq!(extract_limit("customers with total 250"), None);
    }

    #[test]
    fn test_extract_quoted() {
        assert_eq!(extract_quoted("find customers named 'Ada Lovelace'").as_deref(), Some("Ada Lovelace"));
        assert_eq!(extract_quoted("orders with status \"shipped\"").as_deref(), Some("shipped"));
        assert_eq!(extract_quoted("orders with status “open”").as_deref(), Some("open"));
        assert_eq!(extract_quoted("no quotes here"), None);
    }

    #[test]
    fn test_extract_property() {
        let props = vec!["name".to_string(), "email".to_string(), "placed_at".to_string()];
        assert_eq!(
            extract_property("customers with email 'a@b.c'", &props).as_deref(),
            Some("email")
        );
        assert_eq!(
            extract_property("orders by the placed_at", &props).as_deref(),
            Some("placed_at")
        );
        assert_eq!(
            extract_property("find the customer called 'Ada'", &props).as_deref(),
            Some("name")
        );
        assert_eq!(extract_property("customers by region", &props), None);
    }

    #[test]
    fn test_extract_number_after() {
        assert_eq!(
            extract_number_after("orders with total 250", "total"),
            Some(serde_json::json!(250))
        );
        assert_eq!(
            extract_number_after("products with price of 9.5", "price"),
            Some(serde_json::json!(9.5))
        );
        assert_eq!(extract_number_after("orders with total", "total"), None);
    }

    #[test]
    fn test_label_from_schema() {
        let schema = SchemaSnapshot::new(vec!["Customer".into(), "Order".into()], vec![], vec![]);
        assert_eq!(label_from_schema("How many orders?", &schema).as_deref(), Some("Order"));
        assert_eq!(label_from_schema("How many widgets?", &schema), None);
    }
}
