//! Cypher extraction from model output
//!
//! Models wrap queries in markdown fences, prefix them with labels or add
//! an explanation afterwards. Extraction keeps only the query text.

/// A fenced code block extracted from markdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// The language identifier (e.g., "cypher")
    pub language: String,
    /// The code content
    pub code: String,
}

impl CodeBlock {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
        }
    }
}

/// Extract code blocks from markdown-formatted text
pub fn extract_code_blocks(content: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut in_block = false;
    let mut current_language = String::new();
    let mut current_code = String::new();

    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            if in_block {
                if !current_code.trim().is_empty() {
                    blocks.push(CodeBlock::new(
                        current_language.clone(),
                        current_code.trim().to_string(),
                    ));
                }
                current_language.clear();
                current_code.clear();
                in_block = false;
            } else {
                current_language = line.trim().trim_start_matches('`').trim().to_lowercase();
                if current_language.is_empty() {
                    current_language = "txt".to_string();
                }
                in_block = true;
            }
        } else if in_block {
            current_code.push_str(line);
            current_code.push('\n');
        }
    }

    blocks
}

/// Pull the Cypher query out of a model response
///
/// Prefers a ```cypher block, then any fenced block, then the raw text with
/// a leading `Cypher:`/`Query:` label removed and trailing prose dropped.
pub fn extract_cypher(response: &str) -> String {
    let blocks = extract_code_blocks(response);
    if let Some(block) = blocks
        .iter()
        .find(|b| b.language == "cypher" || b.language == "neo4j")
        .or_else(|| blocks.first())
    {
        return block.code.clone();
    }

    let text = response.trim();
    let text = strip_label(text);

    // Keep lines up to the first blank line; models put explanations after it
    text.lines()
        .take_while(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn strip_label(text: &str) -> &str {
    for label in ["cypher:", "query:"] {
        if let Some(head) = text.get(..label.len()) {
            if head.eq_ignore_ascii_case(label) {
                return text[label.len()..].trim_start();
            }
        }
    }
    text
}
