//! Question input with optional prior-turn history

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest question accepted, in characters
pub const MAX_QUESTION_CHARS: usize = 2000;

/// A previous exchange in the same conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    /// Query that answered it, if one ran
    pub query: Option<String>,
}

impl Turn {
    pub fn new(question: impl Into<String>, query: Option<String>) -> Self {
        Self {
            question: question.into(),
            query,
        }
    }
}

/// An immutable natural-language question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    text: String,
    history: Vec<Turn>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Reject empty or oversized questions
    pub fn validate(&self) -> Result<()> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("Question cannot be empty".to_string()));
        }
        if text.chars().count() > MAX_QUESTION_CHARS {
            return Err(Error::InvalidInput(format!(
                "Question must be {} characters or less",
                MAX_QUESTION_CHARS
            )));
        }
        Ok(())
    }
}

impl From<&str> for Question {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
