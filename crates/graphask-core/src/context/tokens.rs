//! Token estimation
//!
//! Counts are estimated from word counts with a configurable
//! words-to-tokens ratio. They never need to match a real tokenizer, only
//! to be consistent between budgeting and reporting.

/// Estimates token counts from word counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    words_to_tokens_ratio: f32,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator {
    pub fn new(words_to_tokens_ratio: f32) -> Self {
        let ratio = if words_to_tokens_ratio.is_finite() && words_to_tokens_ratio > 0.0 {
            words_to_tokens_ratio
        } else {
            1.0
        };
        Self {
            words_to_tokens_ratio: ratio,
        }
    }

    pub fn ratio(&self) -> f32 {
        self.words_to_tokens_ratio
    }

    /// `ceil(words * ratio)`
    pub fn estimate(&self, text: &str) -> usize {
        let words = text.split_whitespace().count();
        (words as f32 * self.words_to_tokens_ratio).ceil() as usize
    }
}
