//! Similarity functions shared by the matcher and the template library

/// Compute cosine similarity between two vectors, clamped to `[0, 1]`
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    (dot_product / (magnitude_a * magnitude_b)).clamp(0.0, 1.0)
}

/// Lowercased alphanumeric words of `text`
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether a question word is the target word or a simple plural of it
fn word_matches(question_word: &str, target_word: &str) -> bool {
    if question_word == target_word {
        return true;
    }
    match question_word.strip_prefix(target_word) {
        Some("s") | Some("es") => true,
        _ => target_word
            .strip_suffix('y')
            .map(|stem| question_word.strip_prefix(stem) == Some("ies"))
            .unwrap_or(false),
    }
}

/// Find `target` as a contiguous word sequence in the question
///
/// Matching is case-insensitive and tolerates plural forms, so the target
/// "client" is found in "Show all clients". Returns the matched words as
/// they appear (lowercased) in the question.
pub fn find_phrase(question_words: &[String], target: &str) -> Option<String> {
    let target_words = tokenize(target);
    if target_words.is_empty() || target_words.len() > question_words.len() {
        return None;
    }

    question_words
        .windows(target_words.len())
        .find(|window| {
            window
                .iter()
                .zip(&target_words)
                .all(|(q, t)| word_matches(q, t))
        })
        .map(|window| window.join(" "))
}

/// Fraction of the target's words present in the question
pub fn word_overlap(question_words: &[String], target: &str) -> f32 {
    let target_words = tokenize(target);
    if target_words.is_empty() {
        return 0.0;
    }
    let hits = target_words
        .iter()
        .filter(|t| question_words.iter().any(|q| word_matches(q, t)))
        .count();
    hits as f32 / target_words.len() as f32
}
