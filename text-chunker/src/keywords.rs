//! Lexical keyword extraction for sparse indexing.

use std::collections::HashMap;

/// Upper bound on keywords stored per chunk.
pub const MAX_KEYWORDS: usize = 20;

const STOP_WORDS: [&str; 48] = [
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "has", "have", "this", "that", "with", "from", "they", "been", "were", "will",
    "would", "could", "should", "there", "their", "what", "when", "which", "while", "about",
    "into", "over", "then", "them", "than", "its", "also", "each", "such", "only", "some", "more",
    "these",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Extract up to `limit` keywords: lowercase alphanumeric tokens of length
/// >= 3, stop words removed, ranked by frequency descending with
/// alphabetical tie-break for determinism.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let word = raw.trim_matches('_').to_lowercase();
        if word.len() < 3 || word.chars().all(|c| c.is_ascii_digit()) || is_stop_word(&word) {
            continue;
        }
        *counts.entry(word).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked.into_iter().map(|(w, _)| w).collect()
}
