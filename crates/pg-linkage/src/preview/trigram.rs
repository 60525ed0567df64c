//! Trigram distance compatible with pg_trgm's `<->` operator.
//!
//! Text is lower-cased and split into words of alphanumeric characters. Each
//! word is padded with two leading spaces and one trailing space and cut into
//! three-character windows. Similarity is shared trigrams over the union;
//! distance is one minus similarity.

use std::collections::BTreeSet;

/// Distinct trigrams of a string.
pub fn trigrams(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    let mut out = BTreeSet::new();
    for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain(" ".chars()).collect();
        for window in padded.windows(3) {
            out.insert(window.iter().collect());
        }
    }
    out
}

/// pg_trgm `similarity(a, b)`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f64 / union as f64
}

/// pg_trgm `a <-> b`.
pub fn distance(a: &str, b: &str) -> f64 {
    1.0 - similarity(a, b)
}
