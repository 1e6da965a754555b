//! Lexical helpers shared by the heuristic adapters and the signal extractor.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+(?:'[a-z]+)?(?:\.[0-9]+)?").expect("static regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "to", "in", "on", "at", "by", "for", "and", "or", "as", "is", "are",
    "was", "were", "be", "been", "it", "its", "this", "that", "these", "those", "with", "from",
];

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "cannot", "can't", "isn't", "aren't", "wasn't", "weren't",
    "doesn't", "don't", "didn't", "won't", "false", "neither", "nor",
];

/// Lowercased word tokens, in order, stopwords removed.
pub fn tokens(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Distinct word tokens.
pub fn token_set(text: &str) -> HashSet<String> {
    tokens(text).into_iter().collect()
}

/// Jaccard similarity of two token sets; two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

/// Fraction of `needle`'s tokens present in `haystack`.
pub fn coverage(needle: &HashSet<String>, haystack: &HashSet<String>) -> f64 {
    if needle.is_empty() {
        return 0.0;
    }
    needle.intersection(haystack).count() as f64 / needle.len() as f64
}

/// Whether the text contains a negation cue.
pub fn has_negation(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("n't")
        || WORD_RE
            .find_iter(&lower)
            .any(|m| NEGATIONS.contains(&m.as_str()))
}

/// Numeric literals appearing in the text.
pub fn numbers(text: &str) -> HashSet<String> {
    tokens(text)
        .into_iter()
        .filter(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .collect()
}

/// Split text into sentences on terminal punctuation or blank lines.
pub fn sentences(text: &str) -> Vec<String> {
    static SENTENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)|\n\n+").expect("static regex"));
    SENTENCE_RE
        .split(text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
