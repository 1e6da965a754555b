//! Claim extraction from candidate answers.
//!
//! Pattern segmentation: split into sentences, drop questions and
//! meta-commentary, keep the earliest `max_claims` that remain.

use regex::Regex;
use std::sync::LazyLock;

use crate::config::GraphConfig;

use super::types::Claim;

static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+\s+|[.!]+$|\n\n+|\n\s*[-*]\s+").expect("static regex"));

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("e.g.", "e\u{1}g\u{1}"),
    ("i.e.", "i\u{1}e\u{1}"),
    ("etc.", "etc\u{1}"),
    ("vs.", "vs\u{1}"),
    ("Mr.", "Mr\u{1}"),
    ("Ms.", "Ms\u{1}"),
    ("Dr.", "Dr\u{1}"),
];

const META_PREFIXES: &[&str] = &[
    "let me",
    "i'll",
    "i will",
    "here is",
    "here's",
    "in summary",
    "to summarize",
    "great question",
    "sure",
    "i hope this helps",
];

const HEDGE_WORDS: &[&str] = &[
    "might", "could", "possibly", "perhaps", "probably", "likely", "seems", "appears", "i think",
    "i believe", "may",
];

/// Extracts atomic claims from candidate text.
#[derive(Debug, Clone)]
pub struct ClaimExtractor {
    min_length: usize,
    max_length: usize,
    max_claims: usize,
}

impl Default for ClaimExtractor {
    fn default() -> Self {
        Self::from_config(&GraphConfig::default())
    }
}

impl ClaimExtractor {
    /// Extractor with the lengths and claim cap from `GraphConfig`.
    pub fn from_config(config: &GraphConfig) -> Self {
        Self {
            min_length: config.min_claim_length,
            max_length: config.max_claim_length,
            max_claims: config.max_claims_per_candidate,
        }
    }

    /// Sentences shorter than this many characters are not claims.
    pub fn with_min_length(mut self, len: usize) -> Self {
        self.min_length = len;
        self
    }

    /// Sentences longer than this many characters are not claims; the whole-text fallback is cut to it.
    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = len;
        self
    }

    /// Caps the claims taken from one candidate.
    pub fn with_max_claims(mut self, max: usize) -> Self {
        self.max_claims = max;
        self
    }

    /// Extract claims from one candidate, earliest first, capped at
    /// `max_claims`. A non-empty answer with no qualifying sentence
    /// (e.g. "Paris.") becomes a single claim.
    pub fn extract(&self, candidate_index: usize, text: &str) -> Vec<Claim> {
        let mut claims = Vec::new();
        let mut cursor = 0;

        for sentence in split_sentences(text) {
            if claims.len() >= self.max_claims {
                break;
            }
            let span = find_span(text, &sentence, cursor);
            if let Some((_, end)) = span {
                cursor = end;
            }

            let len = sentence.chars().count();
            if len < self.min_length || len > self.max_length {
                continue;
            }
            let is_question = sentence.ends_with('?')
                || span.is_some_and(|(_, end)| text[end..].starts_with('?'));
            if is_question || is_meta_commentary(&sentence) {
                continue;
            }

            let (start, end) = span.unwrap_or((0, text.len()));
            let hedged = is_hedged(&sentence);
            claims.push(
                Claim::new(candidate_index, sentence)
                    .with_span(start, end)
                    .with_ordinal(claims.len())
                    .with_hedged(hedged),
            );
        }

        let whole = text.trim();
        if claims.is_empty() && !whole.is_empty() && self.max_claims > 0 {
            let truncated: String = whole.chars().take(self.max_length.max(1)).collect();
            let start = text.find(whole).unwrap_or(0);
            let end = start + truncated.len();
            let hedged = is_hedged(&truncated);
            claims.push(
                Claim::new(candidate_index, truncated)
                    .with_span(start, end)
                    .with_hedged(hedged),
            );
        }

        claims
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut protected = text.to_string();
    for (abbr, marker) in ABBREVIATIONS {
        protected = protected.replace(abbr, marker);
    }

    SENTENCE_BOUNDARY
        .split(&protected)
        .map(|s| {
            let mut restored = s.trim().to_string();
            for (abbr, marker) in ABBREVIATIONS {
                restored = restored.replace(marker, abbr);
            }
            restored
                .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_whitespace())
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn find_span(text: &str, sentence: &str, from: usize) -> Option<(usize, usize)> {
    let haystack = text.get(from..)?;
    let offset = haystack.find(sentence)?;
    let start = from + offset;
    Some((start, start + sentence.len()))
}

fn is_meta_commentary(sentence: &str) -> bool {
    let lower = sentence.to_lowercase();
    META_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn is_hedged(sentence: &str) -> bool {
    let lower = format!(" {} ", sentence.to_lowercase());
    HEDGE_WORDS
        .iter()
        .any(|h| lower.contains(&format!(" {} ", h)))
}
