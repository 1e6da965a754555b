//! LLM client capability and reply parsing helpers.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::Result;

use super::types::{CompletionRequest, CompletionResponse};

/// LLM client trait for making completions.
///
/// Provider integrations live outside this crate; anything that can answer a
/// `CompletionRequest` can back the generator, judge and entailment adapters.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Identifier used in adapter error messages.
    fn name(&self) -> &str {
        "llm"
    }
}

static PROBABILITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.?\d*)\s*(%?)").expect("static regex"));

/// Parse a probability from a model reply.
///
/// Accepts a bare decimal or a percentage on the first line, then falls back
/// to the first number anywhere in the text.
pub fn parse_probability_from_text(text: &str) -> Option<f64> {
    let text = text.trim().to_lowercase();

    if let Some(first_line) = text.lines().next() {
        let cleaned = first_line.trim().trim_matches(|c| c == '"' || c == '\'');

        if let Ok(p) = cleaned.parse::<f64>() {
            if (0.0..=1.0).contains(&p) {
                return Some(p);
            }
        }

        if let Some(stripped) = cleaned.strip_suffix('%') {
            if let Ok(p) = stripped.trim().parse::<f64>() {
                if (0.0..=100.0).contains(&p) {
                    return Some(p / 100.0);
                }
            }
        }
    }

    let cap = PROBABILITY_RE.captures(&text)?;
    let p = cap[1].parse::<f64>().ok()?;
    let p = if !cap[2].is_empty() || p > 1.0 { p / 100.0 } else { p };
    (0.0..=1.0).contains(&p).then_some(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probability() {
        assert_eq!(parse_probability_from_text("0.7"), Some(0.7));
        assert_eq!(parse_probability_from_text("0.85"), Some(0.85));
        assert_eq!(parse_probability_from_text("70%"), Some(0.7));
        assert_eq!(parse_probability_from_text("\"0.6\""), Some(0.6));
        assert_eq!(parse_probability_from_text("0.9\n\nExplanation..."), Some(0.9));
        assert_eq!(parse_probability_from_text("Score: 40%"), Some(0.4));
    }

    #[test]
    fn test_parse_probability_rejects_garbage() {
        assert_eq!(parse_probability_from_text("no idea"), None);
        assert_eq!(parse_probability_from_text("450"), None);
    }
}
