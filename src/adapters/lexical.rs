//! Deterministic lexical adapters.
//!
//! Cheap stand-ins for NLI, judge and retrieval models. They are good enough
//! to run the controller offline and make its tests reproducible.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::request::EvidenceBundle;
use crate::text;

use super::{Candidate, Entailment, EntailmentAdapter, RetrievalAdapter, Scorer, SpanCoverage};

/// Token-overlap entailment with negation and number mismatch detection.
#[derive(Debug, Clone)]
pub struct LexicalEntailment {
    /// Overlap needed before two claims are considered about the same thing
    pub topic_overlap: f64,
    /// Overlap at which a same-polarity pair counts as entailment
    pub entail_overlap: f64,
}

impl Default for LexicalEntailment {
    fn default() -> Self {
        Self {
            topic_overlap: 0.5,
            entail_overlap: 0.8,
        }
    }
}

impl LexicalEntailment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous core, shared with the scorer heuristics.
    pub fn classify(&self, a: &str, b: &str) -> Entailment {
        let ta = non_numeric(text::token_set(a));
        let tb = non_numeric(text::token_set(b));
        if ta.is_empty() || tb.is_empty() {
            return Entailment::neutral(0.5);
        }

        let shared = ta.intersection(&tb).count() as f64;
        let overlap = shared / ta.len().min(tb.len()) as f64;
        if overlap < self.topic_overlap {
            return Entailment::neutral(1.0 - overlap);
        }

        if text::has_negation(a) != text::has_negation(b) {
            return Entailment::contradict(overlap);
        }

        let na = text::numbers(a);
        let nb = text::numbers(b);
        if !na.is_empty() && !nb.is_empty() && na.is_disjoint(&nb) {
            return Entailment::contradict(overlap);
        }

        if overlap >= self.entail_overlap {
            Entailment::entail(overlap)
        } else {
            Entailment::neutral(overlap)
        }
    }
}

fn non_numeric(tokens: HashSet<String>) -> HashSet<String> {
    tokens
        .into_iter()
        .filter(|t| !t.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .collect()
}

#[async_trait]
impl EntailmentAdapter for LexicalEntailment {
    async fn entail(&self, claim_a: &str, claim_b: &str) -> Result<Entailment> {
        Ok(self.classify(claim_a, claim_b))
    }
}

/// Best token coverage of a claim against the evidence spans.
#[derive(Debug, Clone, Default)]
pub struct LexicalRetrieval;

impl LexicalRetrieval {
    pub fn best_span(claim: &str, context: &EvidenceBundle) -> SpanCoverage {
        let claim_tokens = text::token_set(claim);
        context
            .spans
            .iter()
            .map(|span| {
                let score = text::coverage(&claim_tokens, &text::token_set(&span.text));
                SpanCoverage::new(score, span.id.clone())
            })
            .fold(SpanCoverage::none(), |best, next| {
                if next.score > best.score {
                    next
                } else {
                    best
                }
            })
    }
}

#[async_trait]
impl RetrievalAdapter for LexicalRetrieval {
    async fn coverage(&self, claim: &str, context: &EvidenceBundle) -> Result<SpanCoverage> {
        Ok(Self::best_span(claim, context))
    }
}

/// Fraction of the candidate's sentences supported by some evidence span.
#[derive(Debug, Clone)]
pub struct LexicalCitationAligner {
    pub min_overlap: f64,
}

impl Default for LexicalCitationAligner {
    fn default() -> Self {
        Self { min_overlap: 0.5 }
    }
}

#[async_trait]
impl Scorer for LexicalCitationAligner {
    async fn score(&self, candidate: &Candidate, context: Option<&EvidenceBundle>) -> Result<f64> {
        let Some(context) = context.filter(|c| !c.is_empty()) else {
            return Ok(0.0);
        };
        let sentences = text::sentences(&candidate.text);
        if sentences.is_empty() {
            return Ok(0.0);
        }
        let supported = sentences
            .iter()
            .filter(|s| LexicalRetrieval::best_span(s, context).score >= self.min_overlap)
            .count();
        Ok(supported as f64 / sentences.len() as f64)
    }

    fn name(&self) -> &str {
        "citation"
    }
}

/// Surface-level judge: penalizes hedging, sweeping absolutes and
/// unsupported precision.
#[derive(Debug, Clone, Default)]
pub struct HeuristicJudge;

const HEDGES: &[&str] = &[
    "i think", "i believe", "probably", "might", "perhaps", "possibly", "not sure", "maybe",
];
const ABSOLUTES: &[&str] = &["always", "never", "every", "all ", "none", "guaranteed"];

impl HeuristicJudge {
    pub fn assess(text: &str) -> f64 {
        let lower = text.to_lowercase();
        if lower.trim().is_empty() {
            return 0.0;
        }
        let mut risk: f64 = 0.0;
        if HEDGES.iter().any(|h| lower.contains(h)) {
            risk += 0.3;
        }
        if ABSOLUTES.iter().any(|a| lower.contains(a)) {
            risk += 0.2;
        }
        if text::numbers(text).len() > 3 {
            risk += 0.15;
        }
        if lower.contains("as an ai") || lower.contains("i cannot") {
            risk += 0.4;
        }
        (1.0 - risk).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl Scorer for HeuristicJudge {
    async fn score(&self, candidate: &Candidate, _context: Option<&EvidenceBundle>) -> Result<f64> {
        Ok(Self::assess(&candidate.text))
    }

    fn name(&self) -> &str {
        "heuristic_judge"
    }
}
