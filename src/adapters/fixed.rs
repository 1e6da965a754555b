//! Constant-output adapters for deterministic tests of the controller.

use async_trait::async_trait;

use crate::error::Result;
use crate::request::EvidenceBundle;

use super::{
    Candidate, Entailment, EntailmentAdapter, GenerationPrompt, Generator, RetrievalAdapter,
    Scorer, SpanCoverage,
};

/// Scorer that always returns the same value.
#[derive(Debug, Clone)]
pub struct FixedScorer {
    name: String,
    value: f64,
}

impl FixedScorer {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[async_trait]
impl Scorer for FixedScorer {
    async fn score(&self, _candidate: &Candidate, _context: Option<&EvidenceBundle>) -> Result<f64> {
        Ok(self.value)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Entailment adapter that labels every pair the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedEntailment(pub Entailment);

impl Default for FixedEntailment {
    fn default() -> Self {
        Self(Entailment::neutral(0.5))
    }
}

#[async_trait]
impl EntailmentAdapter for FixedEntailment {
    async fn entail(&self, _claim_a: &str, _claim_b: &str) -> Result<Entailment> {
        Ok(self.0)
    }
}

/// Retrieval adapter that reports the same coverage for every claim,
/// citing the first evidence span.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetrieval(pub f64);

#[async_trait]
impl RetrievalAdapter for FixedRetrieval {
    async fn coverage(&self, _claim: &str, context: &EvidenceBundle) -> Result<SpanCoverage> {
        Ok(match context.spans.first() {
            Some(span) => SpanCoverage::new(self.0, span.id.clone()),
            None => SpanCoverage::none(),
        })
    }
}

/// Generator replaying a fixed list of answers, rotated by sample index.
#[derive(Debug, Clone)]
pub struct StaticGenerator {
    answers: Vec<Candidate>,
}

impl StaticGenerator {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers
                .into_iter()
                .enumerate()
                .map(|(i, text)| Candidate::new(i, text))
                .collect(),
        }
    }

    pub fn from_candidates(answers: Vec<Candidate>) -> Self {
        Self { answers }
    }
}

#[async_trait]
impl Generator for StaticGenerator {
    async fn generate(&self, prompt: &GenerationPrompt<'_>, k: usize) -> Result<Vec<Candidate>> {
        if self.answers.is_empty() {
            return Ok(Vec::new());
        }
        Ok((0..k)
            .map(|j| {
                let slot = prompt.sample_index + j;
                let mut candidate = self.answers[slot % self.answers.len()].clone();
                candidate.index = slot;
                candidate
            })
            .collect())
    }
}
