//! Capability interfaces to the external models the controller wraps.
//!
//! Each adapter exposes a single async method. Production deployments back
//! them with real models (see [`llm`]); tests and offline runs use the
//! deterministic [`lexical`] heuristics or the constant [`fixed`] adapters.

pub mod fixed;
pub mod lexical;
pub mod llm;
mod types;

pub use lexical::{HeuristicJudge, LexicalCitationAligner, LexicalEntailment, LexicalRetrieval};
pub use llm::{LlmEntailment, LlmGenerator, LlmScorer, ScorerKind};
pub use types::{Candidate, Entailment, EntailmentLabel, GenerationPrompt, SpanCoverage};

use async_trait::async_trait;

use crate::error::Result;
use crate::request::EvidenceBundle;

/// Produces sampled candidates for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Return up to `k` candidates. Deadlines are enforced by the caller.
    async fn generate(&self, prompt: &GenerationPrompt<'_>, k: usize) -> Result<Vec<Candidate>>;
}

/// Labels the relation between two claims.
#[async_trait]
pub trait EntailmentAdapter: Send + Sync {
    async fn entail(&self, claim_a: &str, claim_b: &str) -> Result<Entailment>;
}

/// Scores a candidate in [0,1]. Judge, process-reward and citation
/// alignment all share this shape.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, candidate: &Candidate, context: Option<&EvidenceBundle>) -> Result<f64>;

    /// Name used in logs and adapter errors.
    fn name(&self) -> &str;
}

/// Measures how well the evidence supports a claim.
#[async_trait]
pub trait RetrievalAdapter: Send + Sync {
    async fn coverage(&self, claim: &str, context: &EvidenceBundle) -> Result<SpanCoverage>;
}
