//! Monitor: uncertainty signals from the K candidates and the claim graph.

mod signals;

pub use signals::{
    best_candidate, binary_entropy_bits, entropy_prefix_slope, heuristic_confidence,
    k_sample_variance, model_confidence, sigmoid, slope,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::adapters::{Candidate, RetrievalAdapter};
use crate::claims::ClaimGraph;
use crate::config::SignalConfig;
use crate::request::EvidenceBundle;

/// The four monitor signals, each in [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    pub k_sample_variance: f64,
    pub entropy_prefix_slope: f64,
    pub contradiction_mass: f64,
    pub rag_coverage: f64,
}

impl Signals {
    /// What the controller sees when nothing could be measured.
    pub fn worst_case() -> Self {
        Self {
            k_sample_variance: 1.0,
            entropy_prefix_slope: 1.0,
            contradiction_mass: 1.0,
            rag_coverage: 0.0,
        }
    }
}

/// Signals plus what the pipeline needs to cite and pick a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReport {
    pub signals: Signals,
    /// Position in the candidate list of the highest-confidence candidate
    pub best_candidate: Option<usize>,
    /// (claim node, supporting span id) for every supported kept claim
    pub supported: Vec<(usize, String)>,
    /// Retrieval calls that failed
    pub retrieval_failures: usize,
}

impl SignalReport {
    /// Distinct span ids supporting kept claims of one candidate, in claim order.
    pub fn citations_for(&self, graph: &ClaimGraph, candidate_index: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (node, span) in &self.supported {
            let from_candidate = graph
                .claims
                .get(*node)
                .is_some_and(|c| c.source_candidate == candidate_index);
            if from_candidate && !out.contains(span) {
                out.push(span.clone());
            }
        }
        out
    }
}

/// Computes [`Signals`] for one generation round.
pub struct SignalExtractor {
    retrieval: Arc<dyn RetrievalAdapter>,
    config: SignalConfig,
}

impl SignalExtractor {
    pub fn new(retrieval: Arc<dyn RetrievalAdapter>, config: SignalConfig) -> Self {
        Self { retrieval, config }
    }

    pub async fn extract(
        &self,
        candidates: &[Candidate],
        graph: &ClaimGraph,
        context: Option<&EvidenceBundle>,
    ) -> SignalReport {
        let best = best_candidate(candidates, graph);
        let entropy = best
            .and_then(|pos| candidates.get(pos))
            .map(|c| {
                entropy_prefix_slope(
                    &c.token_log_probs,
                    self.config.entropy_prefix_tokens,
                    self.config.entropy_slope_gain,
                )
            })
            .unwrap_or(0.5);

        let (rag_coverage, supported, retrieval_failures) = match context {
            Some(ctx) if !ctx.is_empty() => self.rag_coverage(graph, ctx).await,
            _ => (0.0, Vec::new(), 0),
        };

        SignalReport {
            signals: Signals {
                k_sample_variance: k_sample_variance(candidates),
                entropy_prefix_slope: entropy,
                contradiction_mass: graph.contradiction_mass(),
                rag_coverage,
            },
            best_candidate: best,
            supported,
            retrieval_failures,
        }
    }

    /// Fraction of kept claims with a span at or above the overlap minimum.
    /// Any retrieval failure forces coverage to 0.
    async fn rag_coverage(
        &self,
        graph: &ClaimGraph,
        context: &EvidenceBundle,
    ) -> (f64, Vec<(usize, String)>, usize) {
        if graph.kept.is_empty() {
            return (0.0, Vec::new(), 0);
        }

        let lookups = graph.kept.iter().filter_map(|&node| {
            let claim = graph.claims.get(node)?;
            Some(async move { (node, self.retrieval.coverage(&claim.text, context).await) })
        });

        let mut supported = Vec::new();
        let mut failures = 0;
        for (node, result) in join_all(lookups).await {
            match result {
                Ok(cov) if cov.score >= self.config.min_retrieval_overlap => {
                    if let Some(span) = cov.span_id {
                        supported.push((node, span));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    warn!(claim = node, error = %e, "retrieval call failed");
                }
            }
        }

        if failures > 0 {
            return (0.0, Vec::new(), failures);
        }
        let coverage = supported.len() as f64 / graph.kept.len() as f64;
        (coverage, supported, 0)
    }
}
