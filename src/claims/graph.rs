//! Cross-candidate claim graph and its maximum consistent subgraph.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::adapters::{Candidate, EntailmentAdapter};
use crate::config::GraphConfig;
use crate::error::{Error, Result};

use super::extract::ClaimExtractor;
use super::types::{Claim, ClaimEdge};

/// Claims from all candidates of one request, their pairwise edges and the
/// greedy consistent subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimGraph {
    pub claims: Vec<Claim>,
    pub edges: Vec<ClaimEdge>,
    /// Node indices of the consistent subgraph, ascending
    pub kept: Vec<usize>,
    /// Node indices removed by the greedy pass, in removal order
    pub removed: Vec<usize>,
    /// Entailment calls that failed
    pub failed_pairs: usize,
}

impl ClaimGraph {
    /// Assemble a graph from already-labelled edges and run the greedy pass.
    ///
    /// Any failed entailment call makes the whole graph untrustworthy: no
    /// claim is kept, so contradiction mass is 1.
    pub fn from_edges(
        claims: Vec<Claim>,
        edges: Vec<ClaimEdge>,
        failed_pairs: usize,
        threshold: f64,
    ) -> Self {
        let (kept, removed) = if failed_pairs > 0 {
            (Vec::new(), (0..claims.len()).collect())
        } else {
            greedy_consistent_subset(claims.len(), &edges, threshold)
        };
        Self {
            claims,
            edges,
            kept,
            removed,
            failed_pairs,
        }
    }

    /// 1 - |kept| / |total|; 0 with no claims.
    pub fn contradiction_mass(&self) -> f64 {
        if self.claims.is_empty() {
            return 0.0;
        }
        1.0 - self.kept.len() as f64 / self.claims.len() as f64
    }

    pub fn is_degraded(&self) -> bool {
        self.failed_pairs > 0
    }

    pub fn kept_claims(&self) -> impl Iterator<Item = &Claim> {
        self.kept.iter().filter_map(|&i| self.claims.get(i))
    }

    /// Kept claims that came from one candidate.
    pub fn kept_claims_of(&self, candidate: usize) -> impl Iterator<Item = &Claim> {
        self.kept_claims()
            .filter(move |c| c.source_candidate == candidate)
    }

    /// Fraction of a candidate's claims that survived the consistency pass.
    /// A candidate with no claims scores 0.
    pub fn survival_rate(&self, candidate: usize) -> f64 {
        let total = self
            .claims
            .iter()
            .filter(|c| c.source_candidate == candidate)
            .count();
        if total == 0 {
            return 0.0;
        }
        self.kept_claims_of(candidate).count() as f64 / total as f64
    }

    /// Fraction of a candidate's kept claims that are hedged; 0 with none kept.
    pub fn hedged_rate(&self, candidate: usize) -> f64 {
        let (hedged, kept) = self
            .kept_claims_of(candidate)
            .fold((0usize, 0usize), |(h, k), c| (h + usize::from(c.hedged), k + 1));
        if kept == 0 {
            return 0.0;
        }
        hedged as f64 / kept as f64
    }
}

/// Unordered pairs of claims from different candidates, `a < b`.
pub fn candidate_pairs(claims: &[Claim]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for a in 0..claims.len() {
        for b in (a + 1)..claims.len() {
            if claims[a].source_candidate != claims[b].source_candidate {
                pairs.push((a, b));
            }
        }
    }
    pairs
}

/// Greedy approximation of the maximum independent set on the contradiction
/// subgraph: repeatedly drop the node with the largest incident contradiction
/// weight until no edge above `threshold` remains. Ties drop the
/// latest-extracted node.
///
/// Returns (kept ascending, removed in removal order).
pub fn greedy_consistent_subset(
    node_count: usize,
    edges: &[ClaimEdge],
    threshold: f64,
) -> (Vec<usize>, Vec<usize>) {
    let contradictions: Vec<&ClaimEdge> = edges
        .iter()
        .filter(|e| e.is_contradiction_above(threshold))
        .collect();
    let mut alive = vec![true; node_count];
    let mut removed = Vec::new();

    loop {
        let mut load = vec![0.0_f64; node_count];
        for edge in &contradictions {
            if alive[edge.a] && alive[edge.b] {
                load[edge.a] += edge.weight;
                load[edge.b] += edge.weight;
            }
        }

        let worst = load
            .iter()
            .enumerate()
            .filter(|&(_, &w)| w > 0.0)
            .fold(None::<(usize, f64)>, |best, (i, &w)| match best {
                Some((_, bw)) if w < bw => best,
                _ => Some((i, w)),
            });

        match worst {
            Some((node, _)) => {
                alive[node] = false;
                removed.push(node);
            }
            None => break,
        }
    }

    let kept = (0..node_count).filter(|&i| alive[i]).collect();
    (kept, removed)
}

/// Extracts claims and labels every cross-candidate pair.
pub struct ClaimGraphBuilder {
    extractor: ClaimExtractor,
    entailment: Arc<dyn EntailmentAdapter>,
    concurrency: usize,
    threshold: f64,
}

impl ClaimGraphBuilder {
    pub fn new(entailment: Arc<dyn EntailmentAdapter>, config: &GraphConfig) -> Self {
        Self {
            extractor: ClaimExtractor::from_config(config),
            entailment,
            concurrency: config.entailment_concurrency.max(1),
            threshold: config.contradiction_threshold,
        }
    }

    /// Replaces the claim extractor.
    pub fn with_extractor(mut self, extractor: ClaimExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn extract_claims(&self, candidates: &[Candidate]) -> Vec<Claim> {
        candidates
            .iter()
            .flat_map(|c| self.extractor.extract(c.index, &c.text))
            .collect()
    }

    /// Build the graph. Each unordered cross-candidate pair is sent to the
    /// entailment adapter exactly once, at most `concurrency` at a time.
    pub async fn build(&self, candidates: &[Candidate]) -> ClaimGraph {
        let claims = self.extract_claims(candidates);
        let pairs = candidate_pairs(&claims);
        debug!(
            claims = claims.len(),
            pairs = pairs.len(),
            "labelling claim pairs"
        );

        let semaphore = Semaphore::new(self.concurrency);
        let calls = pairs.iter().map(|&(a, b)| {
            let semaphore = &semaphore;
            let claims = &claims;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let entailment = self
                    .entailment
                    .entail(&claims[a].text, &claims[b].text)
                    .await?;
                Ok::<_, Error>(ClaimEdge {
                    a,
                    b,
                    label: entailment.label,
                    weight: entailment.weight,
                })
            }
        });

        let mut edges = Vec::with_capacity(pairs.len());
        let mut failed_pairs = 0;
        for result in join_all(calls).await {
            match result {
                Ok(edge) => edges.push(edge),
                Err(e) => {
                    failed_pairs += 1;
                    warn!(error = %e, "entailment call failed");
                }
            }
        }

        ClaimGraph::from_edges(claims, edges, failed_pairs, self.threshold)
    }
}

/// Checks the pair invariants of a built graph. Used by tests.
pub fn validate_pairs(graph: &ClaimGraph) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for edge in &graph.edges {
        if edge.a >= edge.b {
            return Err(Error::Internal(format!("unordered edge {}-{}", edge.a, edge.b)));
        }
        if graph.claims[edge.a].source_candidate == graph.claims[edge.b].source_candidate {
            return Err(Error::Internal(format!(
                "intra-candidate edge {}-{}",
                edge.a, edge.b
            )));
        }
        if !seen.insert((edge.a, edge.b)) {
            return Err(Error::Internal(format!("duplicate edge {}-{}", edge.a, edge.b)));
        }
    }
    Ok(())
}
