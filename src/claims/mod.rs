//! Atomic claims and the cross-candidate entailment graph.
//!
//! Each candidate is decomposed into claims; every pair of claims from
//! different candidates is labelled by the entailment adapter. A greedy
//! maximum-independent-set pass over high-confidence contradiction edges
//! yields the consistent subgraph, and the removed fraction is the
//! contradiction mass.

mod extract;
mod graph;
mod types;

pub use extract::ClaimExtractor;
pub use graph::{
    candidate_pairs, greedy_consistent_subset, validate_pairs, ClaimGraph, ClaimGraphBuilder,
};
pub use types::{Claim, ClaimEdge, ClaimId};
