//! Claim and claim-graph value types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapters::EntailmentLabel;

/// Unique identifier for a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimId(pub Uuid);

impl ClaimId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An atomic proposition extracted from one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    /// Index of the candidate the claim came from
    pub source_candidate: usize,
    /// Claim text
    pub text: String,
    /// Byte span in the candidate text
    pub span: (usize, usize),
    /// Extraction order within the candidate
    pub ordinal: usize,
    /// Claim is phrased with hedging language
    #[serde(default)]
    pub hedged: bool,
}

impl Claim {
    pub fn new(source_candidate: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let span = (0, text.len());
        Self {
            id: ClaimId::new(),
            source_candidate,
            text,
            span,
            ordinal: 0,
            hedged: false,
        }
    }

    /// Sets the byte span of the claim in its candidate.
    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = (start, end);
        self
    }

    /// Sets the position of the claim within its candidate.
    pub fn with_ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    /// Marks the claim as hedged.
    pub fn with_hedged(mut self, hedged: bool) -> Self {
        self.hedged = hedged;
        self
    }
}

/// A labelled edge between two claims, stored as node indices with `a < b`.
///
/// Entailment edges point from `a` to `b`; contradiction is symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClaimEdge {
    pub a: usize,
    pub b: usize,
    pub label: EntailmentLabel,
    pub weight: f64,
}

impl ClaimEdge {
    pub fn is_contradiction_above(&self, threshold: f64) -> bool {
        self.label == EntailmentLabel::Contradict && self.weight > threshold
    }
}
