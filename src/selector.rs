//! Dynamic-K selection.
//!
//! Picks how many candidates to sample from a cheap a-priori risk estimate:
//! - Query length (longer questions tend to have more failure points)
//! - Retrieval thinness (little or no evidence to ground the answer)
//! - Domain risk of the route tag
//!
//! The estimate is a fixed convex combination of the three terms, mapped to
//! K ∈ {1, 3, 5} by two cut points. No hidden state.

use serde::{Deserialize, Serialize};

use crate::config::SelectorConfig;
use crate::request::Request;

/// The terms behind one K decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KSelection {
    pub k: usize,
    /// Combined risk estimate r in [0,1]
    pub risk: f64,
    pub length_proxy: f64,
    pub retrieval_thinness: f64,
    pub domain_risk: f64,
}

/// Maps a request to the number of samples K.
#[derive(Debug, Clone, Default)]
pub struct DynamicKSelector {
    config: SelectorConfig,
}

impl DynamicKSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Query length scaled to [0,1], saturating at the configured length.
    pub fn length_proxy(&self, query: &str) -> f64 {
        let saturation = self.config.length_saturation_chars.max(1) as f64;
        (query.chars().count() as f64 / saturation).min(1.0)
    }

    /// 1.0 with no evidence, falling linearly to 0.0 once the bundle holds
    /// `thick_context_spans` spans.
    pub fn retrieval_thinness(&self, request: &Request) -> f64 {
        let spans = request.context.as_ref().map_or(0, |c| c.len());
        let thick = self.config.thick_context_spans.max(1) as f64;
        1.0 - (spans as f64 / thick).min(1.0)
    }

    pub fn domain_risk(&self, request: &Request) -> f64 {
        self.config
            .route_risk
            .get(request.route.as_str())
            .copied()
            .unwrap_or(self.config.default_route_risk)
            .clamp(0.0, 1.0)
    }

    pub fn select(&self, request: &Request) -> KSelection {
        let length_proxy = self.length_proxy(&request.query);
        let retrieval_thinness = self.retrieval_thinness(request);
        let domain_risk = self.domain_risk(request);

        let risk = (self.config.length_weight * length_proxy
            + self.config.thinness_weight * retrieval_thinness
            + self.config.domain_weight * domain_risk)
            .clamp(0.0, 1.0);

        KSelection {
            k: self.k_for_risk(risk),
            risk,
            length_proxy,
            retrieval_thinness,
            domain_risk,
        }
    }

    pub fn k_for_risk(&self, risk: f64) -> usize {
        if risk < self.config.low_cut {
            1
        } else if risk < self.config.high_cut {
            3
        } else {
            5
        }
    }
}
