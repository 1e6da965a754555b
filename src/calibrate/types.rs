//! Dual state, outcomes and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lagrange multipliers and the conformal coverage threshold.
///
/// Process-wide; only the calibrator writes it, everyone else reads copies.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DualState {
    /// Cost multiplier λ
    pub lambda: f64,
    /// Risk multiplier μ
    pub mu: f64,
    /// Coverage threshold τ
    pub tau: f64,
}

impl DualState {
    pub fn new(lambda: f64, mu: f64, tau: f64) -> Self {
        Self { lambda, mu, tau }
    }

    pub fn is_valid(&self) -> bool {
        self.lambda.is_finite()
            && self.mu.is_finite()
            && self.tau.is_finite()
            && self.lambda >= 0.0
            && self.mu >= 0.0
            && (0.0..=1.0).contains(&self.tau)
    }
}

/// A labelled outcome of an earlier decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Request the outcome belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qid: Option<String>,
    /// Realized cost as a fraction of the token cap
    pub observed_cost: f64,
    /// Cost the request was meant to stay under, same unit
    pub cost_budget: f64,
    /// Realized risk: 1.0 for a wrong emitted answer, 0.0 for a right one
    pub observed_risk: f64,
    /// Risk cap of the original request
    pub risk_cap: f64,
    /// rag_coverage at decision time, when evidence was supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
}

impl Outcome {
    pub fn new(observed_cost: f64, cost_budget: f64, observed_risk: f64, risk_cap: f64) -> Self {
        Self {
            qid: None,
            observed_cost,
            cost_budget,
            observed_risk,
            risk_cap,
            coverage: None,
        }
    }

    /// Tags the outcome with its request id.
    pub fn with_qid(mut self, qid: impl Into<String>) -> Self {
        self.qid = Some(qid.into());
        self
    }

    /// Attaches the coverage observed for the emitted answer.
    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Reject labels that would poison the dual state.
    pub fn validate(&self) -> Result<()> {
        let finite = [
            self.observed_cost,
            self.cost_budget,
            self.observed_risk,
            self.risk_cap,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(Error::Calibration("non-finite outcome field".to_string()));
        }
        if self.observed_cost < 0.0 || self.cost_budget < 0.0 {
            return Err(Error::Calibration(format!(
                "negative cost: observed {} budget {}",
                self.observed_cost, self.cost_budget
            )));
        }
        if !(0.0..=1.0).contains(&self.observed_risk) {
            return Err(Error::Calibration(format!(
                "observed_risk {} outside [0,1]",
                self.observed_risk
            )));
        }
        if !(self.risk_cap > 0.0 && self.risk_cap < 1.0) {
            return Err(Error::Calibration(format!(
                "risk_cap {} outside (0,1)",
                self.risk_cap
            )));
        }
        if let Some(c) = self.coverage {
            if !(c.is_finite() && (0.0..=1.0).contains(&c)) {
                return Err(Error::Calibration(format!("coverage {} outside [0,1]", c)));
            }
        }
        Ok(())
    }
}

/// Counters exposed by the calibrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub accepted: u64,
    pub skipped: u64,
    pub window_len: usize,
    pub recalibrations: u64,
}

/// Serialized calibrator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratorCheckpoint {
    pub state: DualState,
    /// Nonconformity scores (1 - coverage), oldest first
    pub window: Vec<f64>,
    pub stats: CalibrationStats,
    pub written_at: DateTime<Utc>,
}
