//! Actions, budgets and decisions.

use serde::{Deserialize, Serialize};

use crate::calibrate::DualState;
use crate::config::ControlConfig;
use crate::request::{Budget, FinalAction};

/// Version tag written into every decision.
pub const POLICY_VERSION: &str = "cmdp-lagrangian/1";

/// Controller action. Verify and revise re-enter the pipeline; emit and
/// abstain are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Emit,
    Revise,
    Verify,
    Abstain,
}

impl Action {
    /// Tie-break order for equal utility.
    pub const PREFERENCE: [Action; 4] = [Action::Emit, Action::Revise, Action::Verify, Action::Abstain];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Emit | Self::Abstain)
    }

    pub fn as_final(&self) -> Option<FinalAction> {
        match self {
            Self::Emit => Some(FinalAction::Emit),
            Self::Abstain => Some(FinalAction::Abstain),
            Self::Revise | Self::Verify => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emit => write!(f, "emit"),
            Self::Revise => write!(f, "revise"),
            Self::Verify => write!(f, "verify"),
            Self::Abstain => write!(f, "abstain"),
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    /// Estimated risk at or above the abstain ceiling
    RiskCeiling,
    /// A judge, entailment or retrieval adapter failed this round
    AdapterFailure,
    /// Coverage below τ with evidence supplied
    CoverageGate,
    /// Contradiction mass above the high-water mark
    ContradictionHighWater,
    /// Lagrangian utility maximization
    Utility,
    /// Nothing fit the remaining budget
    NoFeasibleAction,
    /// Every candidate timed out or failed
    GenerationUnavailable,
    /// Latency or token budget ran out mid-pipeline
    BudgetExceeded,
}

/// What is left of a request's budget at a decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBudget {
    pub token_cap: u64,
    pub tokens_remaining: u64,
    pub latency_remaining_ms: u64,
    pub verify_remaining: u32,
    pub revise_remaining: u32,
    pub iterations_remaining: u32,
}

impl ActionBudget {
    pub fn new(budget: &Budget, config: &ControlConfig) -> Self {
        Self {
            token_cap: budget.token_cap,
            tokens_remaining: budget.token_cap,
            latency_remaining_ms: budget.latency_cap_ms,
            verify_remaining: config.max_verify,
            revise_remaining: config.max_revise,
            iterations_remaining: config.max_iterations,
        }
    }

    pub fn has_verify(&self) -> bool {
        self.verify_remaining > 0 && self.iterations_remaining > 0
    }

    pub fn has_revise(&self) -> bool {
        self.revise_remaining > 0 && self.iterations_remaining > 0
    }

    pub fn spend_tokens(&mut self, tokens: u64) {
        self.tokens_remaining = self.tokens_remaining.saturating_sub(tokens);
    }

    /// Record a re-entry for `action`. Terminal actions consume nothing.
    pub fn consume(&mut self, action: Action) {
        match action {
            Action::Verify => {
                self.verify_remaining = self.verify_remaining.saturating_sub(1);
                self.iterations_remaining = self.iterations_remaining.saturating_sub(1);
            }
            Action::Revise => {
                self.revise_remaining = self.revise_remaining.saturating_sub(1);
                self.iterations_remaining = self.iterations_remaining.saturating_sub(1);
            }
            Action::Emit | Action::Abstain => {}
        }
    }
}

/// Estimated cost and risk of one action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionEstimate {
    pub action: Action,
    /// Extra tokens as a fraction of the token cap
    pub cost: f64,
    pub tokens: u64,
    pub latency_ms: u64,
    pub risk: f64,
    pub feasible: bool,
    /// Lagrangian utility; None when infeasible
    pub utility: Option<f64>,
}

/// The controller's output. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub rationale: String,
    pub rule: DecisionRule,
    pub policy_version: String,
    /// DualState snapshot the decision was made with
    pub thresholds_used: DualState,
    /// Risk proxy of the current best candidate
    pub risk: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub estimates: Vec<ActionEstimate>,
}

impl Decision {
    pub fn new(
        action: Action,
        rule: DecisionRule,
        rationale: impl Into<String>,
        thresholds_used: DualState,
        risk: f64,
    ) -> Self {
        Self {
            action,
            rationale: rationale.into(),
            rule,
            policy_version: POLICY_VERSION.to_string(),
            thresholds_used,
            risk,
            estimates: Vec::new(),
        }
    }

    /// Terminal abstain that needs no adapter output.
    pub fn abstain(rule: DecisionRule, rationale: impl Into<String>, thresholds_used: DualState) -> Self {
        Self::new(Action::Abstain, rule, rationale, thresholds_used, 1.0)
    }

    /// Attaches the per-action estimates behind the decision.
    pub fn with_estimates(mut self, estimates: Vec<ActionEstimate>) -> Self {
        self.estimates = estimates;
        self
    }

    /// 1 - risk; 0 for abstentions.
    pub fn confidence(&self) -> f64 {
        match self.action {
            Action::Abstain => 0.0,
            _ => (1.0 - self.risk).clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_consumption() {
        let mut budget = ActionBudget::new(&Budget::default(), &ControlConfig::default());
        assert!(budget.has_verify() && budget.has_revise());
        budget.consume(Action::Verify);
        budget.consume(Action::Verify);
        assert!(!budget.has_verify());
        assert!(budget.has_revise());
        budget.consume(Action::Revise);
        assert_eq!(budget.iterations_remaining, 0);
        assert!(!budget.has_revise());
        budget.consume(Action::Emit);
        assert_eq!(budget.revise_remaining, 1);
    }

    #[test]
    fn test_action_terminality() {
        assert!(Action::Emit.is_terminal());
        assert!(!Action::Verify.is_terminal());
        assert_eq!(Action::Revise.as_final(), None);
        assert_eq!(Action::Abstain.as_final(), Some(FinalAction::Abstain));
    }
}
