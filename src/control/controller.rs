//! Constrained-MDP decision policy.

use tracing::debug;

use crate::calibrate::DualState;
use crate::config::ControlConfig;
use crate::evaluate::Scores;
use crate::monitor::Signals;

use super::types::{Action, ActionBudget, ActionEstimate, Decision, DecisionRule};

const TIE_EPSILON: f64 = 1e-12;

/// Everything one decision reads. The dual state is a copy.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub signals: &'a Signals,
    pub scores: &'a Scores,
    /// Evidence was supplied with the request
    pub has_context: bool,
    pub risk_cap: f64,
    pub budget: &'a ActionBudget,
    pub duals: DualState,
    /// Candidates a re-entry would sample
    pub k: usize,
    /// Observed (or default) tokens per candidate
    pub tokens_per_candidate: u64,
    /// Observed wall time of one generation round
    pub round_latency_ms: u64,
    /// Adapters whose output this round is a worst-case stand-in
    pub failed_adapters: &'a [String],
}

/// Maps signals, scores, budget and dual state to an action.
///
/// Rules, first match wins:
/// 0. risk at or above the abstain ceiling: abstain. Worst-case inputs
///    score risk 1 and the ceiling is capped at 1, so they always land here.
/// 1. any adapter failed this round: abstain
/// 2. evidence supplied and coverage below τ: verify, else abstain
/// 3. contradiction mass above the high-water mark: revise, else abstain
/// 4. feasible action with the highest Lagrangian utility
/// 5. nothing feasible: abstain
#[derive(Debug, Clone, Default)]
pub struct DecisionController {
    config: ControlConfig,
}

impl DecisionController {
    pub fn new(config: ControlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Weighted risk proxy. Without evidence the coverage term is dropped and
    /// the remaining weights renormalized. Non-finite inputs count as their
    /// worst value.
    pub fn risk(&self, signals: &Signals, scores: &Scores, has_context: bool) -> f64 {
        let judge = finite_or(scores.judge, 0.0).clamp(0.0, 1.0);
        let contradiction = finite_or(signals.contradiction_mass, 1.0).clamp(0.0, 1.0);
        let coverage = finite_or(signals.rag_coverage, 0.0).clamp(0.0, 1.0);

        let c = &self.config;
        let (mut total, mut weight) = (
            c.judge_risk_weight * (1.0 - judge) + c.contradiction_risk_weight * contradiction,
            c.judge_risk_weight + c.contradiction_risk_weight,
        );
        if has_context {
            total += c.coverage_risk_weight * (1.0 - coverage);
            weight += c.coverage_risk_weight;
        }
        if weight <= 0.0 {
            return 1.0;
        }
        (total / weight).clamp(0.0, 1.0)
    }

    /// Cost, risk, feasibility and utility of every action.
    pub fn estimates(&self, input: &DecisionInput<'_>, risk: f64) -> Vec<ActionEstimate> {
        let c = &self.config;
        let budget = input.budget;
        let cap = budget.token_cap.max(1) as f64;

        let revise_tokens = input.k.max(1) as u64 * input.tokens_per_candidate;
        let verify_tokens = (revise_tokens as f64 * c.verify_cost_multiplier).ceil() as u64;
        let verify_latency = (input.round_latency_ms as f64 * c.verify_cost_multiplier).ceil() as u64;

        let fits = |tokens: u64, latency: u64| {
            tokens <= budget.tokens_remaining && latency <= budget.latency_remaining_ms
        };

        Action::PREFERENCE
            .iter()
            .map(|&action| {
                let (tokens, latency, action_risk, base, feasible) = match action {
                    Action::Emit => (0, 0, risk, 1.0 - risk, true),
                    Action::Revise => (
                        revise_tokens,
                        input.round_latency_ms,
                        risk * c.revise_risk_factor,
                        1.0 - risk * c.revise_risk_factor - c.revise_friction,
                        budget.has_revise() && fits(revise_tokens, input.round_latency_ms),
                    ),
                    Action::Verify => (
                        verify_tokens,
                        verify_latency,
                        risk * c.verify_risk_factor,
                        1.0 - risk * c.verify_risk_factor - c.verify_friction,
                        budget.has_verify() && fits(verify_tokens, verify_latency),
                    ),
                    Action::Abstain => (0, 0, 0.0, c.abstain_utility, true),
                };
                let cost = tokens as f64 / cap;
                let utility = feasible.then(|| {
                    base - input.duals.lambda * (cost - c.cost_target).max(0.0)
                        - input.duals.mu * (action_risk - input.risk_cap).max(0.0)
                });
                ActionEstimate {
                    action,
                    cost,
                    tokens,
                    latency_ms: latency,
                    risk: action_risk,
                    feasible,
                    utility,
                }
            })
            .collect()
    }

    pub fn decide(&self, input: &DecisionInput<'_>) -> Decision {
        let signals = input.signals;
        let risk = self.risk(signals, input.scores, input.has_context);
        let estimates = self.estimates(input, risk);
        let feasible = |action: Action| {
            estimates
                .iter()
                .any(|e| e.action == action && e.feasible)
        };
        let duals = input.duals;
        let decision = |action, rule, rationale: String| {
            Decision::new(action, rule, rationale, duals, risk).with_estimates(estimates.clone())
        };

        let ceiling = self.config.abstain_risk_ceiling.min(1.0);
        if risk >= ceiling {
            return decision(
                Action::Abstain,
                DecisionRule::RiskCeiling,
                format!(
                    "risk {:.2} at or above ceiling {:.2} (judge {:.2}, contradiction_mass {:.2}, rag_coverage {:.2})",
                    risk,
                    ceiling,
                    input.scores.judge,
                    signals.contradiction_mass,
                    signals.rag_coverage
                ),
            );
        }

        if !input.failed_adapters.is_empty() {
            return decision(
                Action::Abstain,
                DecisionRule::AdapterFailure,
                format!(
                    "adapter failure ({}); risk {:.2} rests on worst-case stand-ins",
                    input.failed_adapters.join(", "),
                    risk
                ),
            );
        }

        if input.has_context && signals.rag_coverage < duals.tau {
            let gate = format!(
                "rag_coverage {:.2} below tau {:.2}",
                signals.rag_coverage, duals.tau
            );
            return if feasible(Action::Verify) {
                decision(
                    Action::Verify,
                    DecisionRule::CoverageGate,
                    format!("{}; verifying against evidence", gate),
                )
            } else {
                decision(
                    Action::Abstain,
                    DecisionRule::CoverageGate,
                    format!("{}; verify budget exhausted", gate),
                )
            };
        }

        if signals.contradiction_mass > self.config.contradiction_high_water {
            let gate = format!(
                "contradiction_mass {:.2} above high-water {:.2}",
                signals.contradiction_mass, self.config.contradiction_high_water
            );
            return if feasible(Action::Revise) {
                decision(
                    Action::Revise,
                    DecisionRule::ContradictionHighWater,
                    format!("{}; revising", gate),
                )
            } else {
                decision(
                    Action::Abstain,
                    DecisionRule::ContradictionHighWater,
                    format!("{}; revise budget exhausted", gate),
                )
            };
        }

        // PREFERENCE order plus strict improvement keeps the earlier action on ties.
        let best = estimates
            .iter()
            .filter_map(|e| e.utility.map(|u| (e, u)))
            .fold(None::<(&ActionEstimate, f64)>, |best, (e, u)| match best {
                Some((_, bu)) if u <= bu + TIE_EPSILON => best,
                _ => Some((e, u)),
            });

        match best {
            Some((chosen, utility)) => {
                let runner_up = estimates
                    .iter()
                    .filter(|e| e.action != chosen.action)
                    .filter_map(|e| e.utility.map(|u| format!("{} {:.2}", e.action, u)))
                    .collect::<Vec<_>>()
                    .join(", ");
                debug!(action = %chosen.action, utility, risk, "utility decision");
                decision(
                    chosen.action,
                    DecisionRule::Utility,
                    format!(
                        "max utility {} {:.2} over [{}]; risk {:.2} vs cap {:.2}, lambda {:.3}, mu {:.3}",
                        chosen.action, utility, runner_up, risk, input.risk_cap, duals.lambda, duals.mu
                    ),
                )
            }
            None => decision(
                Action::Abstain,
                DecisionRule::NoFeasibleAction,
                "no action fits the remaining budget".to_string(),
            ),
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Budget;

    fn signals(contradiction_mass: f64, rag_coverage: f64) -> Signals {
        Signals {
            k_sample_variance: 0.0,
            entropy_prefix_slope: 0.5,
            contradiction_mass,
            rag_coverage,
        }
    }

    fn scores(judge: f64) -> Scores {
        Scores {
            judge,
            prm: judge,
            citation_score: 0.5,
        }
    }

    fn fresh_budget() -> ActionBudget {
        ActionBudget::new(&Budget::default(), &ControlConfig::default())
    }

    struct Case {
        signals: Signals,
        scores: Scores,
        has_context: bool,
        budget: ActionBudget,
        duals: DualState,
        failed: Vec<String>,
    }

    impl Case {
        fn new(signals: Signals, scores: Scores) -> Self {
            Self {
                signals,
                scores,
                has_context: true,
                budget: fresh_budget(),
                duals: DualState::new(0.0, 0.0, 0.5),
                failed: Vec::new(),
            }
        }

        fn decide(&self) -> Decision {
            DecisionController::default().decide(&DecisionInput {
                signals: &self.signals,
                scores: &self.scores,
                has_context: self.has_context,
                risk_cap: 0.2,
                budget: &self.budget,
                duals: self.duals,
                k: 1,
                tokens_per_candidate: 256,
                round_latency_ms: 500,
                failed_adapters: &self.failed,
            })
        }
    }

    #[test]
    fn test_confident_single_sample_emits() {
        let decision = Case::new(signals(0.0, 0.9), scores(0.8)).decide();
        assert_eq!(decision.action, Action::Emit);
        assert_eq!(decision.rule, DecisionRule::Utility);
        assert_eq!(decision.thresholds_used.tau, 0.5);
    }

    #[test]
    fn test_low_coverage_verifies_then_abstains() {
        let mut case = Case::new(signals(0.0, 0.2), scores(0.8));
        let decision = case.decide();
        assert_eq!(decision.action, Action::Verify);
        assert_eq!(decision.rule, DecisionRule::CoverageGate);
        assert!(decision.rationale.contains("rag_coverage"));

        case.budget.verify_remaining = 0;
        let decision = case.decide();
        assert_eq!(decision.action, Action::Abstain);
        assert_eq!(decision.rule, DecisionRule::CoverageGate);
    }

    #[test]
    fn test_coverage_gate_needs_context() {
        let mut case = Case::new(signals(0.0, 0.2), scores(0.9));
        case.has_context = false;
        assert_ne!(case.decide().rule, DecisionRule::CoverageGate);
    }

    #[test]
    fn test_high_contradiction_revises_then_abstains() {
        let mut case = Case::new(signals(0.9, 0.9), scores(0.8));
        let decision = case.decide();
        assert_eq!(decision.action, Action::Revise);
        assert!(decision.rationale.contains("contradiction_mass"));

        case.budget.revise_remaining = 0;
        assert_eq!(case.decide().action, Action::Abstain);
    }

    #[test]
    fn test_fail_safe_abstains_regardless_of_budget() {
        for has_context in [true, false] {
            let mut case = Case::new(signals(1.0, 0.0), scores(0.0));
            case.has_context = has_context;
            case.budget.tokens_remaining = u64::MAX;
            let decision = case.decide();
            assert_eq!(decision.action, Action::Abstain);
            assert_eq!(decision.rule, DecisionRule::RiskCeiling);
            assert_eq!(decision.confidence(), 0.0);
        }
    }

    #[test]
    fn test_adapter_failure_blocks_emit() {
        let mut case = Case::new(signals(0.0, 1.0), scores(0.0));
        case.scores.citation_score = 1.0;
        case.failed = vec!["judge".to_string(), "prm".to_string()];
        let decision = case.decide();
        assert_eq!(decision.action, Action::Abstain);
        assert_eq!(decision.rule, DecisionRule::AdapterFailure);
        assert!(decision.rationale.contains("judge, prm"));

        case.failed.clear();
        case.scores = scores(0.8);
        assert_eq!(case.decide().action, Action::Emit);
    }

    #[test]
    fn test_out_of_range_ceiling_still_abstains_on_worst_case() {
        let config = ControlConfig {
            abstain_risk_ceiling: 1.5,
            contradiction_high_water: 2.0,
            ..ControlConfig::default()
        };
        let budget = fresh_budget();
        let worst_signals = Signals::worst_case();
        let worst_scores = Scores::worst_case();
        for has_context in [true, false] {
            let decision = DecisionController::new(config.clone()).decide(&DecisionInput {
                signals: &worst_signals,
                scores: &worst_scores,
                has_context,
                risk_cap: 0.2,
                budget: &budget,
                duals: DualState::new(0.0, 0.0, 0.5),
                k: 1,
                tokens_per_candidate: 256,
                round_latency_ms: 500,
                failed_adapters: &[],
            });
            assert_eq!(decision.action, Action::Abstain);
            assert_eq!(decision.rule, DecisionRule::RiskCeiling);
        }
    }

    #[test]
    fn test_non_finite_inputs_are_worst_case() {
        let controller = DecisionController::default();
        let risk = controller.risk(&signals(f64::NAN, f64::NAN), &scores(f64::NAN), true);
        assert_eq!(risk, 1.0);
    }

    #[test]
    fn test_mu_penalizes_risky_emit() {
        // Moderate risk without context: emit wins at mu = 0, loses once mu is large.
        let mut case = Case::new(signals(0.2, 0.0), scores(0.7));
        case.has_context = false;
        case.budget.revise_remaining = 0;
        case.budget.verify_remaining = 0;
        assert_eq!(case.decide().action, Action::Emit);

        case.duals = DualState::new(0.0, 10.0, 0.0);
        assert_eq!(case.decide().action, Action::Abstain);
    }

    #[test]
    fn test_token_budget_limits_reentry() {
        let mut case = Case::new(signals(0.3, 0.9), scores(0.3));
        case.budget.tokens_remaining = 10;
        let decision = case.decide();
        assert!(decision.action.is_terminal());
        let revise = decision
            .estimates
            .iter()
            .find(|e| e.action == Action::Revise)
            .unwrap();
        assert!(!revise.feasible);
        assert!(revise.utility.is_none());
    }

    #[test]
    fn test_tie_prefers_earlier_action() {
        let mut case = Case::new(signals(0.5, 0.0), scores(0.0));
        case.has_context = false;
        case.budget.revise_remaining = 0;
        case.budget.verify_remaining = 0;

        // Make abstain exactly as good as emitting.
        let risk = DecisionController::default().risk(&case.signals, &case.scores, false);
        let config = ControlConfig {
            abstain_utility: 1.0 - risk,
            ..ControlConfig::default()
        };
        let decision = DecisionController::new(config).decide(&DecisionInput {
            signals: &case.signals,
            scores: &case.scores,
            has_context: false,
            risk_cap: 0.9,
            budget: &case.budget,
            duals: case.duals,
            k: 1,
            tokens_per_candidate: 256,
            round_latency_ms: 500,
            failed_adapters: &[],
        });
        assert_eq!(decision.action, Action::Emit);
    }
}
