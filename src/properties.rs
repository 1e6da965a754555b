//! Property-based tests for the control loop using proptest.
//!
//! - Dual ascent keeps λ and μ non-negative whatever outcomes arrive
//! - The conformal threshold never decreases as α decreases
//! - The claim graph compares each cross-candidate pair exactly once
//! - The greedy consistent subset leaves no contradiction above threshold
//! - Re-entries are bounded and worst-case signals always abstain
//! - Any validated config abstains on worst-case inputs, and failed adapters never emit

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::sync::Arc;

    use crate::adapters::fixed::{FixedEntailment, FixedRetrieval, FixedScorer, StaticGenerator};
    use crate::adapters::{Candidate, Entailment, EntailmentLabel};
    use crate::calibrate::{conformal_quantile, Calibrator, DualState, DualStateReader, Outcome};
    use crate::claims::{
        candidate_pairs, greedy_consistent_subset, validate_pairs, ClaimEdge, ClaimGraphBuilder,
    };
    use crate::config::{CalibrationConfig, ControlConfig, ControllerConfig, GraphConfig};
    use crate::control::{Action, ActionBudget, DecisionController, DecisionInput};
    use crate::evaluate::Scores;
    use crate::monitor::Signals;
    use crate::pipeline::Pipeline;
    use crate::request::{Budget, EvidenceBundle, EvidenceSpan, Request};
    use crate::testing::CountingEntailment;
    use crate::trajectory::{CollectingEmitter, TrajectoryEventType};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
    }

    // Outcomes including values the calibrator must reject
    fn outcome() -> impl Strategy<Value = Outcome> {
        (
            prop_oneof![0.0f64..3.0, Just(f64::NAN), Just(-1.0)],
            0.0f64..1.0,
            prop_oneof![0.0f64..=1.0, Just(f64::INFINITY)],
            0.05f64..0.95,
        )
            .prop_map(|(cost, budget, risk, cap)| Outcome::new(cost, budget, risk, cap))
    }

    fn sentence() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("The bridge opened to traffic in 1932."),
            Just("The bridge did not open until 1935."),
            Just("It spans the harbour between two districts."),
            Just("Its steel arch is the widest in the country."),
            Just("Tolls were removed from the crossing."),
        ]
        .prop_map(str::to_string)
    }

    proptest! {
        /// λ and μ stay projected onto the non-negative orthant.
        #[test]
        fn duals_stay_non_negative(outcomes in prop::collection::vec(outcome(), 1..60)) {
            let mut calibrator = Calibrator::new(CalibrationConfig {
                eta: 0.2,
                ..CalibrationConfig::default()
            });
            for o in &outcomes {
                let _ = calibrator.update(o);
                let state = calibrator.state();
                prop_assert!(state.lambda >= 0.0 && state.mu >= 0.0, "{:?}", state);
                prop_assert!(state.is_valid());
            }
        }

        /// τ is non-decreasing as α decreases.
        #[test]
        fn quantile_monotone_in_alpha(
            scores in prop::collection::vec(0.0f64..=1.0, 1..200),
            a in 0.01f64..0.99,
            b in 0.01f64..0.99,
        ) {
            let (hi_alpha, lo_alpha) = if a >= b { (a, b) } else { (b, a) };
            let loose = conformal_quantile(&scores, hi_alpha).unwrap();
            let tight = conformal_quantile(&scores, lo_alpha).unwrap();
            prop_assert!(tight >= loose, "alpha {} -> {}, alpha {} -> {}", lo_alpha, tight, hi_alpha, loose);
        }

        /// Every cross-candidate pair is labelled once; no intra-candidate pairs.
        #[test]
        fn graph_compares_each_pair_once(
            texts in prop::collection::vec(
                prop::collection::vec(sentence(), 1..4).prop_map(|s| s.join(" ")),
                1..6,
            )
        ) {
            let counter = Arc::new(CountingEntailment::new(Entailment::neutral(0.5)));
            let builder = ClaimGraphBuilder::new(counter.clone(), &GraphConfig::default());
            let candidates: Vec<Candidate> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| Candidate::new(i, t.clone()))
                .collect();

            let graph = runtime().block_on(builder.build(&candidates));
            prop_assert!(validate_pairs(&graph).is_ok());
            prop_assert_eq!(counter.calls(), candidate_pairs(&graph.claims).len());
            prop_assert_eq!(graph.edges.len(), counter.calls());
        }

        /// No contradiction edge above threshold survives between kept nodes.
        #[test]
        fn greedy_subset_is_consistent(
            n in 1usize..12,
            raw in prop::collection::vec((0usize..12, 0usize..12, 0.0f64..=1.0), 0..40),
        ) {
            let edges: Vec<ClaimEdge> = raw
                .into_iter()
                .filter(|&(a, b, _)| a < b && b < n)
                .map(|(a, b, weight)| ClaimEdge { a, b, label: EntailmentLabel::Contradict, weight })
                .collect();
            let (kept, removed) = greedy_consistent_subset(n, &edges, 0.5);
            prop_assert_eq!(kept.len() + removed.len(), n);
            for edge in edges.iter().filter(|e| e.weight > 0.5) {
                prop_assert!(!(kept.contains(&edge.a) && kept.contains(&edge.b)));
            }
        }

        /// Worst-case signals abstain whatever the budget and duals.
        #[test]
        fn worst_case_always_abstains(
            lambda in 0.0f64..10.0,
            mu in 0.0f64..10.0,
            tau in 0.0f64..=1.0,
            tokens in 1u64..100_000,
            has_context in any::<bool>(),
        ) {
            let controller = DecisionController::new(ControlConfig::default());
            let budget = ActionBudget::new(&Budget::new(tokens, 10_000), &ControlConfig::default());
            let signals = Signals::worst_case();
            let scores = Scores::worst_case();
            let decision = controller.decide(&DecisionInput {
                signals: &signals,
                scores: &scores,
                has_context,
                risk_cap: 0.2,
                budget: &budget,
                duals: DualState::new(lambda, mu, tau),
                k: 3,
                tokens_per_candidate: 64,
                round_latency_ms: 10,
                failed_adapters: &[],
            });
            prop_assert_eq!(decision.action, Action::Abstain);
        }
    }

    // Control configs that pass validation, spanning the threshold extremes
    fn valid_control() -> impl Strategy<Value = ControlConfig> {
        (
            (0.0f64..1.0, 0.0f64..1.0, 0.0f64..1.0),
            prop_oneof![Just(1.0), Just(f64::MIN_POSITIVE), 0.01f64..=1.0],
            prop_oneof![Just(0.0), 0.0f64..0.999],
            0.0f64..=1.0,
        )
            .prop_map(|((j, c, v), ceiling, high_water, abstain_utility)| {
                let total = j + c + v + 0.03;
                ControlConfig {
                    judge_risk_weight: (j + 0.01) / total,
                    contradiction_risk_weight: (c + 0.01) / total,
                    coverage_risk_weight: 1.0 - (j + 0.01) / total - (c + 0.01) / total,
                    abstain_risk_ceiling: ceiling,
                    contradiction_high_water: high_water,
                    abstain_utility,
                    ..ControlConfig::default()
                }
            })
    }

    fn unit_signals() -> impl Strategy<Value = (Signals, Scores)> {
        (0.0f64..=1.0, 0.0f64..=1.0, 0.0f64..=1.0, 0.0f64..=1.0).prop_map(
            |(variance, contradiction, coverage, judge)| {
                (
                    Signals {
                        k_sample_variance: variance,
                        entropy_prefix_slope: 0.5,
                        contradiction_mass: contradiction,
                        rag_coverage: coverage,
                    },
                    Scores {
                        judge,
                        prm: judge,
                        citation_score: judge,
                    },
                )
            },
        )
    }

    proptest! {
        /// Any validated config abstains on worst-case inputs.
        #[test]
        fn worst_case_abstains_under_any_valid_config(
            control in valid_control(),
            tau in 0.0f64..=1.0,
            mu in 0.0f64..10.0,
            has_context in any::<bool>(),
        ) {
            let config = ControllerConfig {
                control: control.clone(),
                ..ControllerConfig::default()
            };
            prop_assert!(config.validate().is_ok(), "{:?}", control);

            let budget = ActionBudget::new(&Budget::default(), &control);
            let signals = Signals::worst_case();
            let scores = Scores::worst_case();
            let decision = DecisionController::new(control).decide(&DecisionInput {
                signals: &signals,
                scores: &scores,
                has_context,
                risk_cap: 0.2,
                budget: &budget,
                duals: DualState::new(0.0, mu, tau),
                k: 1,
                tokens_per_candidate: 64,
                round_latency_ms: 10,
                failed_adapters: &[],
            });
            prop_assert_eq!(decision.action, Action::Abstain);
        }

        /// A failed adapter never lets the answer through.
        #[test]
        fn adapter_failure_never_emits(
            (signals, scores) in unit_signals(),
            failed in prop::sample::subsequence(vec!["judge", "prm", "entailment", "retrieval"], 1..=4),
            has_context in any::<bool>(),
            tau in 0.0f64..=1.0,
        ) {
            let failed: Vec<String> = failed.into_iter().map(str::to_string).collect();
            let budget = ActionBudget::new(&Budget::default(), &ControlConfig::default());
            let decision = DecisionController::new(ControlConfig::default()).decide(&DecisionInput {
                signals: &signals,
                scores: &scores,
                has_context,
                risk_cap: 0.2,
                budget: &budget,
                duals: DualState::new(0.0, 0.0, tau),
                k: 3,
                tokens_per_candidate: 64,
                round_latency_ms: 10,
                failed_adapters: &failed,
            });
            prop_assert_eq!(decision.action, Action::Abstain);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Re-entries never exceed the iteration budget.
        #[test]
        fn reentries_are_bounded(
            judge in 0.0f64..=1.0,
            coverage in 0.0f64..=1.0,
            contradiction in any::<bool>(),
            tau in 0.0f64..=1.0,
            with_context in any::<bool>(),
        ) {
            let entailment = if contradiction {
                Entailment::contradict(0.9)
            } else {
                Entailment::neutral(0.5)
            };
            let emitter = CollectingEmitter::new();
            let pipeline = Pipeline::builder(Arc::new(StaticGenerator::new([
                "The harbour bridge opened in 1932 after eight years of work.",
                "Construction of the harbour bridge took eight years.",
            ])))
            .entailment(Arc::new(FixedEntailment(entailment)))
            .judge(Arc::new(FixedScorer::new("judge", judge)))
            .process_reward(Arc::new(FixedScorer::new("prm", judge)))
            .citation(Arc::new(FixedScorer::new("citation", judge)))
            .retrieval(Arc::new(FixedRetrieval(coverage)))
            .duals(DualStateReader::fixed(DualState::new(0.0, 0.0, tau)))
            .emitter(Arc::new(emitter.clone()))
            .build()
            .unwrap();
            let max_iterations = pipeline.config().control.max_iterations as usize;

            let mut request = Request::new("When did the harbour bridge open?").with_route("finance");
            if with_context {
                request = request.with_context(EvidenceBundle::new(vec![EvidenceSpan::new(
                    "s1",
                    "The harbour bridge opened in 1932.",
                )]));
            }
            let response = runtime().block_on(pipeline.run(&request)).unwrap();

            prop_assert!(emitter.events_of(TrajectoryEventType::ReEnter).len() <= max_iterations);
            prop_assert_eq!(emitter.events_of(TrajectoryEventType::Final).len(), 1);
            if !response.is_emit() {
                prop_assert!(response.text.is_none());
            }
        }
    }
}
