//! The Monitor / Evaluate / Control loop for one request.
//!
//! ```text
//! select K -> generate K -> claim graph -> signals -> scores -> decide
//!                ^                                               |
//!                +------------- verify / revise (bounded) -------+
//! ```
//!
//! Every path out of the loop is emit or abstain. The whole loop runs under
//! the request's latency cap; when the cap fires the in-flight adapter calls
//! are dropped and the request abstains.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    Candidate, EntailmentAdapter, GenerationPrompt, Generator, HeuristicJudge,
    LexicalCitationAligner, LexicalEntailment, LexicalRetrieval, RetrievalAdapter, Scorer,
};
use crate::audit::{sha256_hex, AuditHandle, CostReport, LogRecord, LoggedOutput};
use crate::calibrate::{CalibrationHandle, DualState, DualStateReader, Outcome};
use crate::claims::ClaimGraphBuilder;
use crate::config::ControllerConfig;
use crate::control::{Action, ActionBudget, Decision, DecisionController, DecisionInput, DecisionRule};
use crate::error::{Error, Result};
use crate::evaluate::{Evaluator, Scores};
use crate::monitor::{SignalExtractor, Signals};
use crate::request::{FinalAction, Request, Response};
use crate::selector::DynamicKSelector;
use crate::trajectory::{NullEmitter, TrajectoryEmitter, TrajectoryEvent, TrajectoryEventType};

const VERIFY_INSTRUCTION: &str = "Check each statement against the evidence above. \
Drop anything the evidence does not support and cite the supporting span ids in brackets.";

const REVISE_INSTRUCTION: &str = "Earlier drafts of this answer contradicted each other. \
Answer again using only statements you are confident are correct and mutually consistent.";

/// Outcomes awaiting a label are remembered for this many requests.
const PENDING_CAPACITY: usize = 4096;

/// Builder for [`Pipeline`]. Unset adapters fall back to the lexical
/// heuristics in [`crate::adapters`].
pub struct PipelineBuilder {
    generator: Arc<dyn Generator>,
    entailment: Option<Arc<dyn EntailmentAdapter>>,
    judge: Option<Arc<dyn Scorer>>,
    prm: Option<Arc<dyn Scorer>>,
    citation: Option<Arc<dyn Scorer>>,
    retrieval: Option<Arc<dyn RetrievalAdapter>>,
    config: ControllerConfig,
    duals: Option<DualStateReader>,
    calibration: Option<CalibrationHandle>,
    audit: Option<AuditHandle>,
    emitter: Option<Arc<dyn TrajectoryEmitter>>,
}

impl PipelineBuilder {
    /// Starts a builder with heuristic defaults for every adapter except the generator.
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            entailment: None,
            judge: None,
            prm: None,
            citation: None,
            retrieval: None,
            config: ControllerConfig::default(),
            duals: None,
            calibration: None,
            audit: None,
            emitter: None,
        }
    }

    /// Replaces the entailment adapter used for the claim graph.
    pub fn entailment(mut self, entailment: Arc<dyn EntailmentAdapter>) -> Self {
        self.entailment = Some(entailment);
        self
    }

    /// Replaces the LLM-as-judge scorer.
    pub fn judge(mut self, judge: Arc<dyn Scorer>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Replaces the process reward scorer.
    pub fn process_reward(mut self, prm: Arc<dyn Scorer>) -> Self {
        self.prm = Some(prm);
        self
    }

    /// Replaces the citation scorer.
    pub fn citation(mut self, citation: Arc<dyn Scorer>) -> Self {
        self.citation = Some(citation);
        self
    }

    /// Replaces the retrieval adapter behind `rag_coverage`.
    pub fn retrieval(mut self, retrieval: Arc<dyn RetrievalAdapter>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Replaces the controller config; validated in `build`.
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Read side of a running calibration service.
    pub fn duals(mut self, duals: DualStateReader) -> Self {
        self.duals = Some(duals);
        self
    }

    /// Where [`Pipeline::report_outcome`] sends labelled outcomes.
    pub fn calibration(mut self, calibration: CalibrationHandle) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// Sends one audit record per finished request to this logger.
    pub fn audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Routes trajectory events to this emitter.
    pub fn emitter(mut self, emitter: Arc<dyn TrajectoryEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validates the config and assembles the pipeline.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = self.config;

        let entailment = self
            .entailment
            .unwrap_or_else(|| Arc::new(LexicalEntailment::default()));
        let retrieval = self.retrieval.unwrap_or_else(|| Arc::new(LexicalRetrieval));
        let judge = self.judge.unwrap_or_else(|| Arc::new(HeuristicJudge));
        let prm = self.prm.unwrap_or_else(|| Arc::new(HeuristicJudge));
        let citation = self
            .citation
            .unwrap_or_else(|| Arc::new(LexicalCitationAligner::default()));
        let duals = self.duals.unwrap_or_else(|| {
            DualStateReader::fixed(DualState::new(
                config.calibration.initial_lambda.max(0.0),
                config.calibration.initial_mu.max(0.0),
                config.calibration.initial_tau.clamp(0.0, 1.0),
            ))
        });

        Ok(Pipeline {
            generator: self.generator,
            selector: DynamicKSelector::new(config.selector.clone()),
            graph_builder: ClaimGraphBuilder::new(entailment, &config.graph),
            signals: SignalExtractor::new(retrieval, config.signals.clone()),
            evaluator: Evaluator::new(judge, prm, citation),
            controller: DecisionController::new(config.control.clone()),
            duals,
            calibration: self.calibration,
            audit: self.audit,
            emitter: self.emitter.unwrap_or_else(|| Arc::new(NullEmitter)),
            pending: Mutex::new(PendingOutcomes::new(PENDING_CAPACITY)),
            config,
        })
    }
}

/// The reliability controller wrapped around one generator.
///
/// `run` may be called concurrently; the only shared mutable state is the
/// dual state, which is read as a copy once per request.
pub struct Pipeline {
    generator: Arc<dyn Generator>,
    selector: DynamicKSelector,
    graph_builder: ClaimGraphBuilder,
    signals: SignalExtractor,
    evaluator: Evaluator,
    controller: DecisionController,
    duals: DualStateReader,
    calibration: Option<CalibrationHandle>,
    audit: Option<AuditHandle>,
    emitter: Arc<dyn TrajectoryEmitter>,
    pending: Mutex<PendingOutcomes>,
    config: ControllerConfig,
}

impl Pipeline {
    pub fn builder(generator: Arc<dyn Generator>) -> PipelineBuilder {
        PipelineBuilder::new(generator)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Current dual state.
    pub fn duals(&self) -> DualState {
        self.duals.snapshot()
    }

    /// Answer one request. Fails only for an invalid request; every runtime
    /// failure resolves to an abstain response.
    #[instrument(skip(self, request), fields(qid = tracing::field::Empty, route = request.route.as_str()))]
    pub async fn run(&self, request: &Request) -> Result<Response> {
        request.validate()?;
        let qid = Uuid::new_v4().to_string();
        tracing::Span::current().record("qid", qid.as_str());

        let started = Instant::now();
        let duals = self.duals.snapshot();
        let mut state = RunState::new(request, &self.config);
        self.emitter.emit(
            TrajectoryEvent::pipeline_start(qid.clone())
                .with_metadata("risk_cap", request.risk_cap)
                .with_metadata("has_context", request.has_context()),
        );

        let latency_cap = Duration::from_millis(request.budget.latency_cap_ms);
        let resolution =
            match tokio::time::timeout(latency_cap, self.control_loop(request, duals, started, &mut state))
                .await
            {
                Ok(resolution) => resolution,
                Err(_) => {
                    warn!(latency_cap_ms = request.budget.latency_cap_ms, "latency cap exceeded");
                    self.emitter.emit(TrajectoryEvent::error(
                        state.iterations,
                        format!("latency cap of {} ms exceeded", request.budget.latency_cap_ms),
                    ));
                    Resolution::abstain(Decision::abstain(
                        DecisionRule::BudgetExceeded,
                        format!(
                            "latency cap of {} ms exceeded; outstanding calls cancelled",
                            request.budget.latency_cap_ms
                        ),
                        duals,
                    ))
                }
            };

        let latency_ms = started.elapsed().as_millis() as u64;
        let response = resolution.response(&qid);
        info!(
            action = %response.action,
            rule = ?resolution.decision.rule,
            iterations = state.iterations,
            tokens = state.tokens_used,
            latency_ms,
            "request resolved"
        );
        self.emitter.emit(
            TrajectoryEvent::final_action(state.iterations, response.action.to_string())
                .with_metadata("qid", qid.clone())
                .with_metadata("confidence", response.confidence),
        );

        self.remember_outcome(&qid, request, &response, &state);
        if let Some(audit) = &self.audit {
            audit.submit(self.log_record(&qid, request, &resolution, &state, latency_ms));
        }
        Ok(response)
    }

    /// Turn a label for an earlier request into a calibration outcome.
    ///
    /// `observed_tokens` overrides the tokens recorded at decision time.
    pub async fn report_outcome(
        &self,
        qid: &str,
        correct: bool,
        observed_tokens: Option<u64>,
    ) -> Result<()> {
        let Some(calibration) = &self.calibration else {
            return Err(Error::Calibration(
                "pipeline has no calibration service".to_string(),
            ));
        };
        let pending = self
            .pending
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock pending outcomes: {}", e)))?
            .take(qid)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown or expired qid {}", qid)))?;

        let tokens = observed_tokens.unwrap_or(pending.tokens_used);
        let observed_risk = if pending.emitted && !correct { 1.0 } else { 0.0 };
        let mut outcome = Outcome::new(
            tokens as f64 / pending.token_cap.max(1) as f64,
            self.config.control.cost_target,
            observed_risk,
            pending.risk_cap,
        )
        .with_qid(qid);
        if let Some(coverage) = pending.coverage {
            outcome = outcome.with_coverage(coverage);
        }
        calibration.submit(outcome).await
    }

    async fn control_loop(
        &self,
        request: &Request,
        duals: DualState,
        started: Instant,
        state: &mut RunState,
    ) -> Resolution {
        let selection = self.selector.select(request);
        let k = selection.k;
        self.emitter.emit(
            TrajectoryEvent::new(TrajectoryEventType::SelectK, 0, format!("K={}", k))
                .with_metadata("risk", selection.risk)
                .with_metadata("length_proxy", selection.length_proxy)
                .with_metadata("retrieval_thinness", selection.retrieval_thinness)
                .with_metadata("domain_risk", selection.domain_risk),
        );
        debug!(k, risk = selection.risk, "selected sample count");

        let context = request.context.as_ref();
        let mut instruction: Option<&'static str> = None;

        loop {
            let depth = state.iterations;
            if depth > self.config.control.max_iterations {
                return Resolution::abstain(Decision::abstain(
                    DecisionRule::BudgetExceeded,
                    format!("re-entry limit of {} reached", self.config.control.max_iterations),
                    duals,
                ));
            }

            let round_started = Instant::now();
            state.refresh_latency(request, started);
            let candidates = self.generate_round(request, k, instruction, depth, state).await;
            if candidates.is_empty() {
                return Resolution::abstain(Decision::abstain(
                    DecisionRule::GenerationUnavailable,
                    format!(
                        "generation unavailable: all {} candidates timed out or failed",
                        k
                    ),
                    duals,
                ));
            }

            let round_tokens: u64 = candidates.iter().map(Candidate::token_estimate).sum();
            state.spend(round_tokens);
            state
                .candidate_hashes
                .extend(candidates.iter().map(|c| sha256_hex(c.text.as_bytes())));
            if state.tokens_used > request.budget.token_cap {
                return Resolution::abstain(Decision::abstain(
                    DecisionRule::BudgetExceeded,
                    format!(
                        "token cap {} exceeded ({} used)",
                        request.budget.token_cap, state.tokens_used
                    ),
                    duals,
                ));
            }

            let graph = self.graph_builder.build(&candidates).await;
            self.emitter.emit(
                TrajectoryEvent::new(
                    TrajectoryEventType::ClaimExtracted,
                    depth,
                    format!("{} claims", graph.claims.len()),
                )
                .with_metadata("claims", graph.claims.len()),
            );
            self.emitter.emit(
                TrajectoryEvent::new(
                    TrajectoryEventType::GraphBuilt,
                    depth,
                    format!(
                        "kept {} of {} claims, {} edges",
                        graph.kept.len(),
                        graph.claims.len(),
                        graph.edges.len()
                    ),
                )
                .with_metadata("contradiction_mass", graph.contradiction_mass())
                .with_metadata("failed_pairs", graph.failed_pairs),
            );

            let report = self.signals.extract(&candidates, &graph, context).await;
            state.signals = Some(report.signals);
            self.emitter.emit(signals_event(depth, &report.signals));

            let best_pos = report.best_candidate.unwrap_or(0).min(candidates.len() - 1);
            let best = &candidates[best_pos];
            let scores = self.evaluator.evaluate(best, context).await;
            state.scores = Some(scores.scores);
            self.emitter.emit(
                TrajectoryEvent::new(
                    TrajectoryEventType::Scored,
                    depth,
                    format!(
                        "judge={:.3} prm={:.3} citation={:.3}",
                        scores.scores.judge, scores.scores.prm, scores.scores.citation_score
                    ),
                )
                .with_metadata("failed", scores.failed.join(",")),
            );

            let mut failed_adapters = scores.failed.clone();
            if graph.is_degraded() {
                failed_adapters.push("entailment".to_string());
            }
            if report.retrieval_failures > 0 {
                failed_adapters.push("retrieval".to_string());
            }

            state.refresh_latency(request, started);
            let round_latency_ms = round_started.elapsed().as_millis() as u64;
            let tokens_per_candidate = (round_tokens / candidates.len() as u64).max(1);
            let decision = self.controller.decide(&DecisionInput {
                signals: &report.signals,
                scores: &scores.scores,
                has_context: request.has_context(),
                risk_cap: request.risk_cap,
                budget: &state.budget,
                duals,
                k,
                tokens_per_candidate,
                round_latency_ms,
                failed_adapters: &failed_adapters,
            });
            self.emitter.emit(
                TrajectoryEvent::decided(depth, decision.action.to_string(), decision.rationale.clone())
                    .with_metadata("risk", decision.risk),
            );

            match decision.action {
                Action::Emit => {
                    let citations = report.citations_for(&graph, best.index);
                    return Resolution {
                        text: Some(best.text.clone()),
                        citations,
                        decision,
                    };
                }
                Action::Abstain => return Resolution::abstain(decision),
                Action::Verify | Action::Revise => {
                    state.budget.consume(decision.action);
                    state.iterations += 1;
                    instruction = Some(match decision.action {
                        Action::Verify => VERIFY_INSTRUCTION,
                        _ => REVISE_INSTRUCTION,
                    });
                    debug!(action = %decision.action, iteration = state.iterations, "re-entering");
                    self.emitter.emit(
                        TrajectoryEvent::new(
                            TrajectoryEventType::ReEnter,
                            state.iterations,
                            decision.action.to_string(),
                        )
                        .with_metadata("tokens_remaining", state.budget.tokens_remaining),
                    );
                }
            }
        }
    }

    /// Sample `k` candidates concurrently. Samples that fail or outlive the
    /// round's share of the latency budget are dropped.
    async fn generate_round(
        &self,
        request: &Request,
        k: usize,
        instruction: Option<&str>,
        depth: u32,
        state: &mut RunState,
    ) -> Vec<Candidate> {
        let fraction = self.config.control.generation_timeout_fraction;
        let limit_ms = ((state.budget.latency_remaining_ms as f64 * fraction).ceil() as u64).max(1);
        let limit = Duration::from_millis(limit_ms);
        let context = request.context.as_ref();

        let calls = (0..k).map(|slot| {
            let prompt = GenerationPrompt::new(&request.query, context)
                .with_instruction(instruction)
                .with_sample_index(slot);
            async move {
                match tokio::time::timeout(limit, self.generator.generate(&prompt, 1)).await {
                    Ok(Ok(batch)) => batch
                        .into_iter()
                        .next()
                        .ok_or_else(|| Error::adapter("generator", "returned no candidate")),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::generation_timeout(limit_ms)),
                }
            }
        });

        state.candidates_requested += k;
        let mut candidates = Vec::with_capacity(k);
        for (slot, result) in join_all(calls).await.into_iter().enumerate() {
            match result {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    state.candidates_dropped += 1;
                    warn!(slot, timed_out = e.is_timeout(), error = %e, "candidate dropped");
                    self.emitter.emit(
                        TrajectoryEvent::candidate_dropped(depth, slot, e.to_string())
                            .with_metadata("timed_out", e.is_timeout()),
                    );
                }
            }
        }
        for (index, candidate) in candidates.iter_mut().enumerate() {
            candidate.index = index;
        }

        self.emitter.emit(
            TrajectoryEvent::new(
                TrajectoryEventType::CandidatesGenerated,
                depth,
                format!("{} of {} candidates", candidates.len(), k),
            )
            .with_metadata("requested", k)
            .with_metadata("kept", candidates.len()),
        );
        candidates
    }

    fn remember_outcome(&self, qid: &str, request: &Request, response: &Response, state: &RunState) {
        let coverage = if request.has_context() {
            state.signals.map(|s| s.rag_coverage)
        } else {
            None
        };
        let entry = PendingOutcome {
            emitted: response.is_emit(),
            coverage,
            tokens_used: state.tokens_used,
            token_cap: request.budget.token_cap,
            risk_cap: request.risk_cap,
        };
        match self.pending.lock() {
            Ok(mut pending) => pending.insert(qid.to_string(), entry),
            Err(e) => warn!(error = %e, "pending outcome map poisoned"),
        }
    }

    fn log_record(
        &self,
        qid: &str,
        request: &Request,
        resolution: &Resolution,
        state: &RunState,
        latency_ms: u64,
    ) -> LogRecord {
        let input_hash = request.input_hash().unwrap_or_else(|e| {
            warn!(error = %e, "failed to hash request");
            String::new()
        });
        LogRecord {
            qid: qid.to_string(),
            timestamp: Utc::now(),
            input_hash,
            candidates: state.candidate_hashes.clone(),
            signals: state.signals,
            scores: state.scores,
            decision: resolution.decision.clone(),
            output: LoggedOutput {
                action: resolution.final_action(),
                text: resolution.text.clone(),
                citations: resolution.citations.clone(),
                confidence: resolution.decision.confidence(),
            },
            cost: CostReport {
                tokens_used: state.tokens_used,
                latency_ms,
                iterations: state.iterations,
                candidates_requested: state.candidates_requested,
                candidates_dropped: state.candidates_dropped,
            },
            prev_hash: String::new(),
        }
    }
}

fn signals_event(depth: u32, signals: &Signals) -> TrajectoryEvent {
    TrajectoryEvent::new(
        TrajectoryEventType::SignalsComputed,
        depth,
        format!(
            "variance={:.3} slope={:.3} contradiction={:.3} coverage={:.3}",
            signals.k_sample_variance,
            signals.entropy_prefix_slope,
            signals.contradiction_mass,
            signals.rag_coverage
        ),
    )
}

/// Per-request bookkeeping; survives a latency-cap cancellation.
struct RunState {
    budget: ActionBudget,
    tokens_used: u64,
    iterations: u32,
    candidates_requested: usize,
    candidates_dropped: usize,
    candidate_hashes: Vec<String>,
    signals: Option<Signals>,
    scores: Option<Scores>,
}

impl RunState {
    fn new(request: &Request, config: &ControllerConfig) -> Self {
        Self {
            budget: ActionBudget::new(&request.budget, &config.control),
            tokens_used: 0,
            iterations: 0,
            candidates_requested: 0,
            candidates_dropped: 0,
            candidate_hashes: Vec::new(),
            signals: None,
            scores: None,
        }
    }

    fn spend(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.budget.spend_tokens(tokens);
    }

    fn refresh_latency(&mut self, request: &Request, started: Instant) {
        let elapsed = started.elapsed().as_millis() as u64;
        self.budget.latency_remaining_ms = request.budget.latency_cap_ms.saturating_sub(elapsed);
    }
}

/// Terminal decision plus what goes back to the caller.
struct Resolution {
    decision: Decision,
    text: Option<String>,
    citations: Vec<String>,
}

impl Resolution {
    fn abstain(decision: Decision) -> Self {
        Self {
            decision,
            text: None,
            citations: Vec::new(),
        }
    }

    fn final_action(&self) -> FinalAction {
        self.decision.action.as_final().unwrap_or(FinalAction::Abstain)
    }

    fn response(&self, qid: &str) -> Response {
        let action = self.final_action();
        let emitted = action == FinalAction::Emit;
        Response {
            action,
            text: if emitted { self.text.clone() } else { None },
            citations: if emitted { self.citations.clone() } else { Vec::new() },
            confidence: if emitted { self.decision.confidence() } else { 0.0 },
            log_id: qid.to_string(),
            rationale: self.decision.rationale.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingOutcome {
    emitted: bool,
    coverage: Option<f64>,
    tokens_used: u64,
    token_cap: u64,
    risk_cap: f64,
}

/// Insertion-ordered map that forgets its oldest entries.
struct PendingOutcomes {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, PendingOutcome>,
}

impl PendingOutcomes {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, qid: String, entry: PendingOutcome) {
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(qid.clone());
        self.entries.insert(qid, entry);
    }

    fn take(&mut self, qid: &str) -> Option<PendingOutcome> {
        let entry = self.entries.remove(qid)?;
        self.order.retain(|q| q != qid);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixed::{FixedEntailment, FixedRetrieval, FixedScorer, StaticGenerator};
    use crate::adapters::Entailment;
    use crate::audit::{load_and_verify, AuditLogger, LogSink, MemorySink};
    use crate::calibrate::{CalibrationService, Calibrator};
    use crate::config::AuditConfig;
    use crate::request::{Budget, EvidenceBundle, EvidenceSpan};
    use crate::testing::{ScriptedGenerator, SlowGenerator};
    use crate::trajectory::CollectingEmitter;

    const ANSWER: &str = "The Eiffel Tower is located in Paris and was completed in 1889.";

    fn evidence() -> EvidenceBundle {
        EvidenceBundle::new(vec![EvidenceSpan::new(
            "s1",
            "The Eiffel Tower in Paris was completed in 1889.",
        )])
    }

    fn fixed_pipeline(
        generator: Arc<dyn Generator>,
        judge: f64,
        coverage: f64,
        entailment: Entailment,
        duals: DualState,
    ) -> PipelineBuilder {
        Pipeline::builder(generator)
            .entailment(Arc::new(FixedEntailment(entailment)))
            .judge(Arc::new(FixedScorer::new("judge", judge)))
            .process_reward(Arc::new(FixedScorer::new("prm", judge)))
            .citation(Arc::new(FixedScorer::new("citation", judge)))
            .retrieval(Arc::new(FixedRetrieval(coverage)))
            .duals(DualStateReader::fixed(duals))
    }

    fn chitchat(query: &str) -> Request {
        Request::new(query).with_route("chitchat")
    }

    #[tokio::test]
    async fn test_confident_answer_is_emitted() {
        let emitter = CollectingEmitter::new();
        let pipeline = fixed_pipeline(
            Arc::new(StaticGenerator::new([ANSWER])),
            0.8,
            0.9,
            Entailment::neutral(0.5),
            DualState::new(0.0, 0.0, 0.5),
        )
        .emitter(Arc::new(emitter.clone()))
        .build()
        .unwrap();

        let response = pipeline.run(&chitchat("Where is the Eiffel Tower?")).await.unwrap();
        assert_eq!(response.action, FinalAction::Emit);
        assert_eq!(response.text.as_deref(), Some(ANSWER));
        assert!(response.confidence > 0.5);
        assert_eq!(emitter.events_of(TrajectoryEventType::Final).len(), 1);
        assert!(emitter.events_of(TrajectoryEventType::ReEnter).is_empty());
    }

    #[tokio::test]
    async fn test_low_coverage_verifies_then_abstains() {
        let emitter = CollectingEmitter::new();
        let mut config = ControllerConfig::default();
        config.control.max_verify = 1;
        let pipeline = fixed_pipeline(
            Arc::new(StaticGenerator::new([ANSWER])),
            0.8,
            0.2,
            Entailment::neutral(0.5),
            DualState::new(0.0, 0.0, 0.5),
        )
        .config(config)
        .emitter(Arc::new(emitter.clone()))
        .build()
        .unwrap();

        let request = chitchat("Where is the Eiffel Tower?").with_context(evidence());
        let response = pipeline.run(&request).await.unwrap();

        assert_eq!(response.action, FinalAction::Abstain);
        assert!(response.rationale.contains("verify budget exhausted"));
        let reentries = emitter.events_of(TrajectoryEventType::ReEnter);
        assert_eq!(reentries.len(), 1);
        assert_eq!(reentries[0].content, "verify");
    }

    #[tokio::test]
    async fn test_all_candidates_failing_abstains() {
        let pipeline = fixed_pipeline(
            Arc::new(StaticGenerator::new(Vec::<String>::new())),
            0.8,
            0.9,
            Entailment::neutral(0.5),
            DualState::default(),
        )
        .build()
        .unwrap();

        let response = pipeline.run(&chitchat("anything at all")).await.unwrap();
        assert_eq!(response.action, FinalAction::Abstain);
        assert!(response.rationale.contains("generation unavailable"));
        assert_eq!(response.confidence, 0.0);
        assert!(response.text.is_none());
    }

    #[tokio::test]
    async fn test_contradicting_samples_are_revised() {
        // Every pair of first-round samples disagrees on the hour.
        let generator = Arc::new(ScriptedGenerator::new(
            vec![
                "The review meeting starts at 9 in the main office.",
                "The review meeting starts at 10 in the main office.",
                "The review meeting starts at 11 in the main office.",
                "The review meeting starts at 12 in the main office.",
                "The review meeting starts at 13 in the main office.",
            ],
            vec!["The review meeting starts at 9 in the main office."],
        ));
        let emitter = CollectingEmitter::new();
        let pipeline = Pipeline::builder(generator.clone())
            .judge(Arc::new(FixedScorer::new("judge", 0.9)))
            .process_reward(Arc::new(FixedScorer::new("prm", 0.9)))
            .citation(Arc::new(FixedScorer::new("citation", 0.9)))
            .emitter(Arc::new(emitter.clone()))
            .build()
            .unwrap();

        // Long medical query without evidence selects K=5.
        let query = "Which day is the quarterly medical review meeting scheduled for, \
                     and where is it held this time around?"
            .repeat(3);
        let response = pipeline
            .run(&Request::new(query).with_route("medical"))
            .await
            .unwrap();

        let reentries = emitter.events_of(TrajectoryEventType::ReEnter);
        assert_eq!(reentries[0].content, "revise");
        assert_eq!(response.action, FinalAction::Emit);
        assert_eq!(generator.rounds_seen(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sample_is_dropped() {
        let generator = Arc::new(SlowGenerator::new(ANSWER, [1], Duration::from_secs(30)));
        let emitter = CollectingEmitter::new();
        let pipeline = fixed_pipeline(
            generator,
            0.8,
            0.9,
            Entailment::entail(0.9),
            DualState::default(),
        )
        .emitter(Arc::new(emitter.clone()))
        .build()
        .unwrap();

        let request = Request::new("What is the history of the Eiffel Tower?")
            .with_route("legal")
            .with_budget(Budget::new(8192, 1_000));
        let response = pipeline.run(&request).await.unwrap();

        assert_eq!(response.action, FinalAction::Emit);
        let dropped = emitter.events_of(TrajectoryEventType::CandidateDropped);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].content.contains("timed out"));
        let timed_out = dropped[0]
            .metadata
            .as_ref()
            .and_then(|m| m.get("timed_out"))
            .cloned();
        assert_eq!(timed_out, Some(serde_json::Value::Bool(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_cap_abstains() {
        // Every sample is slower than the whole request budget.
        let generator = Arc::new(SlowGenerator::new(
            ANSWER,
            [0, 1, 2, 3, 4],
            Duration::from_secs(30),
        ));
        let mut config = ControllerConfig::default();
        config.control.generation_timeout_fraction = 1.0;
        let pipeline = fixed_pipeline(
            generator,
            0.8,
            0.9,
            Entailment::neutral(0.5),
            DualState::default(),
        )
        .config(config)
        .build()
        .unwrap();

        let request = chitchat("hi").with_budget(Budget::new(8192, 500));
        let response = pipeline.run(&request).await.unwrap();
        assert_eq!(response.action, FinalAction::Abstain);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let pipeline = Pipeline::builder(Arc::new(StaticGenerator::new([ANSWER])))
            .build()
            .unwrap();
        let err = pipeline
            .run(&Request::new("q").with_risk_cap(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_audit_and_outcome_reporting() {
        let sink = Arc::new(MemorySink::new());
        let logger = AuditLogger::spawn(
            sink.clone(),
            AuditConfig::default(),
            Arc::new(CollectingEmitter::new()),
        )
        .await
        .unwrap();
        let (calibration, mut reader, _task) = CalibrationService::spawn(
            Calibrator::new(Default::default()),
            Arc::new(CollectingEmitter::new()),
        );
        let pipeline = fixed_pipeline(
            Arc::new(StaticGenerator::new([ANSWER])),
            0.8,
            0.9,
            Entailment::neutral(0.5),
            DualState::default(),
        )
        .duals(reader.clone())
        .calibration(calibration)
        .audit(logger.handle())
        .build()
        .unwrap();

        let first = pipeline.run(&chitchat("Where is it?")).await.unwrap();
        let second = pipeline.run(&chitchat("Where is it now?")).await.unwrap();
        assert_ne!(first.log_id, second.log_id);
        logger.shutdown().await.unwrap();

        assert_eq!(load_and_verify(sink.as_ref()).await.unwrap(), 2);
        let lines = sink.read_all().await.unwrap();
        let record: LogRecord = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(record.qid, first.log_id);
        assert!(!record.candidates.is_empty());
        assert!(!record.candidates[0].contains("Eiffel"));

        // A wrong emitted answer raises mu.
        pipeline
            .report_outcome(&first.log_id, false, None)
            .await
            .unwrap();
        let state = reader.changed().await.unwrap();
        assert!(state.mu > 0.0);

        // Each qid is labelled once.
        assert!(pipeline.report_outcome(&first.log_id, true, None).await.is_err());
    }

    #[test]
    fn test_pending_outcomes_are_bounded() {
        let mut pending = PendingOutcomes::new(2);
        let entry = PendingOutcome {
            emitted: true,
            coverage: None,
            tokens_used: 1,
            token_cap: 10,
            risk_cap: 0.2,
        };
        pending.insert("a".into(), entry);
        pending.insert("b".into(), entry);
        pending.insert("c".into(), entry);
        assert!(pending.take("a").is_none());
        assert!(pending.take("b").is_some());
        assert!(pending.take("c").is_some());
    }
}
