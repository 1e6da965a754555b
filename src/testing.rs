//! Mock adapters shared by unit tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::adapters::{
    Candidate, Entailment, EntailmentAdapter, GenerationPrompt, Generator, RetrievalAdapter,
    Scorer, SpanCoverage,
};
use crate::audit::{CostReport, LogRecord, LogSink, LoggedOutput, SinkEntry};
use crate::calibrate::DualState;
use crate::control::{Action, Decision, DecisionRule};
use crate::error::{Error, Result};
use crate::llm::{CompletionRequest, CompletionResponse, LLMClient, StopReason, TokenUsage};
use crate::request::{EvidenceBundle, FinalAction};

/// LLM client replaying canned replies in a cycle.
pub struct MockLLMClient {
    replies: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockLLMClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            replies: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail || self.replies.is_empty() {
            return Err(Error::adapter("mock", "provider unavailable"));
        }
        let content = self.replies[n % self.replies.len()].clone();
        let output_tokens = content.split_whitespace().count().max(1) as u64;
        Ok(CompletionResponse {
            id: format!("mock-{n}"),
            model: "mock".to_string(),
            content,
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage::new(12, output_tokens),
            token_log_probs: None,
            timestamp: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Returns a fixed label and counts calls.
pub struct CountingEntailment {
    result: Entailment,
    calls: AtomicUsize,
}

impl CountingEntailment {
    pub fn new(result: Entailment) -> Self {
        Self {
            result,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntailmentAdapter for CountingEntailment {
    async fn entail(&self, _claim_a: &str, _claim_b: &str) -> Result<Entailment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result)
    }
}

pub struct FailingEntailment;

#[async_trait]
impl EntailmentAdapter for FailingEntailment {
    async fn entail(&self, _claim_a: &str, _claim_b: &str) -> Result<Entailment> {
        Err(Error::adapter("entailment", "model offline"))
    }
}

pub struct FailingRetrieval;

#[async_trait]
impl RetrievalAdapter for FailingRetrieval {
    async fn coverage(&self, _claim: &str, _context: &EvidenceBundle) -> Result<SpanCoverage> {
        Err(Error::adapter("retrieval", "index offline"))
    }
}

pub struct FailingScorer {
    name: String,
}

impl FailingScorer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Scorer for FailingScorer {
    async fn score(&self, _candidate: &Candidate, _context: Option<&EvidenceBundle>) -> Result<f64> {
        Err(Error::adapter(self.name.clone(), "scorer offline"))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Scorer that sleeps before answering.
pub struct SlowScorer {
    name: String,
    value: f64,
    delay: Duration,
}

impl SlowScorer {
    pub fn new(name: impl Into<String>, value: f64, delay: Duration) -> Self {
        Self {
            name: name.into(),
            value,
            delay,
        }
    }
}

#[async_trait]
impl Scorer for SlowScorer {
    async fn score(&self, _candidate: &Candidate, _context: Option<&EvidenceBundle>) -> Result<f64> {
        tokio::time::sleep(self.delay).await;
        Ok(self.value)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// First-round answers, then re-entry answers, each indexed by sample.
pub struct ScriptedGenerator {
    first: Vec<String>,
    reentry: Vec<String>,
    rounds: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(first: Vec<&str>, reentry: Vec<&str>) -> Self {
        Self {
            first: first.into_iter().map(str::to_string).collect(),
            reentry: reentry.into_iter().map(str::to_string).collect(),
            rounds: AtomicUsize::new(0),
        }
    }

    /// Rounds started, counted by their first sample.
    pub fn rounds_seen(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &GenerationPrompt<'_>, k: usize) -> Result<Vec<Candidate>> {
        if prompt.sample_index == 0 {
            self.rounds.fetch_add(1, Ordering::SeqCst);
        }
        let answers = if prompt.instruction.is_some() {
            &self.reentry
        } else {
            &self.first
        };
        if answers.is_empty() {
            return Ok(Vec::new());
        }
        Ok((0..k)
            .map(|j| {
                let slot = prompt.sample_index + j;
                Candidate::new(slot, answers[slot % answers.len()].clone())
            })
            .collect())
    }
}

/// Generator whose listed sample slots sleep before answering.
pub struct SlowGenerator {
    text: String,
    slow_slots: HashSet<usize>,
    delay: Duration,
}

impl SlowGenerator {
    pub fn new(
        text: impl Into<String>,
        slow_slots: impl IntoIterator<Item = usize>,
        delay: Duration,
    ) -> Self {
        Self {
            text: text.into(),
            slow_slots: slow_slots.into_iter().collect(),
            delay,
        }
    }
}

#[async_trait]
impl Generator for SlowGenerator {
    async fn generate(&self, prompt: &GenerationPrompt<'_>, k: usize) -> Result<Vec<Candidate>> {
        if self.slow_slots.contains(&prompt.sample_index) {
            tokio::time::sleep(self.delay).await;
        }
        Ok((0..k)
            .map(|j| Candidate::new(prompt.sample_index + j, self.text.clone()))
            .collect())
    }
}

/// Sink whose first `failures` appends fail.
pub struct FlakySink {
    failures: usize,
    attempts: AtomicUsize,
    lines: Mutex<Vec<String>>,
}

impl FlakySink {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSink for FlakySink {
    async fn append(&self, entry: &SinkEntry) -> Result<()> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(Error::AuditStorage("disk unavailable".to_string()));
        }
        self.lines
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .push(entry.line.clone());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<String>> {
        Ok(self
            .lines
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .clone())
    }
}

/// A minimal abstain record for audit tests.
pub fn sample_log_record(qid: &str) -> LogRecord {
    LogRecord {
        qid: qid.to_string(),
        timestamp: Utc::now(),
        input_hash: crate::audit::sha256_hex(qid.as_bytes()),
        candidates: Vec::new(),
        signals: None,
        scores: None,
        decision: Decision::new(
            Action::Abstain,
            DecisionRule::GenerationUnavailable,
            "generation unavailable",
            DualState::default(),
            1.0,
        ),
        output: LoggedOutput {
            action: FinalAction::Abstain,
            text: None,
            citations: Vec::new(),
            confidence: 0.0,
        },
        cost: CostReport::default(),
        prev_hash: String::new(),
    }
}
