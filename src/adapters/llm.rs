//! Adapters backed by an [`LLMClient`].

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{parse_probability_from_text, ChatMessage, CompletionRequest, LLMClient};
use crate::request::EvidenceBundle;

use super::{Candidate, Entailment, EntailmentAdapter, EntailmentLabel, GenerationPrompt, Generator, Scorer};

const GENERATOR_SYSTEM: &str = "Answer the question concisely. When evidence is provided, \
rely on it and do not state facts the evidence does not support.";

/// Samples candidates with one completion per sample.
pub struct LlmGenerator {
    client: Arc<dyn LLMClient>,
    model: Option<String>,
    temperature: f64,
    max_tokens: u32,
}

impl LlmGenerator {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            model: None,
            temperature: 0.7,
            max_tokens: 512,
        }
    }

    /// Sets the model name sent with every request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Caps the completion length.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_request(&self, prompt: &GenerationPrompt<'_>) -> CompletionRequest {
        let mut request = CompletionRequest::new()
            .with_system(GENERATOR_SYSTEM)
            .with_message(ChatMessage::user(prompt.render()))
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
            .with_logprobs(true);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }
        request
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, prompt: &GenerationPrompt<'_>, k: usize) -> Result<Vec<Candidate>> {
        let futures = (0..k).map(|j| {
            let request = self.build_request(prompt);
            let index = prompt.sample_index + j;
            async move {
                let response = self.client.complete(request).await?;
                Ok::<_, Error>(
                    Candidate::new(index, response.content)
                        .with_log_probs(response.token_log_probs.unwrap_or_default())
                        .with_tokens(response.usage.total()),
                )
            }
        });

        let mut candidates = Vec::with_capacity(k);
        let mut last_error = None;
        for result in join_all(futures).await {
            match result {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    debug!(client = self.client.name(), error = %e, "sample failed");
                    last_error = Some(e);
                }
            }
        }

        match (candidates.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(candidates),
        }
    }
}

/// What an [`LlmScorer`] is asked to judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerKind {
    /// Overall factual correctness of the answer
    Judge,
    /// Soundness of each reasoning step
    ProcessReward,
}

impl ScorerKind {
    fn instruction(&self) -> &'static str {
        match self {
            Self::Judge => {
                "Estimate the probability that the answer below is factually correct and \
                 fully responsive to the question. Reply with only a number between 0 and 1."
            }
            Self::ProcessReward => {
                "Evaluate each reasoning step of the answer below. Estimate the probability \
                 that every step is valid. Reply with only a number between 0 and 1."
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Judge => "judge",
            Self::ProcessReward => "prm",
        }
    }
}

/// Judge or process-reward scorer that parses a probability from the reply.
pub struct LlmScorer {
    client: Arc<dyn LLMClient>,
    kind: ScorerKind,
    model: Option<String>,
}

impl LlmScorer {
    pub fn new(client: Arc<dyn LLMClient>, kind: ScorerKind) -> Self {
        Self {
            client,
            kind,
            model: None,
        }
    }

    pub fn judge(client: Arc<dyn LLMClient>) -> Self {
        Self::new(client, ScorerKind::Judge)
    }

    pub fn process_reward(client: Arc<dyn LLMClient>) -> Self {
        Self::new(client, ScorerKind::ProcessReward)
    }

    /// Sets the model name sent with every request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl Scorer for LlmScorer {
    async fn score(&self, candidate: &Candidate, context: Option<&EvidenceBundle>) -> Result<f64> {
        let mut prompt = String::new();
        if let Some(context) = context.filter(|c| !c.is_empty()) {
            prompt.push_str("Evidence:\n");
            prompt.push_str(&context.render());
            prompt.push_str("\n\n");
        }
        prompt.push_str("Answer:\n");
        prompt.push_str(&candidate.text);

        let mut request = CompletionRequest::new()
            .with_system(self.kind.instruction())
            .with_message(ChatMessage::user(prompt))
            .with_max_tokens(16)
            .with_temperature(0.0);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = self.client.complete(request).await?;
        parse_probability_from_text(&response.content).ok_or_else(|| {
            Error::adapter(
                self.kind.name(),
                format!("unparseable score: {:?}", response.content),
            )
        })
    }

    fn name(&self) -> &str {
        self.kind.name()
    }
}

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(entail(?:s|ment)?|neutral|contradict(?:s|ion)?)\b").expect("static regex")
});

const ENTAILMENT_SYSTEM: &str = "Decide the relation between two statements. Reply on one line \
with exactly one of: entail, neutral, contradict. Follow it with your confidence between 0 and 1.";

/// Entailment adapter that asks the model for a label and a confidence.
pub struct LlmEntailment {
    client: Arc<dyn LLMClient>,
    model: Option<String>,
}

impl LlmEntailment {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self {
            client,
            model: None,
        }
    }

    /// Sets the model name sent with every request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Parse "label confidence" from a reply. A missing confidence reads as 0.5.
    pub fn parse_reply(reply: &str) -> Option<Entailment> {
        let m = LABEL_RE.find(reply)?;
        let label: EntailmentLabel = m.as_str().parse().ok()?;
        let weight = parse_probability_from_text(&reply[m.end()..]).unwrap_or(0.5);
        Some(Entailment::new(label, weight))
    }
}

#[async_trait]
impl EntailmentAdapter for LlmEntailment {
    async fn entail(&self, claim_a: &str, claim_b: &str) -> Result<Entailment> {
        let mut request = CompletionRequest::new()
            .with_system(ENTAILMENT_SYSTEM)
            .with_message(ChatMessage::user(format!(
                "Statement A: {}\nStatement B: {}",
                claim_a, claim_b
            )))
            .with_max_tokens(16)
            .with_temperature(0.0);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = self.client.complete(request).await?;
        Self::parse_reply(&response.content).ok_or_else(|| {
            Error::adapter(
                "entailment",
                format!("unparseable label: {:?}", response.content),
            )
        })
    }
}
