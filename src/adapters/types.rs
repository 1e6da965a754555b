//! Values exchanged with external adapters.

use serde::{Deserialize, Serialize};

use crate::request::EvidenceBundle;

/// One sampled output of the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Position among the samples of one generation round
    pub index: usize,
    /// Generated answer text
    pub text: String,
    /// Log-probability of each generated token, in order
    #[serde(default)]
    pub token_log_probs: Vec<f64>,
    /// Confidence the model reported for its own answer, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_reported_confidence: Option<f64>,
    /// Tokens spent producing this candidate
    #[serde(default)]
    pub tokens_used: u64,
}

impl Candidate {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            token_log_probs: Vec::new(),
            self_reported_confidence: None,
            tokens_used: 0,
        }
    }

    /// Attaches per-token log-probs.
    pub fn with_log_probs(mut self, token_log_probs: Vec<f64>) -> Self {
        self.token_log_probs = token_log_probs;
        self
    }

    /// Sets the model-reported confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.self_reported_confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Records the tokens spent generating this candidate.
    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    /// Tokens spent, falling back to a whitespace estimate when the generator
    /// did not report usage.
    pub fn token_estimate(&self) -> u64 {
        if self.tokens_used > 0 {
            self.tokens_used
        } else if !self.token_log_probs.is_empty() {
            self.token_log_probs.len() as u64
        } else {
            self.text.split_whitespace().count() as u64
        }
    }
}

/// What the generator is asked to produce.
#[derive(Debug, Clone, Copy)]
pub struct GenerationPrompt<'a> {
    pub query: &'a str,
    pub context: Option<&'a EvidenceBundle>,
    /// Extra instruction on re-entry (verify against evidence, revise)
    pub instruction: Option<&'a str>,
    /// Index of this sample within the round
    pub sample_index: usize,
}

impl<'a> GenerationPrompt<'a> {
    pub fn new(query: &'a str, context: Option<&'a EvidenceBundle>) -> Self {
        Self {
            query,
            context,
            instruction: None,
            sample_index: 0,
        }
    }

    /// Adds a verify or revise instruction.
    pub fn with_instruction(mut self, instruction: Option<&'a str>) -> Self {
        self.instruction = instruction;
        self
    }

    /// Sets which of the K samples this call produces.
    pub fn with_sample_index(mut self, sample_index: usize) -> Self {
        self.sample_index = sample_index;
        self
    }

    /// Render as a single user prompt.
    pub fn render(&self) -> String {
        let mut prompt = String::new();
        if let Some(context) = self.context.filter(|c| !c.is_empty()) {
            prompt.push_str("Evidence:\n");
            prompt.push_str(&context.render());
            prompt.push_str("\n\n");
        }
        prompt.push_str("Question: ");
        prompt.push_str(self.query);
        if let Some(instruction) = self.instruction {
            prompt.push_str("\n\n");
            prompt.push_str(instruction);
        }
        prompt
    }
}

/// Label of an entailment edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntailmentLabel {
    Entail,
    Neutral,
    Contradict,
}

impl std::fmt::Display for EntailmentLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entail => write!(f, "entail"),
            Self::Neutral => write!(f, "neutral"),
            Self::Contradict => write!(f, "contradict"),
        }
    }
}

impl std::str::FromStr for EntailmentLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "entail" | "entails" | "entailment" => Ok(Self::Entail),
            "neutral" | "unrelated" => Ok(Self::Neutral),
            "contradict" | "contradicts" | "contradiction" => Ok(Self::Contradict),
            other => Err(format!("unknown entailment label: {}", other)),
        }
    }
}

/// Result of one entailment call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entailment {
    pub label: EntailmentLabel,
    /// Confidence in [0,1]
    pub weight: f64,
}

impl Entailment {
    pub fn new(label: EntailmentLabel, weight: f64) -> Self {
        Self {
            label,
            weight: if weight.is_finite() {
                weight.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    pub fn entail(weight: f64) -> Self {
        Self::new(EntailmentLabel::Entail, weight)
    }

    pub fn neutral(weight: f64) -> Self {
        Self::new(EntailmentLabel::Neutral, weight)
    }

    pub fn contradict(weight: f64) -> Self {
        Self::new(EntailmentLabel::Contradict, weight)
    }
}

/// Best supporting span for a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanCoverage {
    /// Coverage in [0,1]
    pub score: f64,
    /// Id of the best-matching span
    pub span_id: Option<String>,
}

impl SpanCoverage {
    pub fn none() -> Self {
        Self {
            score: 0.0,
            span_id: None,
        }
    }

    pub fn new(score: f64, span_id: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            span_id: Some(span_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::EvidenceSpan;

    #[test]
    fn test_token_estimate_fallbacks() {
        assert_eq!(Candidate::new(0, "one two three").token_estimate(), 3);
        assert_eq!(
            Candidate::new(0, "x").with_log_probs(vec![-0.1; 5]).token_estimate(),
            5
        );
        assert_eq!(Candidate::new(0, "x").with_tokens(42).token_estimate(), 42);
    }

    #[test]
    fn test_prompt_render() {
        let bundle = EvidenceBundle::new(vec![EvidenceSpan::new("s1", "Water boils at 100C.")]);
        let prompt = GenerationPrompt::new("When does water boil?", Some(&bundle))
            .with_instruction(Some("Cite the evidence."));
        let rendered = prompt.render();
        assert!(rendered.starts_with("Evidence:\n[s1] Water boils at 100C."));
        assert!(rendered.contains("Question: When does water boil?"));
        assert!(rendered.ends_with("Cite the evidence."));
    }

    #[test]
    fn test_label_parse_and_weight_clamp() {
        assert_eq!("Contradiction".parse::<EntailmentLabel>(), Ok(EntailmentLabel::Contradict));
        assert!("maybe".parse::<EntailmentLabel>().is_err());
        assert_eq!(Entailment::entail(1.7).weight, 1.0);
        assert_eq!(Entailment::neutral(f64::NAN).weight, 0.0);
    }
}
