//! Request and response surface of the controller.
//!
//! A `Request` is immutable once accepted. The caller always receives a
//! `Response` whose action is `emit` or `abstain`; verify and revise only
//! exist inside the pipeline loop.

use serde::{Deserialize, Serialize};

use crate::audit::sha256_hex;
use crate::error::{Error, Result};

/// Resource caps for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Total tokens the request may spend across all loops
    pub token_cap: u64,
    /// Wall-clock cap for the whole request
    pub latency_cap_ms: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            token_cap: 8_192,
            latency_cap_ms: 10_000,
        }
    }
}

impl Budget {
    pub fn new(token_cap: u64, latency_cap_ms: u64) -> Self {
        Self {
            token_cap,
            latency_cap_ms,
        }
    }
}

/// Domain tag used for risk estimation (e.g. "medical", "general").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route(pub String);

impl Route {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Route {
    fn default() -> Self {
        Self::new("general")
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One retrieved passage supplied with the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    /// Identifier returned as a citation
    pub id: String,
    /// Passage text
    pub text: String,
    /// Where the passage came from (URL, document path, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EvidenceSpan {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source: None,
        }
    }

    /// Sets where the span came from.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Structured evidence supplied with a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub spans: Vec<EvidenceSpan>,
}

impl EvidenceBundle {
    pub fn new(spans: Vec<EvidenceSpan>) -> Self {
        Self { spans }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Render the bundle for inclusion in a prompt.
    pub fn render(&self) -> String {
        self.spans
            .iter()
            .map(|s| format!("[{}] {}", s.id, s.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A query submitted to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<EvidenceBundle>,
    #[serde(default)]
    pub route: Route,
    #[serde(default)]
    pub budget: Budget,
    /// Acceptable risk, strictly inside (0, 1)
    pub risk_cap: f64,
}

impl Request {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: None,
            route: Route::default(),
            budget: Budget::default(),
            risk_cap: 0.2,
        }
    }

    /// Attaches retrieved evidence.
    pub fn with_context(mut self, context: EvidenceBundle) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the route tag used for domain risk.
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Route::new(route);
        self
    }

    /// Overrides the default token and latency budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    /// Overrides the per-request risk cap.
    pub fn with_risk_cap(mut self, risk_cap: f64) -> Self {
        self.risk_cap = risk_cap;
        self
    }

    /// Whether non-empty evidence was supplied.
    pub fn has_context(&self) -> bool {
        self.context.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Reject requests the pipeline cannot accept.
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::InvalidRequest("query is empty".to_string()));
        }
        if !(self.risk_cap.is_finite() && self.risk_cap > 0.0 && self.risk_cap < 1.0) {
            return Err(Error::InvalidRequest(format!(
                "risk_cap must lie in (0,1), got {}",
                self.risk_cap
            )));
        }
        if self.budget.token_cap == 0 {
            return Err(Error::InvalidRequest("token_cap must be positive".to_string()));
        }
        if self.budget.latency_cap_ms == 0 {
            return Err(Error::InvalidRequest(
                "latency_cap_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// SHA-256 of the request's JSON serialization.
    pub fn input_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(sha256_hex(&bytes))
    }
}

/// Terminal action returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalAction {
    Emit,
    Abstain,
}

impl std::fmt::Display for FinalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emit => write!(f, "emit"),
            Self::Abstain => write!(f, "abstain"),
        }
    }
}

/// What the caller receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub action: FinalAction,
    /// Answer text, present only when emitting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Evidence span ids supporting the answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
    /// 1 - estimated risk at decision time
    pub confidence: f64,
    /// Audit record id (the request qid)
    pub log_id: String,
    /// Rationale of the terminal decision
    pub rationale: String,
}

impl Response {
    pub fn is_emit(&self) -> bool {
        self.action == FinalAction::Emit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_and_validation() {
        let request = Request::new("What is the boiling point of water?")
            .with_route("General")
            .with_risk_cap(0.1)
            .with_context(EvidenceBundle::new(vec![EvidenceSpan::new(
                "s1",
                "Water boils at 100 degrees Celsius at sea level.",
            )]));

        assert_eq!(request.route.as_str(), "general");
        assert!(request.has_context());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_invalid_requests() {
        assert!(Request::new("  ").validate().is_err());
        assert!(Request::new("q").with_risk_cap(0.0).validate().is_err());
        assert!(Request::new("q").with_risk_cap(1.0).validate().is_err());
        assert!(Request::new("q").with_risk_cap(f64::NAN).validate().is_err());
        assert!(Request::new("q")
            .with_budget(Budget::new(0, 100))
            .validate()
            .is_err());
    }

    #[test]
    fn test_empty_context_is_not_context() {
        let request = Request::new("q").with_context(EvidenceBundle::default());
        assert!(!request.has_context());
    }

    #[test]
    fn test_input_hash_is_stable() {
        let a = Request::new("same question");
        let b = Request::new("same question");
        let c = Request::new("other question");
        assert_eq!(a.input_hash().unwrap(), b.input_hash().unwrap());
        assert_ne!(a.input_hash().unwrap(), c.input_hash().unwrap());
        assert_eq!(a.input_hash().unwrap().len(), 64);
    }
}
