//! Evaluator: judge, process-reward and citation scores for the best candidate.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::adapters::{Candidate, Scorer};
use crate::error::Result;
use crate::request::EvidenceBundle;

/// Normalized evaluator scores, each in [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub judge: f64,
    pub prm: f64,
    pub citation_score: f64,
}

impl Scores {
    pub fn worst_case() -> Self {
        Self {
            judge: 0.0,
            prm: 0.0,
            citation_score: 0.0,
        }
    }
}

/// Scores plus the names of scorers that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub scores: Scores,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
}

/// Runs the three scorers concurrently.
pub struct Evaluator {
    judge: Arc<dyn Scorer>,
    prm: Arc<dyn Scorer>,
    citation: Arc<dyn Scorer>,
}

impl Evaluator {
    pub fn new(judge: Arc<dyn Scorer>, prm: Arc<dyn Scorer>, citation: Arc<dyn Scorer>) -> Self {
        Self {
            judge,
            prm,
            citation,
        }
    }

    pub async fn evaluate(
        &self,
        candidate: &Candidate,
        context: Option<&EvidenceBundle>,
    ) -> ScoreReport {
        let (judge, prm, citation) = tokio::join!(
            self.judge.score(candidate, context),
            self.prm.score(candidate, context),
            self.citation.score(candidate, context),
        );

        let mut failed = Vec::new();
        let scores = Scores {
            judge: normalize(self.judge.name(), judge, &mut failed),
            prm: normalize(self.prm.name(), prm, &mut failed),
            citation_score: normalize(self.citation.name(), citation, &mut failed),
        };
        ScoreReport { scores, failed }
    }
}

/// Clamp to [0,1]; errors and non-finite values become 0.
fn normalize(name: &str, result: Result<f64>, failed: &mut Vec<String>) -> f64 {
    match result {
        Ok(v) if v.is_finite() => v.clamp(0.0, 1.0),
        Ok(v) => {
            warn!(scorer = name, value = v, "non-finite score");
            failed.push(name.to_string());
            0.0
        }
        Err(e) => {
            warn!(scorer = name, error = %e, "scorer failed");
            failed.push(name.to_string());
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixed::FixedScorer;
    use crate::testing::{FailingScorer, SlowScorer};
    use std::time::Duration;

    #[tokio::test]
    async fn test_scores_are_clamped() {
        let evaluator = Evaluator::new(
            Arc::new(FixedScorer::new("judge", 0.8)),
            Arc::new(FixedScorer::new("prm", 1.4)),
            Arc::new(FixedScorer::new("citation", -0.2)),
        );
        let report = evaluator.evaluate(&Candidate::new(0, "x"), None).await;
        assert_eq!(
            report.scores,
            Scores {
                judge: 0.8,
                prm: 1.0,
                citation_score: 0.0
            }
        );
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_worst_case() {
        let evaluator = Evaluator::new(
            Arc::new(FailingScorer::new("judge")),
            Arc::new(FixedScorer::new("prm", f64::NAN)),
            Arc::new(FixedScorer::new("citation", 0.7)),
        );
        let report = evaluator.evaluate(&Candidate::new(0, "x"), None).await;
        assert_eq!(report.scores.judge, 0.0);
        assert_eq!(report.scores.prm, 0.0);
        assert_eq!(report.scores.citation_score, 0.7);
        assert_eq!(report.failed, vec!["judge", "prm"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scorers_run_concurrently() {
        let evaluator = Evaluator::new(
            Arc::new(SlowScorer::new("judge", 0.9, Duration::from_millis(100))),
            Arc::new(SlowScorer::new("prm", 0.9, Duration::from_millis(100))),
            Arc::new(SlowScorer::new("citation", 0.9, Duration::from_millis(100))),
        );
        let started = tokio::time::Instant::now();
        evaluator.evaluate(&Candidate::new(0, "x"), None).await;
        assert!(started.elapsed() < Duration::from_millis(150));
    }
}
