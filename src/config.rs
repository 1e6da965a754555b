//! Configuration for the reliability control loop.
//!
//! Every tunable constant of the pipeline lives here so that deployments can
//! load them from a JSON file or the environment. Each stage has its own
//! section; `ControllerConfig` bundles them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Dynamic-K selector constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Weight of the query length proxy
    pub length_weight: f64,
    /// Weight of the retrieval thinness proxy
    pub thinness_weight: f64,
    /// Weight of the route's domain risk
    pub domain_weight: f64,
    /// r below this selects K=1
    pub low_cut: f64,
    /// r below this (and above `low_cut`) selects K=3, otherwise K=5
    pub high_cut: f64,
    /// Query length (chars) at which the length proxy saturates at 1.0
    pub length_saturation_chars: usize,
    /// Number of evidence spans at which the context stops being thin
    pub thick_context_spans: usize,
    /// Domain risk per route tag
    pub route_risk: HashMap<String, f64>,
    /// Domain risk for unknown routes
    pub default_route_risk: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        let route_risk = [
            ("medical", 0.9),
            ("legal", 0.9),
            ("finance", 0.8),
            ("code", 0.5),
            ("general", 0.3),
            ("chitchat", 0.1),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            length_weight: 0.3,
            thinness_weight: 0.4,
            domain_weight: 0.3,
            low_cut: 0.33,
            high_cut: 0.66,
            length_saturation_chars: 400,
            thick_context_spans: 3,
            route_risk,
            default_route_risk: 0.5,
        }
    }
}

/// Claim graph construction constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Claims kept per candidate (earliest-extracted first)
    pub max_claims_per_candidate: usize,
    /// Contradict edges at or below this weight are ignored by the consistency pass
    pub contradiction_threshold: f64,
    /// Maximum in-flight entailment adapter calls
    pub entailment_concurrency: usize,
    /// Minimum claim length in characters
    pub min_claim_length: usize,
    /// Maximum claim length in characters
    pub max_claim_length: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_claims_per_candidate: 8,
            contradiction_threshold: 0.5,
            entailment_concurrency: 8,
            min_claim_length: 10,
            max_claim_length: 500,
        }
    }
}

/// Signal extraction constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Number of leading tokens used for the entropy slope
    pub entropy_prefix_tokens: usize,
    /// Gain of the sigmoid mapping slope (bits/token) to [0,1]
    pub entropy_slope_gain: f64,
    /// Minimum retrieval coverage for a claim to count as supported
    pub min_retrieval_overlap: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            entropy_prefix_tokens: 32,
            entropy_slope_gain: 20.0,
            min_retrieval_overlap: 0.5,
        }
    }
}

/// Decision controller constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Risk weight of (1 - judge)
    pub judge_risk_weight: f64,
    /// Risk weight of contradiction mass
    pub contradiction_risk_weight: f64,
    /// Risk weight of (1 - rag_coverage); dropped when no context is supplied
    pub coverage_risk_weight: f64,
    /// Contradiction mass above which the answer is revised
    pub contradiction_high_water: f64,
    /// Risk at or above which the answer is abstained unconditionally
    pub abstain_risk_ceiling: f64,
    /// Fixed utility of abstaining
    pub abstain_utility: f64,
    /// Residual risk fraction after a revision
    pub revise_risk_factor: f64,
    /// Residual risk fraction after verification
    pub verify_risk_factor: f64,
    /// Utility cost of an extra revision round
    pub revise_friction: f64,
    /// Utility cost of an extra verification round
    pub verify_friction: f64,
    /// Soft cost target as a fraction of the token cap (the `budget` in the λ term)
    pub cost_target: f64,
    /// Verify actions allowed per request
    pub max_verify: u32,
    /// Revise actions allowed per request
    pub max_revise: u32,
    /// Total re-entries allowed per request
    pub max_iterations: u32,
    /// Verification costs this multiple of a plain regeneration
    pub verify_cost_multiplier: f64,
    /// Share of the remaining latency budget one generation round may use;
    /// slower samples are dropped
    pub generation_timeout_fraction: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            judge_risk_weight: 0.4,
            contradiction_risk_weight: 0.35,
            coverage_risk_weight: 0.25,
            contradiction_high_water: 0.5,
            abstain_risk_ceiling: 0.9,
            abstain_utility: 0.5,
            revise_risk_factor: 0.6,
            verify_risk_factor: 0.5,
            revise_friction: 0.1,
            verify_friction: 0.15,
            cost_target: 0.5,
            max_verify: 2,
            max_revise: 2,
            max_iterations: 3,
            verify_cost_multiplier: 1.25,
            generation_timeout_fraction: 0.6,
        }
    }
}

/// Calibrator constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Dual ascent step size η
    pub eta: f64,
    /// Target miscoverage α for the conformal threshold
    pub alpha: f64,
    /// Sliding window of nonconformity scores
    pub window_size: usize,
    /// Outcomes required before τ leaves its initial value
    pub warmup: usize,
    /// Recompute τ every this many accepted outcomes
    pub recalibrate_every: u64,
    /// Write a checkpoint every this many accepted outcomes (0 disables)
    pub checkpoint_every: u64,
    /// Where checkpoints are written
    pub checkpoint_path: Option<PathBuf>,
    /// Initial λ
    pub initial_lambda: f64,
    /// Initial μ
    pub initial_mu: f64,
    /// Initial τ
    pub initial_tau: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            eta: 0.05,
            alpha: 0.1,
            window_size: 256,
            warmup: 32,
            recalibrate_every: 16,
            checkpoint_every: 100,
            checkpoint_path: None,
            initial_lambda: 0.0,
            initial_mu: 0.0,
            initial_tau: 0.0,
        }
    }
}

/// Audit logger constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Write attempts before a record is counted as missing
    pub max_attempts: u32,
    /// First retry delay
    pub backoff_base_ms: u64,
    /// Retry delay ceiling
    pub backoff_max_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
        }
    }
}

/// Complete configuration for the reliability controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub selector: SelectorConfig,
    pub graph: GraphConfig,
    pub signals: SignalConfig,
    pub control: ControlConfig,
    pub calibration: CalibrationConfig,
    pub audit: AuditConfig,
}

impl ControllerConfig {
    /// Conservative configuration: more samples, earlier revision, lower ceiling.
    pub fn strict() -> Self {
        let mut config = Self::default();
        config.selector.low_cut = 0.2;
        config.selector.high_cut = 0.5;
        config.graph.contradiction_threshold = 0.4;
        config.signals.min_retrieval_overlap = 0.6;
        config.control.contradiction_high_water = 0.3;
        config.control.abstain_risk_ceiling = 0.7;
        config.control.abstain_utility = 0.6;
        config.calibration.alpha = 0.05;
        config
    }

    /// Permissive configuration: fewer samples, only egregious failures abstain.
    pub fn permissive() -> Self {
        let mut config = Self::default();
        config.selector.low_cut = 0.5;
        config.selector.high_cut = 0.8;
        config.graph.contradiction_threshold = 0.7;
        config.signals.min_retrieval_overlap = 0.35;
        config.control.contradiction_high_water = 0.7;
        config.control.abstain_risk_ceiling = 0.95;
        config.control.abstain_utility = 0.3;
        config.calibration.alpha = 0.2;
        config
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Create configuration from environment variables (prefix `RCL_`) and
    /// validate it.
    ///
    /// Unset or unparseable variables keep their default value.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<f64>().ok());
        let parsed_int = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let mut config = Self::default();
        if let Some(v) = parsed("RCL_ALPHA") {
            config.calibration.alpha = v;
        }
        if let Some(v) = parsed("RCL_ETA") {
            config.calibration.eta = v;
        }
        if let Some(v) = parsed("RCL_CONTRADICTION_HIGH_WATER") {
            config.control.contradiction_high_water = v;
        }
        if let Some(v) = parsed("RCL_ABSTAIN_RISK_CEILING") {
            config.control.abstain_risk_ceiling = v;
        }
        if let Some(v) = parsed_int("RCL_MAX_ITERATIONS") {
            config.control.max_iterations = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = parsed_int("RCL_MAX_CLAIMS") {
            config.graph.max_claims_per_candidate = v as usize;
        }
        if let Some(v) = parsed_int("RCL_ENTAILMENT_CONCURRENCY") {
            config.graph.entailment_concurrency = v as usize;
        }
        if let Some(v) = parsed_int("RCL_WINDOW_SIZE") {
            config.calibration.window_size = v as usize;
        }
        if let Some(path) = lookup("RCL_CHECKPOINT_PATH") {
            config.calibration.checkpoint_path = Some(PathBuf::from(path));
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let s = &self.selector;
        let weight_sum = s.length_weight + s.thinness_weight + s.domain_weight;
        if (weight_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::Config(format!(
                "selector weights must sum to 1, got {:.4}",
                weight_sum
            )));
        }
        if !(0.0 < s.low_cut && s.low_cut < s.high_cut && s.high_cut < 1.0) {
            return Err(Error::Config(format!(
                "selector cut points must satisfy 0 < low < high < 1, got {} / {}",
                s.low_cut, s.high_cut
            )));
        }

        let c = &self.control;
        let risk_weights = [
            c.judge_risk_weight,
            c.contradiction_risk_weight,
            c.coverage_risk_weight,
        ];
        if risk_weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(Error::Config(format!(
                "risk weights must be non-negative, got {:?}",
                risk_weights
            )));
        }
        let risk_sum = c.judge_risk_weight + c.contradiction_risk_weight + c.coverage_risk_weight;
        if (risk_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::Config(format!(
                "risk weights must sum to 1, got {:.4}",
                risk_sum
            )));
        }
        if !(c.abstain_risk_ceiling > 0.0 && c.abstain_risk_ceiling <= 1.0) {
            return Err(Error::Config(format!(
                "abstain_risk_ceiling must lie in (0,1], got {}",
                c.abstain_risk_ceiling
            )));
        }
        if !(c.contradiction_high_water >= 0.0 && c.contradiction_high_water < 1.0) {
            return Err(Error::Config(format!(
                "contradiction_high_water must lie in [0,1), got {}",
                c.contradiction_high_water
            )));
        }
        if c.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".to_string()));
        }
        if !(c.generation_timeout_fraction > 0.0 && c.generation_timeout_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "generation_timeout_fraction must lie in (0,1], got {}",
                c.generation_timeout_fraction
            )));
        }

        if self.graph.entailment_concurrency == 0 {
            return Err(Error::Config(
                "entailment_concurrency must be at least 1".to_string(),
            ));
        }

        let cal = &self.calibration;
        if !(cal.eta.is_finite() && cal.eta > 0.0) {
            return Err(Error::Config(format!("eta must be positive, got {}", cal.eta)));
        }
        if !(cal.alpha > 0.0 && cal.alpha < 1.0) {
            return Err(Error::Config(format!(
                "alpha must lie in (0,1), got {}",
                cal.alpha
            )));
        }
        if cal.window_size == 0 {
            return Err(Error::Config("window_size must be at least 1".to_string()));
        }

        Ok(())
    }
}
