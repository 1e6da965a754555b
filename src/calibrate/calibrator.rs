//! Dual ascent and split-conformal threshold.

use chrono::Utc;
use std::collections::VecDeque;
use tracing::debug;

use crate::config::CalibrationConfig;
use crate::error::{Error, Result};

use super::types::{CalibrationStats, CalibratorCheckpoint, DualState, Outcome};

/// The `ceil((1 - alpha)(n + 1))`-th smallest score, clamped to the sample.
/// None for an empty sample.
pub fn conformal_quantile(scores: &[f64], alpha: f64) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let rank = ((1.0 - alpha) * (n as f64 + 1.0)).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(sorted[idx])
}

/// Single-writer owner of the [`DualState`].
///
/// λ and μ follow projected dual ascent on every accepted outcome. τ is the
/// conformal quantile of the nonconformity window, recomputed every
/// `recalibrate_every` outcomes once `warmup` outcomes have been seen.
#[derive(Debug, Clone)]
pub struct Calibrator {
    config: CalibrationConfig,
    state: DualState,
    window: VecDeque<f64>,
    stats: CalibrationStats,
    since_recalibration: u64,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        let state = DualState::new(
            config.initial_lambda.max(0.0),
            config.initial_mu.max(0.0),
            config.initial_tau.clamp(0.0, 1.0),
        );
        let window = VecDeque::with_capacity(config.window_size.max(1));
        Self {
            config,
            state,
            window,
            stats: CalibrationStats::default(),
            since_recalibration: 0,
        }
    }

    /// Resume from a checkpoint.
    pub fn restore(config: CalibrationConfig, checkpoint: CalibratorCheckpoint) -> Result<Self> {
        if !checkpoint.state.is_valid() {
            return Err(Error::Calibration(format!(
                "checkpoint holds invalid dual state {:?}",
                checkpoint.state
            )));
        }
        let mut calibrator = Self::new(config);
        calibrator.state = checkpoint.state;
        calibrator.stats = checkpoint.stats;
        let keep = checkpoint.window.len().saturating_sub(calibrator.window_capacity());
        calibrator.window = checkpoint
            .window
            .into_iter()
            .skip(keep)
            .filter(|s| s.is_finite())
            .collect();
        calibrator.stats.window_len = calibrator.window.len();
        Ok(calibrator)
    }

    pub fn state(&self) -> DualState {
        self.state
    }

    pub fn stats(&self) -> CalibrationStats {
        self.stats
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Nonconformity scores kept; a zero-sized window still keeps the latest.
    fn window_capacity(&self) -> usize {
        self.config.window_size.max(1)
    }

    /// Apply one outcome. On error the state is untouched and the skip
    /// counter is incremented.
    pub fn update(&mut self, outcome: &Outcome) -> Result<DualState> {
        if let Err(e) = outcome.validate() {
            self.stats.skipped += 1;
            return Err(e);
        }

        let eta = self.config.eta;
        let next = DualState {
            lambda: (self.state.lambda + eta * (outcome.observed_cost - outcome.cost_budget))
                .max(0.0),
            mu: (self.state.mu + eta * (outcome.observed_risk - outcome.risk_cap)).max(0.0),
            tau: self.state.tau,
        };
        if !next.is_valid() {
            self.stats.skipped += 1;
            return Err(Error::Calibration(format!(
                "update would produce invalid state {:?}",
                next
            )));
        }
        self.state = next;

        if let Some(coverage) = outcome.coverage {
            while self.window.len() >= self.window_capacity() {
                self.window.pop_front();
            }
            self.window.push_back(1.0 - coverage);
        }

        self.stats.accepted += 1;
        self.stats.window_len = self.window.len();
        self.since_recalibration += 1;

        if self.window.len() >= self.config.warmup
            && self.since_recalibration >= self.config.recalibrate_every.max(1)
        {
            self.recalibrate();
        }

        Ok(self.state)
    }

    /// Recompute τ from the current window.
    pub fn recalibrate(&mut self) {
        let window: Vec<f64> = self.window.iter().copied().collect();
        if let Some(q) = conformal_quantile(&window, self.config.alpha) {
            debug!(tau = q, window = window.len(), "recalibrated coverage threshold");
            self.state.tau = q.clamp(0.0, 1.0);
            self.stats.recalibrations += 1;
        }
        self.since_recalibration = 0;
    }

    /// Whether the accepted count just crossed a checkpoint boundary.
    pub fn checkpoint_due(&self) -> bool {
        self.config.checkpoint_every > 0
            && self.stats.accepted > 0
            && self.stats.accepted % self.config.checkpoint_every == 0
    }

    pub fn checkpoint(&self) -> CalibratorCheckpoint {
        CalibratorCheckpoint {
            state: self.state,
            window: self.window.iter().copied().collect(),
            stats: self.stats,
            written_at: Utc::now(),
        }
    }
}
