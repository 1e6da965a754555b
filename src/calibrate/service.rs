//! Background task that owns the calibrator.
//!
//! Outcomes arrive over an mpsc channel and are applied one at a time, so
//! the dual state has exactly one writer. Every update is published on a
//! watch channel; readers copy the latest value and never see a partial
//! update.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::trajectory::{TrajectoryEmitter, TrajectoryEvent, TrajectoryEventType};

use super::calibrator::Calibrator;
use super::types::{CalibrationStats, CalibratorCheckpoint, DualState, Outcome};

const CHANNEL_CAPACITY: usize = 1024;

enum Command {
    Outcome(Outcome),
    Stats(oneshot::Sender<CalibrationStats>),
    Checkpoint(oneshot::Sender<CalibratorCheckpoint>),
}

/// Read side of the dual state.
#[derive(Debug, Clone)]
pub struct DualStateReader {
    rx: watch::Receiver<DualState>,
}

impl DualStateReader {
    /// A reader pinned to one value, for pipelines without a calibrator.
    pub fn fixed(state: DualState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    /// Copy of the latest published state.
    pub fn snapshot(&self) -> DualState {
        *self.rx.borrow()
    }

    /// Wait for the next published update. Errors once the service stopped.
    pub async fn changed(&mut self) -> Result<DualState> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Calibration("calibration service stopped".to_string()))?;
        Ok(*self.rx.borrow_and_update())
    }
}

/// Write side: submits outcomes to the owning task.
#[derive(Debug, Clone)]
pub struct CalibrationHandle {
    tx: mpsc::Sender<Command>,
}

impl CalibrationHandle {
    pub async fn submit(&self, outcome: Outcome) -> Result<()> {
        self.tx
            .send(Command::Outcome(outcome))
            .await
            .map_err(|_| Error::Calibration("calibration service stopped".to_string()))
    }

    pub async fn stats(&self) -> Result<CalibrationStats> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats(tx))
            .await
            .map_err(|_| Error::Calibration("calibration service stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Calibration("calibration service stopped".to_string()))
    }

    /// Current checkpoint, after every previously submitted outcome.
    pub async fn checkpoint(&self) -> Result<CalibratorCheckpoint> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Checkpoint(tx))
            .await
            .map_err(|_| Error::Calibration("calibration service stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Calibration("calibration service stopped".to_string()))
    }
}

/// Spawns and wires the calibration task.
pub struct CalibrationService;

impl CalibrationService {
    /// Start the owning task. It stops when every handle is dropped and
    /// returns the calibrator from its join handle.
    pub fn spawn(
        calibrator: Calibrator,
        emitter: Arc<dyn TrajectoryEmitter>,
    ) -> (CalibrationHandle, DualStateReader, JoinHandle<Calibrator>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(calibrator.state());
        let task = tokio::spawn(run(calibrator, rx, state_tx, emitter));
        (
            CalibrationHandle { tx },
            DualStateReader { rx: state_rx },
            task,
        )
    }

    /// Load a checkpoint written by the service.
    pub async fn load_checkpoint(path: impl Into<PathBuf>) -> Result<CalibratorCheckpoint> {
        let path = path.into();
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Calibration(format!("reading {}: {}", path.display(), e)))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

async fn run(
    mut calibrator: Calibrator,
    mut rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<DualState>,
    emitter: Arc<dyn TrajectoryEmitter>,
) -> Calibrator {
    info!(state = ?calibrator.state(), "calibration service started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Outcome(outcome) => {
                let qid = outcome.qid.clone().unwrap_or_default();
                match calibrator.update(&outcome) {
                    Ok(state) => {
                        state_tx.send_replace(state);
                        debug!(qid = %qid, ?state, "calibration applied");
                        emitter.emit(
                            TrajectoryEvent::new(
                                TrajectoryEventType::CalibrationApplied,
                                0,
                                format!(
                                    "lambda={:.4} mu={:.4} tau={:.4}",
                                    state.lambda, state.mu, state.tau
                                ),
                            )
                            .with_metadata("qid", qid),
                        );
                        if calibrator.checkpoint_due() {
                            write_checkpoint(&calibrator).await;
                        }
                    }
                    Err(e) => {
                        warn!(qid = %qid, error = %e, "calibration skipped");
                        emitter.emit(
                            TrajectoryEvent::new(
                                TrajectoryEventType::CalibrationSkipped,
                                0,
                                e.to_string(),
                            )
                            .with_metadata("qid", qid),
                        );
                    }
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(calibrator.stats());
            }
            Command::Checkpoint(reply) => {
                let _ = reply.send(calibrator.checkpoint());
            }
        }
    }

    info!(stats = ?calibrator.stats(), "calibration service stopped");
    calibrator
}

async fn write_checkpoint(calibrator: &Calibrator) {
    let Some(path) = calibrator.config().checkpoint_path.clone() else {
        return;
    };
    let checkpoint = calibrator.checkpoint();
    let bytes = match serde_json::to_vec_pretty(&checkpoint) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to serialize calibration checkpoint");
            return;
        }
    };
    // Temp file then rename; the rename is atomic.
    let tmp = path.with_extension("tmp");
    let result = async {
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }
    .await;
    match result {
        Ok(()) => debug!(path = %path.display(), "calibration checkpoint written"),
        Err(e) => warn!(path = %path.display(), error = %e, "calibration checkpoint failed"),
    }
}
