//! Learn: online calibration of the dual state from labelled outcomes.
//!
//! - [`Calibrator`]: synchronous dual ascent on λ and μ plus a split-conformal
//!   coverage threshold τ over a sliding window
//! - [`CalibrationService`]: single owning task; [`DualStateReader`] hands out
//!   copies to concurrent requests

mod calibrator;
mod service;
mod types;

pub use calibrator::{conformal_quantile, Calibrator};
pub use service::{CalibrationHandle, CalibrationService, DualStateReader};
pub use types::{CalibrationStats, CalibratorCheckpoint, DualState, Outcome};
