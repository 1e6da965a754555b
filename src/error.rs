//! Error types for rcl-core.

use thiserror::Error;

/// Result type alias using rcl-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the reliability control loop.
#[derive(Error, Debug)]
pub enum Error {
    /// Candidate generation did not finish within the latency cap
    #[error("Generation timed out after {duration_ms}ms")]
    GenerationTimeout { duration_ms: u64 },

    /// An external adapter (generator, entailment, scorer, retrieval) failed
    #[error("Adapter error: {adapter} - {message}")]
    Adapter { adapter: String, message: String },

    /// Request rejected before entering the pipeline
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Calibration update rejected
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// Audit log storage error
    #[error("Audit storage error: {0}")]
    AuditStorage(String),

    /// Audit hash chain does not verify
    #[error("Audit chain broken at record {index}")]
    ChainBroken { index: usize },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an adapter error.
    pub fn adapter(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    /// Create a generation timeout error.
    pub fn generation_timeout(duration_ms: u64) -> Self {
        Self::GenerationTimeout { duration_ms }
    }

    /// Whether this error came from a deadline rather than a faulty adapter.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::GenerationTimeout { .. })
    }
}
