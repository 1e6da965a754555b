//! Log records and the hash chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::control::Decision;
use crate::error::{Error, Result};
use crate::evaluate::Scores;
use crate::monitor::Signals;
use crate::request::FinalAction;

/// prev_hash of the first record in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn is_sha256_hex(raw: &str) -> bool {
    raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Resources a request consumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub tokens_used: u64,
    pub latency_ms: u64,
    /// Verify/revise re-entries taken
    pub iterations: u32,
    /// Candidates requested across all rounds
    pub candidates_requested: usize,
    /// Candidates dropped for timeouts or generator errors
    pub candidates_dropped: usize,
}

/// What was returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedOutput {
    pub action: FinalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
    pub confidence: f64,
}

/// One audited decision. Candidate texts are stored as hashes only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub qid: String,
    pub timestamp: DateTime<Utc>,
    pub input_hash: String,
    pub candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<Signals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<Scores>,
    pub decision: Decision,
    pub output: LoggedOutput,
    pub cost: CostReport,
    /// Hash of the previous record's stored line, or [`GENESIS_HASH`]
    pub prev_hash: String,
}

impl LogRecord {
    /// Canonical serialization: the exact line written to the sink.
    pub fn canonical_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Hash of a stored line.
pub fn line_hash(line: &str) -> String {
    sha256_hex(line.as_bytes())
}

/// Verify a chain of stored lines.
///
/// Returns `ChainBroken { index }` for the first record that does not parse
/// or whose `prev_hash` does not match the hash of the line before it.
pub fn verify_chain<S: AsRef<str>>(lines: &[S]) -> Result<()> {
    let mut expected = GENESIS_HASH.to_string();
    for (index, line) in lines.iter().enumerate() {
        let line = line.as_ref();
        let record: LogRecord =
            serde_json::from_str(line).map_err(|_| Error::ChainBroken { index })?;
        if record.prev_hash != expected {
            return Err(Error::ChainBroken { index });
        }
        expected = line_hash(line);
    }
    Ok(())
}
