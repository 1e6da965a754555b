//! Hash-chained, append-only decision log.
//!
//! Each stored line is the canonical JSON of a [`LogRecord`] whose
//! `prev_hash` is the SHA-256 of the line before it. Editing, dropping or
//! reordering stored lines breaks the chain at the first affected record.

mod logger;
mod record;
mod sink;

pub use logger::{load_and_verify, AuditHandle, AuditLogger, AuditStats};
pub use record::{
    is_sha256_hex, line_hash, sha256_hex, verify_chain, CostReport, LogRecord, LoggedOutput,
    GENESIS_HASH,
};
#[cfg(feature = "sqlite")]
pub use sink::SqliteSink;
pub use sink::{JsonlFileSink, LogSink, MemorySink, SinkEntry};
