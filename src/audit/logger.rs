//! Background audit writer.
//!
//! Callers hand records to an [`AuditHandle`] without waiting. A single task
//! links each record to the previous one, retries failed writes with
//! exponential backoff and counts records it finally gives up on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AuditConfig;
use crate::error::{Error, Result};
use crate::trajectory::{TrajectoryEmitter, TrajectoryEvent, TrajectoryEventType};

use super::record::{line_hash, verify_chain, LogRecord, GENESIS_HASH};
use super::sink::{LogSink, SinkEntry};

enum Command {
    Record(Box<LogRecord>),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    missing: AtomicU64,
}

/// Write counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditStats {
    pub written: u64,
    /// Records dropped after every retry failed, or submitted after shutdown
    pub missing: u64,
}

/// Cheap, cloneable submit side of the audit logger.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
}

impl AuditHandle {
    /// Queue a record. Never blocks; `prev_hash` is filled in by the writer.
    pub fn submit(&self, record: LogRecord) {
        if self.tx.send(Command::Record(Box::new(record))).is_err() {
            self.counters.missing.fetch_add(1, Ordering::Relaxed);
            warn!("audit writer stopped, record counted as missing");
        }
    }

    /// Wait until every record submitted so far was written or given up on.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .map_err(|_| Error::AuditStorage("audit writer stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::AuditStorage("audit writer stopped".to_string()))
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            written: self.counters.written.load(Ordering::Relaxed),
            missing: self.counters.missing.load(Ordering::Relaxed),
        }
    }
}

/// Owns the writer task.
pub struct AuditLogger {
    handle: AuditHandle,
    task: JoinHandle<()>,
}

impl AuditLogger {
    /// Start a writer on `sink`, continuing any chain already stored there.
    pub async fn spawn(
        sink: Arc<dyn LogSink>,
        config: AuditConfig,
        emitter: Arc<dyn TrajectoryEmitter>,
    ) -> Result<Self> {
        let existing = sink.read_all().await?;
        let last_hash = existing
            .last()
            .map(|line| line_hash(line))
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let seq = existing.len() as u64;
        info!(records = seq, "audit writer started");

        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let writer = Writer {
            sink,
            config,
            emitter,
            counters: Arc::clone(&counters),
            last_hash,
            seq,
        };
        let task = tokio::spawn(writer.run(rx));
        Ok(Self {
            handle: AuditHandle { tx, counters },
            task,
        })
    }

    pub fn handle(&self) -> AuditHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> AuditStats {
        self.handle.stats()
    }

    /// Drain queued records and stop the writer.
    ///
    /// Handles cloned earlier keep the channel open, so the writer is
    /// stopped explicitly once the drain completes.
    pub async fn shutdown(self) -> Result<AuditStats> {
        self.handle.flush().await?;
        self.task.abort();
        let _ = self.task.await;
        let stats = self.handle.stats();
        info!(written = stats.written, missing = stats.missing, "audit writer stopped");
        Ok(stats)
    }
}

struct Writer {
    sink: Arc<dyn LogSink>,
    config: AuditConfig,
    emitter: Arc<dyn TrajectoryEmitter>,
    counters: Arc<Counters>,
    last_hash: String,
    seq: u64,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Record(record) => self.write(*record).await,
                Command::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn write(&mut self, mut record: LogRecord) {
        record.prev_hash = self.last_hash.clone();
        let line = match record.canonical_line() {
            Ok(line) => line,
            Err(e) => {
                self.give_up(&record.qid, &e);
                return;
            }
        };
        let entry = SinkEntry {
            seq: self.seq,
            qid: record.qid.clone(),
            prev_hash: record.prev_hash.clone(),
            record_hash: line_hash(&line),
            line,
        };

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff(&self.config, attempt);
                debug!(qid = %entry.qid, attempt, delay_ms = delay.as_millis() as u64, "retrying audit write");
                tokio::time::sleep(delay).await;
            }
            match self.sink.append(&entry).await {
                Ok(()) => {
                    self.last_hash = entry.record_hash;
                    self.seq += 1;
                    self.counters.written.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let error =
            last_error.unwrap_or_else(|| Error::AuditStorage("no write attempted".to_string()));
        self.give_up(&entry.qid, &error);
    }

    fn give_up(&self, qid: &str, error: &Error) {
        let missing = self.counters.missing.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(qid = %qid, error = %error, missing, "audit record dropped");
        self.emitter.emit(
            TrajectoryEvent::new(TrajectoryEventType::AuditDegraded, 0, error.to_string())
                .with_metadata("qid", qid.to_string())
                .with_metadata("missing", missing),
        );
    }
}

/// Delay before retry number `attempt` (from 1).
fn backoff(config: &AuditConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let ms = config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_max_ms);
    Duration::from_millis(ms)
}

/// Read a sink back and verify its chain. Returns the record count.
pub async fn load_and_verify(sink: &dyn LogSink) -> Result<usize> {
    let lines = sink.read_all().await?;
    verify_chain(&lines)?;
    Ok(lines.len())
}
