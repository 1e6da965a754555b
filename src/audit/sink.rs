//! Append-only storage for audit lines.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::error::{Error, Result};

/// One line ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEntry {
    /// Position in the chain, from 0
    pub seq: u64,
    pub qid: String,
    pub prev_hash: String,
    pub record_hash: String,
    /// Canonical JSON of the record
    pub line: String,
}

/// Append-only log storage.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: &SinkEntry) -> Result<()>;

    /// Every stored line, oldest first.
    async fn read_all(&self) -> Result<Vec<String>>;
}

/// In-process sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn append(&self, entry: &SinkEntry) -> Result<()> {
        self.lines
            .lock()
            .map_err(|e| Error::AuditStorage(format!("memory sink poisoned: {}", e)))?
            .push(entry.line.clone());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<String>> {
        Ok(self.lines())
    }
}

/// One JSON record per line in an append-only file.
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for JsonlFileSink {
    /// Appends one line. A torn last line left by an earlier failed or
    /// interrupted write is cut off first, and a failed write is rolled back,
    /// so the file only ever holds whole lines.
    async fn append(&self, entry: &SinkEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let storage_err =
            |e: std::io::Error| Error::AuditStorage(format!("{}: {}", self.path.display(), e));

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(storage_err)?;
        let len = file.metadata().await.map_err(storage_err)?.len();
        let base = complete_prefix_len(&mut file, len).await.map_err(storage_err)?;
        if base < len {
            warn!(
                path = %self.path.display(),
                dropped_bytes = len - base,
                "truncating torn audit line"
            );
            file.set_len(base).await.map_err(storage_err)?;
        }

        let mut bytes = entry.line.clone().into_bytes();
        bytes.push(b'\n');
        let written = match file.write_all(&bytes).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(base).await {
                warn!(error = %rollback, "audit rollback failed");
            }
            return Err(storage_err(e));
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(raw
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::AuditStorage(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Length of the file up to and including its last newline.
async fn complete_prefix_len(file: &mut tokio::fs::File, len: u64) -> std::io::Result<u64> {
    const CHUNK: u64 = 4096;
    let mut buf = vec![0u8; CHUNK as usize];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf[..n]).await?;
        if let Some(pos) = buf[..n].iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSink;

#[cfg(feature = "sqlite")]
mod sqlite {
    use async_trait::async_trait;
    use rusqlite::{params, Connection};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::{LogSink, SinkEntry};
    use crate::error::{Error, Result};

    /// SQLite-backed sink with table
    /// `audit_log(seq, qid, prev_hash, record_hash, body)`.
    pub struct SqliteSink {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteSink {
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let conn = Connection::open(path).map_err(|e| Error::AuditStorage(e.to_string()))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| Error::AuditStorage(e.to_string()))?;
            initialize_schema(&conn).map_err(|e| Error::AuditStorage(e.to_string()))?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        /// In-memory database (for testing).
        pub fn in_memory() -> Result<Self> {
            let conn =
                Connection::open_in_memory().map_err(|e| Error::AuditStorage(e.to_string()))?;
            initialize_schema(&conn).map_err(|e| Error::AuditStorage(e.to_string()))?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        fn with_conn<F, T>(&self, f: F) -> Result<T>
        where
            F: FnOnce(&Connection) -> rusqlite::Result<T>,
        {
            let conn = self
                .conn
                .lock()
                .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
            f(&conn).map_err(|e| Error::AuditStorage(e.to_string()))
        }

        /// Stored hash of the record at `seq`.
        pub fn record_hash(&self, seq: u64) -> Result<Option<String>> {
            self.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT record_hash FROM audit_log WHERE seq = ?1")?;
                let mut rows = stmt.query(params![seq as i64])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
        }
    }

    fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY,
                qid TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                record_hash TEXT NOT NULL,
                body TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_qid ON audit_log(qid)",
            [],
        )?;
        Ok(())
    }

    #[async_trait]
    impl LogSink for SqliteSink {
        async fn append(&self, entry: &SinkEntry) -> Result<()> {
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO audit_log (seq, qid, prev_hash, record_hash, body)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        entry.seq as i64,
                        entry.qid,
                        entry.prev_hash,
                        entry.record_hash,
                        entry.line
                    ],
                )
                .map(|_| ())
            })
        }

        async fn read_all(&self) -> Result<Vec<String>> {
            self.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT body FROM audit_log ORDER BY seq ASC")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect()
            })
        }
    }
}
