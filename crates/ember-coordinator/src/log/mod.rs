//! Durable decision log.
//!
//! Both sides of the protocol keep one. The coordinator logs the
//! participant set when a prepare phase starts and the decision before
//! phase two begins; the decision append is its point of no return. A
//! participant logs that it prepared (it is now bound by the eventual
//! decision) and the decision it applied.
//!
//! [`FileDecisionLog`] appends records as JSON lines and syncs before
//! returning, so an append that returned is on disk. While appends fail
//! the owning coordinator cannot finalize commits; the error is
//! surfaced, never swallowed.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use ember_common::types::{DistTxnId, ParticipantId, TxnId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The outcome of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// All participants voted yes; every local transaction commits.
    Commit,
    /// At least one no vote or timeout; every local transaction aborts.
    Abort,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Commit => write!(f, "commit"),
            Decision::Abort => write!(f, "abort"),
        }
    }
}

/// A record in the decision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Coordinator side: the participant set, written before the first
    /// `Prepare` message leaves.
    Begun {
        /// The distributed transaction.
        dist_txn: DistTxnId,
        /// Each participant and its local transaction.
        participants: Vec<(ParticipantId, TxnId)>,
    },
    /// Participant side: the local transaction is prepared and holding
    /// locks until the decision arrives.
    Prepared {
        /// The distributed transaction.
        dist_txn: DistTxnId,
        /// The prepared local transaction.
        txn_id: TxnId,
    },
    /// The commit or abort decision.
    Decision {
        /// The distributed transaction.
        dist_txn: DistTxnId,
        /// The outcome.
        decision: Decision,
    },
    /// Coordinator side: every participant acked the decision; nothing
    /// remains to retry.
    Forgotten {
        /// The distributed transaction.
        dist_txn: DistTxnId,
    },
}

impl LogRecord {
    /// Returns the distributed transaction this record concerns.
    pub fn dist_txn(&self) -> DistTxnId {
        match *self {
            LogRecord::Begun { dist_txn, .. }
            | LogRecord::Prepared { dist_txn, .. }
            | LogRecord::Decision { dist_txn, .. }
            | LogRecord::Forgotten { dist_txn } => dist_txn,
        }
    }
}

/// Errors from decision log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// The underlying file could not be written or read.
    #[error("decision log i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A stored record failed to parse.
    #[error("decision log corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Append-only durable record store.
pub trait DecisionLog: Send + Sync {
    /// Appends a record. Returns only once the record is durable.
    fn append(&self, record: &LogRecord) -> Result<(), LogError>;

    /// Reads every record in append order.
    fn read_all(&self) -> Result<Vec<LogRecord>, LogError>;
}

/// In-memory log for tests; durable only for the process lifetime.
#[derive(Debug, Default)]
pub struct MemoryDecisionLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryDecisionLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecisionLog for MemoryDecisionLog {
    fn append(&self, record: &LogRecord) -> Result<(), LogError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>, LogError> {
        Ok(self.records.lock().clone())
    }
}

/// File-backed log: one JSON record per line, fsynced per append.
#[derive(Debug)]
pub struct FileDecisionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDecisionLog {
    /// Opens (creating if needed) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecisionLog for FileDecisionLog {
    fn append(&self, record: &LogRecord) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>, LogError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
