//! Replayable completion log.
//!
//! Workers append one [`CompletionRecord`] per task. Readers never consume
//! records: each holds a [`CompletionCursor`] starting at the logical
//! beginning of the log, so a completion written before a reader first looks
//! is still observed. New appends bump a `watch` version counter that wakes
//! waiting cursors.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

use super::TaskId;
use crate::errors::CoordinationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Failure,
}

/// Written once per task by the worker that ran it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub task_id: TaskId,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl CompletionRecord {
    pub fn success(task_id: TaskId, result_hash: &str) -> Self {
        Self {
            task_id,
            status: CompletionStatus::Success,
            result_hash: Some(result_hash.to_string()),
            error: None,
            retryable: false,
        }
    }

    pub fn failure(task_id: TaskId, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            task_id,
            status: CompletionStatus::Failure,
            result_hash: None,
            error: Some(error.into()),
            retryable,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<CompletionRecord>,
    acked: HashSet<TaskId>,
}

#[derive(Debug)]
struct LogInner {
    state: RwLock<LogState>,
    version: watch::Sender<u64>,
    path: Option<PathBuf>,
}

/// Shared handle to a completion log. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CompletionLog {
    inner: Arc<LogInner>,
}

impl CompletionLog {
    fn with_records(records: Vec<CompletionRecord>, path: Option<PathBuf>) -> Self {
        let (version, _) = watch::channel(records.len() as u64);
        Self {
            inner: Arc::new(LogInner {
                state: RwLock::new(LogState {
                    records,
                    acked: HashSet::new(),
                }),
                version,
                path,
            }),
        }
    }

    /// A log that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_records(Vec::new(), None)
    }

    /// Open a JSONL-backed log, replaying existing records.
    ///
    /// Malformed lines (a torn final write, say) are skipped with a warning.
    /// A torn tail is terminated so later appends start on a fresh line.
    pub fn open(path: &Path) -> Result<Self, CoordinationError> {
        let mut records = Vec::new();
        if path.exists() {
            let io_err = |source: std::io::Error| CoordinationError::LogIo {
                path: path.to_path_buf(),
                source,
            };
            let content = fs::read_to_string(path).map_err(io_err)?;
            if !content.is_empty() && !content.ends_with('\n') {
                tracing::warn!(path = %path.display(), "completion log ends mid-record");
                OpenOptions::new()
                    .append(true)
                    .open(path)
                    .and_then(|mut file| file.write_all(b"\n"))
                    .map_err(io_err)?;
            }
            for (n, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CompletionRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        line = n + 1,
                        error = %e,
                        "skipping malformed completion record"
                    ),
                }
            }
        }
        Ok(Self::with_records(records, Some(path.to_path_buf())))
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Append a record and wake every waiting cursor.
    pub async fn append(&self, record: CompletionRecord) -> Result<(), CoordinationError> {
        let mut state = self.inner.state.write().await;
        if let Some(path) = &self.inner.path {
            let line = serde_json::to_string(&record).map_err(|e| CoordinationError::LogIo {
                path: path.clone(),
                source: e.into(),
            })?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{line}"))
                .map_err(|source| CoordinationError::LogIo {
                    path: path.clone(),
                    source,
                })?;
        }
        tracing::trace!(task_id = %record.task_id, status = ?record.status, "completion appended");
        state.records.push(record);
        let len = state.records.len() as u64;
        drop(state);
        self.inner.version.send_replace(len);
        Ok(())
    }

    /// A cursor positioned at the beginning of the log.
    pub fn subscribe(&self) -> CompletionCursor {
        CompletionCursor {
            log: self.clone(),
            offset: 0,
            version: self.inner.version.subscribe(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn records(&self) -> Vec<CompletionRecord> {
        self.inner.state.read().await.records.clone()
    }

    /// Mark a task's completion as observed.
    pub async fn ack(&self, task_id: TaskId) {
        self.inner.state.write().await.acked.insert(task_id);
    }

    pub async fn is_acked(&self, task_id: TaskId) -> bool {
        self.inner.state.read().await.acked.contains(&task_id)
    }

    /// Task ids with a record that nobody has acknowledged yet, in log order.
    pub async fn unacknowledged(&self) -> Vec<TaskId> {
        let state = self.inner.state.read().await;
        let mut seen = HashSet::new();
        state
            .records
            .iter()
            .map(|r| r.task_id)
            .filter(|id| !state.acked.contains(id) && seen.insert(*id))
            .collect()
    }
}

/// A reader's position in the completion log.
#[derive(Debug)]
pub struct CompletionCursor {
    log: CompletionLog,
    offset: usize,
    version: watch::Receiver<u64>,
}

impl CompletionCursor {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Records appended since the last read (everything, on the first read).
    pub async fn read_new(&mut self) -> Vec<CompletionRecord> {
        // Mark the version seen before reading so an append racing with this
        // read still wakes the next `changed`.
        self.version.borrow_and_update();
        let state = self.log.inner.state.read().await;
        let new = state.records[self.offset.min(state.records.len())..].to_vec();
        self.offset = state.records.len();
        new
    }

    /// Wait until the log has grown past what this cursor has seen.
    pub async fn changed(&mut self) {
        if self.version.changed().await.is_err() {
            // The sender lives as long as the log, which this cursor holds.
            std::future::pending::<()>().await;
        }
    }
}
