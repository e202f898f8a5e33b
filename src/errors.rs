//! Typed error hierarchy for the cairn orchestrator.
//!
//! One enum per subsystem:
//! - `StoreError`: content-addressable store failures
//! - `ManifestError`: provenance manifest and run persistence failures
//! - `CoordinationError`: fan-out / fan-in failures
//! - `WorkError`: failures reported by external collaborators
//! - `EngineError`: run-level failures surfaced to the caller
//!
//! `EngineError::kind` maps every failure onto the `FailureKind` recorded in
//! the run manifest.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::coordinator::TaskId;
use crate::manifest::RunStatus;
use crate::phase::Phase;
use crate::preflight::Violation;

/// Errors from the content-addressable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact {hash} not found in store")]
    NotFound { hash: String },

    #[error("Integrity error for {hash}: stored content hashes to {actual}")]
    Integrity { hash: String, actual: String },

    #[error("Invalid content hash '{0}'")]
    InvalidHash(String),

    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed artifact metadata at {path}: {source}")]
    Meta {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the provenance manifest and the run store.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest conflict: {hash} already recorded with different metadata ({detail})")]
    Conflict { hash: String, detail: String },

    #[error("Manifest for run {run_id} is finalized ({status})")]
    Finalized { run_id: Uuid, status: RunStatus },

    #[error("Run {run_id} is owned by another orchestrator")]
    Locked { run_id: Uuid },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: Uuid },

    #[error("Manifest I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the task coordinator.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Fan-in for phase {phase} timed out after {elapsed:?}; tasks never completed: {missing:?}")]
    Timeout {
        phase: Phase,
        elapsed: Duration,
        missing: Vec<TaskId>,
    },

    #[error("Failed to dispatch task {task_id}: {message}")]
    Dispatch { task_id: TaskId, message: String },

    #[error("Fan-in for phase {phase} aborted")]
    Aborted { phase: Phase },

    #[error("Completion log I/O error at {path}: {source}")]
    LogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Callback server failed: {0}")]
    Server(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by an external collaborator or worker.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkError {
    /// Worth retrying (worker crashed, resource temporarily unavailable).
    #[error("transient: {0}")]
    Transient(String),
    /// Will fail again on the same input.
    #[error("{0}")]
    Deterministic(String),
}

impl WorkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkError::Transient(_))
    }
}

/// A single failed task, as reported in its completion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub error: String,
    pub retryable: bool,
}

/// Run-level errors. Every variant ends the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid phase range: {from} comes after {to}")]
    InvalidRange { from: Phase, to: Phase },

    #[error("Preflight failed for phase {phase}: {}", join_violations(.violations))]
    Preflight {
        phase: Phase,
        violations: Vec<Violation>,
    },

    #[error("Phase {phase}: {} task(s) failed, first: {}", .failures.len(), first_failure(.failures))]
    WorkerFailure {
        phase: Phase,
        failures: Vec<TaskFailure>,
    },

    #[error("Phase {phase} failed after {attempts} attempt(s): {source}")]
    Collaborator {
        phase: Phase,
        attempts: u32,
        #[source]
        source: WorkError,
    },

    #[error("Cannot resume: prior run {prior_run} has source state {prior_marker}, current input is {current_marker}")]
    ResumeIncompatible {
        prior_run: Uuid,
        prior_marker: String,
        current_marker: String,
    },

    #[error("Cannot resume: no prior run found for experiment '{experiment}'")]
    NoPriorRun { experiment: String },

    #[error("Run {run_id} aborted during phase {phase}")]
    Aborted { run_id: Uuid, phase: Phase },

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Failure taxonomy as recorded in the run manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Integrity,
    NotFound,
    PreflightViolation,
    CoordinationTimeout,
    WorkerFailure,
    ManifestConflict,
    ResumeIncompatible,
    Aborted,
    Other,
}

impl EngineError {
    /// Classify this error for the manifest failure record.
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Preflight { .. } => FailureKind::PreflightViolation,
            EngineError::WorkerFailure { .. } | EngineError::Collaborator { .. } => {
                FailureKind::WorkerFailure
            }
            EngineError::ResumeIncompatible { .. } | EngineError::NoPriorRun { .. } => {
                FailureKind::ResumeIncompatible
            }
            EngineError::Aborted { .. } => FailureKind::Aborted,
            EngineError::Coordination(CoordinationError::Timeout { .. }) => {
                FailureKind::CoordinationTimeout
            }
            EngineError::Coordination(CoordinationError::Aborted { .. }) => FailureKind::Aborted,
            EngineError::Coordination(CoordinationError::Store(e)) | EngineError::Store(e) => {
                e.kind()
            }
            EngineError::Manifest(ManifestError::Conflict { .. }) => FailureKind::ManifestConflict,
            _ => FailureKind::Other,
        }
    }

    /// Preflight violations carried by this error, if any.
    pub fn violations(&self) -> &[Violation] {
        match self {
            EngineError::Preflight { violations, .. } => violations,
            _ => &[],
        }
    }

    /// Task ids that never completed, for coordination timeouts.
    pub fn missing_tasks(&self) -> &[TaskId] {
        match self {
            EngineError::Coordination(CoordinationError::Timeout { missing, .. }) => missing,
            _ => &[],
        }
    }
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::NotFound { .. } => FailureKind::NotFound,
            StoreError::Integrity { .. } => FailureKind::Integrity,
            _ => FailureKind::Other,
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn first_failure(failures: &[TaskFailure]) -> String {
    failures
        .first()
        .map(|f| format!("{} ({})", f.error, f.task_id))
        .unwrap_or_default()
}
