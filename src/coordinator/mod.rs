//! Fan-out of work units and fan-in of their completions.
//!
//! The coordinator stores each unit's payload in the content store, assigns
//! it a task id, and hands the resulting [`Task`] to a [`Dispatcher`]. Fan-in
//! reads the [`CompletionLog`] through a cursor registered before the first
//! dispatch, until every task id it dispatched has a record.
//!
//! Completion records may arrive in any order, more than once, or for task
//! ids from another fan-out sharing the log. A task counts as done once it
//! has a successful record; later records for it are ignored. A failure
//! stands only until a success for the same task arrives, so once every task
//! has some record fan-in waits a short settle window before reporting
//! failures. Failures are reported to the caller and never retried here.

mod callback;
mod local;
mod log;
mod spool;

pub use callback::CallbackServer;
pub use local::{LocalWorkerPool, UnitHandler};
pub use log::{CompletionCursor, CompletionLog, CompletionRecord, CompletionStatus};
pub use spool::{SpoolDispatcher, SpoolTask};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::{CoordinationError, TaskFailure};
use crate::phase::Phase;
use crate::store::ContentStore;

pub type TaskId = Uuid;

/// Artifact type under which unit payloads are stored.
pub const WORK_UNIT: &str = "work_unit";

/// How long fan-in waits for a late success once every task has a record.
pub const FAILURE_SETTLE: Duration = Duration::from_millis(200);

/// A dispatched unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub phase: Phase,
    /// Content hash of the unit payload
    pub payload_ref: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub dispatch_time: DateTime<Utc>,
}

/// Input for one task, as planned by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub payload: Vec<u8>,
    /// Artifact hashes the unit's result will depend on
    pub dependencies: Vec<String>,
}

impl WorkUnit {
    pub fn new(payload: impl Into<Vec<u8>>, dependencies: Vec<String>) -> Self {
        Self {
            payload: payload.into(),
            dependencies,
        }
    }
}

/// Delivers tasks to workers. Completions come back through the log.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, task: &Task) -> Result<(), CoordinationError>;
}

/// A unit that completed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitResult {
    /// Position of the unit in the fan-out input
    pub index: usize,
    pub task_id: TaskId,
    pub result_hash: String,
}

/// A unit whose worker reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUnit {
    pub index: usize,
    pub failure: TaskFailure,
}

/// Result of one fan-out/fan-in round.
#[derive(Debug, Clone, Default)]
pub struct FanInOutcome {
    pub tasks: Vec<Task>,
    /// Successful units, in input order
    pub succeeded: Vec<UnitResult>,
    /// Failed units, in input order
    pub failed: Vec<FailedUnit>,
}

impl FanInOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Whether every failure is marked retryable.
    pub fn all_retryable(&self) -> bool {
        self.failed.iter().all(|f| f.failure.retryable)
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failed.iter().map(|f| f.failure.clone()).collect()
    }
}

/// Requests cancellation of a run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes an [`AbortHandle`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort is requested; never resolves otherwise.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fans work units out to a dispatcher and waits for all completions.
pub struct TaskCoordinator {
    store: ContentStore,
    log: CompletionLog,
    dispatcher: Arc<dyn Dispatcher>,
    settle: Duration,
}

impl TaskCoordinator {
    pub fn new(store: ContentStore, log: CompletionLog, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            store,
            log,
            dispatcher,
            settle: FAILURE_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn log(&self) -> &CompletionLog {
        &self.log
    }

    /// Dispatch `units` and block until each has a successful completion,
    /// every unit has a record and the settle window has passed, the timeout
    /// elapses, or abort is requested.
    pub async fn fan_out(
        &self,
        phase: Phase,
        units: &[WorkUnit],
        timeout: Duration,
        abort: &AbortSignal,
    ) -> Result<FanInOutcome, CoordinationError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut abort = abort.clone();
        if abort.is_aborted() {
            return Err(CoordinationError::Aborted { phase });
        }

        // Registered before any dispatch so no completion can be missed.
        let mut cursor = self.log.subscribe();

        let mut tasks = Vec::with_capacity(units.len());
        for unit in units {
            let payload_ref = self
                .store
                .put_artifact(&unit.payload, WORK_UNIT, &unit.dependencies)?
                .content_hash;
            tasks.push(Task {
                task_id: Uuid::new_v4(),
                phase,
                payload_ref,
                dependencies: unit.dependencies.clone(),
                dispatch_time: Utc::now(),
            });
        }
        let index_of: HashMap<TaskId, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.task_id, i))
            .collect();

        for task in &tasks {
            self.dispatcher.dispatch(task).await?;
        }
        tracing::info!(%phase, tasks = tasks.len(), "fan-out dispatched");

        let mut completions: HashMap<TaskId, CompletionRecord> = HashMap::new();
        let mut settle_until: Option<Instant> = None;
        loop {
            for record in cursor.read_new().await {
                if !index_of.contains_key(&record.task_id) {
                    tracing::trace!(task_id = %record.task_id, "ignoring completion for unknown task");
                    continue;
                }
                self.log.ack(record.task_id).await;
                let superseded = completions
                    .get(&record.task_id)
                    .is_some_and(|kept| is_done(kept) || !is_done(&record));
                if superseded {
                    tracing::debug!(task_id = %record.task_id, "duplicate completion ignored");
                    continue;
                }
                completions.insert(record.task_id, record);
            }
            if completions.values().filter(|r| is_done(r)).count() == tasks.len() {
                break;
            }

            let settling = completions.len() == tasks.len();
            let until = if settling {
                *settle_until.get_or_insert_with(|| (Instant::now() + self.settle).min(deadline))
            } else {
                deadline
            };
            tokio::select! {
                woke = tokio::time::timeout_at(until, cursor.changed()) => {
                    if woke.is_err() {
                        if settling {
                            break;
                        }
                        let missing: Vec<TaskId> = tasks
                            .iter()
                            .map(|t| t.task_id)
                            .filter(|id| !completions.contains_key(id))
                            .collect();
                        tracing::warn!(%phase, missing = missing.len(), "fan-in timed out");
                        return Err(CoordinationError::Timeout {
                            phase,
                            elapsed: started.elapsed(),
                            missing,
                        });
                    }
                }
                _ = abort.aborted() => {
                    tracing::warn!(%phase, "fan-in aborted");
                    return Err(CoordinationError::Aborted { phase });
                }
            }
        }

        let mut outcome = FanInOutcome::default();
        for task in &tasks {
            let index = index_of[&task.task_id];
            let Some(record) = completions.remove(&task.task_id) else {
                continue;
            };
            match (record.status, record.result_hash) {
                (CompletionStatus::Success, Some(result_hash)) => {
                    self.store.verify(&result_hash)?;
                    outcome.succeeded.push(UnitResult {
                        index,
                        task_id: task.task_id,
                        result_hash,
                    });
                }
                (CompletionStatus::Success, None) => outcome.failed.push(FailedUnit {
                    index,
                    failure: TaskFailure {
                        task_id: task.task_id,
                        error: "success reported without a result hash".to_string(),
                        retryable: false,
                    },
                }),
                (CompletionStatus::Failure, _) => outcome.failed.push(FailedUnit {
                    index,
                    failure: TaskFailure {
                        task_id: task.task_id,
                        error: record.error.unwrap_or_else(|| "unknown error".to_string()),
                        retryable: record.retryable,
                    },
                }),
            }
        }
        outcome.tasks = tasks;
        tracing::info!(
            %phase,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "fan-in complete"
        );
        Ok(outcome)
    }
}

/// A record that settles its task for good.
fn is_done(record: &CompletionRecord) -> bool {
    record.is_success() && record.result_hash.is_some()
}
