//! In-process worker pool for fanned-out units.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{CompletionLog, CompletionRecord, Dispatcher, Task};
use crate::errors::{CoordinationError, WorkError};
use crate::phase::Phase;
use crate::store::ContentStore;

/// Executes one work unit in-process.
#[async_trait]
pub trait UnitHandler: Send + Sync {
    async fn run_unit(&self, phase: Phase, payload: &[u8]) -> Result<Vec<u8>, WorkError>;
}

/// In-process worker pool bounded by a semaphore.
///
/// Each dispatched task runs on its own tokio task. The result is written to
/// the content store and a completion record appended to the log, exactly as
/// an external worker would.
pub struct LocalWorkerPool {
    handler: Arc<dyn UnitHandler>,
    store: ContentStore,
    log: CompletionLog,
    permits: Arc<Semaphore>,
}

impl LocalWorkerPool {
    pub fn new(
        handler: Arc<dyn UnitHandler>,
        store: ContentStore,
        log: CompletionLog,
        max_parallel: usize,
    ) -> Self {
        Self {
            handler,
            store,
            log,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }
}

#[async_trait]
impl Dispatcher for LocalWorkerPool {
    async fn dispatch(&self, task: &Task) -> Result<(), CoordinationError> {
        let handler = self.handler.clone();
        let store = self.store.clone();
        let log = self.log.clone();
        let permits = self.permits.clone();
        let task = task.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let record = run_task(handler, &store, &task).await;
            if let Err(e) = log.append(record).await {
                tracing::error!(task_id = %task.task_id, error = %e, "failed to append completion");
            }
        });
        Ok(())
    }
}

async fn run_task(handler: Arc<dyn UnitHandler>, store: &ContentStore, task: &Task) -> CompletionRecord {
    let payload = match store.get(&task.payload_ref) {
        Ok(payload) => payload,
        Err(e) => return CompletionRecord::failure(task.task_id, e.to_string(), false),
    };

    // Run on a nested task so a panicking handler still yields a completion.
    let phase = task.phase;
    let joined = tokio::spawn(async move { handler.run_unit(phase, &payload).await }).await;

    match joined {
        Ok(Ok(result)) => match store.put_artifact(&result, phase.output_type(), &task.dependencies) {
            Ok(meta) => CompletionRecord::success(task.task_id, &meta.content_hash),
            Err(e) => CompletionRecord::failure(task.task_id, e.to_string(), false),
        },
        Ok(Err(e)) => {
            tracing::debug!(task_id = %task.task_id, error = %e, "unit failed");
            CompletionRecord::failure(task.task_id, e.to_string(), e.is_transient())
        }
        Err(join_err) => CompletionRecord::failure(
            task.task_id,
            format!("worker panicked: {join_err}"),
            true,
        ),
    }
}
