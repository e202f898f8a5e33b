//! Queue-directory dispatch for external worker processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{Dispatcher, Task};
use crate::errors::CoordinationError;
use crate::store::ContentStore;

/// Task file handed to an external worker process.
///
/// The worker reads the payload from `payload_path`, writes its result into
/// the store at `store_root` (`<hh>/<hash>`), and posts a completion record
/// to `callback_url` (or appends one to the run's `completions.jsonl`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolTask {
    #[serde(flatten)]
    pub task: Task,
    pub payload_path: PathBuf,
    pub store_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Writes one JSON file per task into a queue directory.
pub struct SpoolDispatcher {
    queue_dir: PathBuf,
    store: ContentStore,
    callback_url: Option<String>,
}

impl SpoolDispatcher {
    pub fn new(queue_dir: impl Into<PathBuf>, store: ContentStore, callback_url: Option<String>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            store,
            callback_url,
        }
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }
}

#[async_trait]
impl Dispatcher for SpoolDispatcher {
    async fn dispatch(&self, task: &Task) -> Result<(), CoordinationError> {
        let dispatch_err = |message: String| CoordinationError::Dispatch {
            task_id: task.task_id,
            message,
        };
        let spooled = SpoolTask {
            task: task.clone(),
            payload_path: self.store.object_path(&task.payload_ref)?,
            store_root: self.store.root().to_path_buf(),
            callback_url: self.callback_url.clone(),
        };
        let json = serde_json::to_vec_pretty(&spooled).map_err(|e| dispatch_err(e.to_string()))?;

        tokio::fs::create_dir_all(&self.queue_dir)
            .await
            .map_err(|e| dispatch_err(format!("{}: {e}", self.queue_dir.display())))?;
        let tmp = self.queue_dir.join(format!(".{}.tmp", task.task_id));
        let path = self.queue_dir.join(format!("{}.json", task.task_id));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| dispatch_err(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| dispatch_err(format!("{}: {e}", path.display())))?;

        tracing::debug!(task_id = %task.task_id, path = %path.display(), "task spooled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_spool_writes_task_file() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path().join("store")).unwrap();
        let payload_ref = store.put(b"unit payload").unwrap();
        let dispatcher = SpoolDispatcher::new(
            dir.path().join("queue"),
            store.clone(),
            Some("http://127.0.0.1:9".into()),
        );
        let task = Task {
            task_id: Uuid::new_v4(),
            phase: Phase::Analysis,
            payload_ref: payload_ref.clone(),
            dependencies: vec![],
            dispatch_time: Utc::now(),
        };
        dispatcher.dispatch(&task).await.unwrap();

        let path = dispatcher.queue_dir().join(format!("{}.json", task.task_id));
        let spooled: SpoolTask = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(spooled.task, task);
        assert_eq!(std::fs::read(&spooled.payload_path).unwrap(), b"unit payload");
        assert_eq!(spooled.callback_url.as_deref(), Some("http://127.0.0.1:9"));

        let leftovers: Vec<_> = std::fs::read_dir(dispatcher.queue_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
