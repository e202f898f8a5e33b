use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata sidecar for a stored artifact.
///
/// Written once, alongside the payload, by the first writer of a hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub content_hash: String,
    pub artifact_type: String,
    /// Size of the canonical payload in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub dependency_hashes: Vec<String>,
}

impl ArtifactMeta {
    pub fn new(content_hash: &str, artifact_type: &str, size: u64, deps: &[String]) -> Self {
        let mut dependency_hashes = deps.to_vec();
        dependency_hashes.sort();
        dependency_hashes.dedup();
        Self {
            content_hash: content_hash.to_string(),
            artifact_type: artifact_type.to_string(),
            size,
            created_at: Utc::now(),
            dependency_hashes,
        }
    }

    /// Whether `hash` is a declared dependency.
    pub fn depends_on(&self, hash: &str) -> bool {
        self.dependency_hashes.binary_search_by(|h| h.as_str().cmp(hash)).is_ok()
    }
}
