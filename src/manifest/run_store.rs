use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::RunManifest;
use crate::errors::ManifestError;

const MANIFEST_FILE: &str = "manifest.json";
const LOCK_FILE: &str = "lock";

/// Exclusive ownership of a run directory.
///
/// Held for the lifetime of an engine run; the OS releases the lock when the
/// file handle is dropped, including on crash.
#[derive(Debug)]
pub struct RunLock {
    run_id: Uuid,
    _file: File,
}

impl RunLock {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

/// Persists run manifests under `<runs_dir>/<run_id>/manifest.json`.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }

    pub fn manifest_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join(MANIFEST_FILE)
    }

    /// Create the run directory and take its lock.
    ///
    /// Fails with [`ManifestError::Locked`] when another process owns the run.
    pub fn lock(&self, run_id: Uuid) -> Result<RunLock, ManifestError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(dir.join("logs")).map_err(|source| ManifestError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| ManifestError::Io {
                path: path.clone(),
                source,
            })?;
        file.try_lock_exclusive()
            .map_err(|_| ManifestError::Locked { run_id })?;
        Ok(RunLock { run_id, _file: file })
    }

    /// Write the manifest atomically (temp file + rename).
    pub fn save(&self, manifest: &RunManifest) -> Result<PathBuf, ManifestError> {
        let path = self.manifest_path(manifest.run_id);
        let dir = self.run_dir(manifest.run_id);
        fs::create_dir_all(&dir).map_err(|source| ManifestError::Io {
            path: dir.clone(),
            source,
        })?;
        let json = serde_json::to_vec_pretty(manifest).map_err(|source| ManifestError::Serde {
            path: path.clone(),
            source,
        })?;
        let tmp = dir.join(format!(".{MANIFEST_FILE}.tmp"));
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        written.map_err(|source| ManifestError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load(&self, run_id: Uuid) -> Result<RunManifest, ManifestError> {
        let path = self.manifest_path(run_id);
        if !path.exists() {
            return Err(ManifestError::RunNotFound { run_id });
        }
        load_manifest(&path)
    }

    /// All readable manifests, most recent first. Unreadable ones are skipped.
    pub fn list(&self) -> Result<Vec<RunManifest>, ManifestError> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.runs_dir).map_err(|source| ManifestError::Io {
            path: self.runs_dir.clone(),
            source,
        })?;

        let mut runs = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path().join(MANIFEST_FILE);
            if !path.exists() {
                continue;
            }
            match load_manifest(&path) {
                Ok(manifest) => runs.push(manifest),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable manifest"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Runs of one experiment, most recent first.
    pub fn list_for(&self, experiment: &str) -> Result<Vec<RunManifest>, ManifestError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.experiment == experiment)
            .collect())
    }

    /// Resolve a full run id or a unique prefix of one.
    pub fn resolve(&self, reference: &str) -> Result<RunManifest, ManifestError> {
        if let Ok(run_id) = Uuid::parse_str(reference) {
            return self.load(run_id);
        }
        let mut matches: Vec<RunManifest> = self
            .list()?
            .into_iter()
            .filter(|m| m.run_id.to_string().starts_with(reference))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            _ => Err(ManifestError::RunNotFound {
                run_id: Uuid::nil(),
            }),
        }
    }
}

fn load_manifest(path: &Path) -> Result<RunManifest, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ManifestError::Serde {
        path: path.to_path_buf(),
        source,
    })
}
