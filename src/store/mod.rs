//! Content-addressable artifact store.
//!
//! Payloads are canonicalized (see [`crate::hashing`]), hashed with SHA-256
//! and written once under `<root>/<hh>/<hash>`, where `hh` is the first two
//! hex characters of the hash. A JSON metadata sidecar lives next to each
//! payload as `<hash>.meta.json`.
//!
//! The store is append-only. Writes go to a temporary file and are renamed
//! into place, so concurrent writers of the same hash race harmlessly and
//! readers never observe a partial payload. Every read re-hashes the stored
//! bytes, turning on-disk corruption into [`StoreError::Integrity`].

mod artifact;

pub use artifact::ArtifactMeta;

use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::StoreError;
use crate::hashing::{canonical_json, canonicalize, is_valid_hash, sha256_hex};

const META_SUFFIX: &str = ".meta.json";
const TMP_DIR: &str = "tmp";

/// Filesystem-backed content-addressable store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let tmp = root.join(TMP_DIR);
        fs::create_dir_all(&tmp).map_err(|source| StoreError::Io { path: tmp, source })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the payload file for `hash`.
    pub fn object_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_hash(hash) {
            return Err(StoreError::InvalidHash(hash.to_string()));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }

    fn meta_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.object_path(hash)?;
        path.set_file_name(format!("{hash}{META_SUFFIX}"));
        Ok(path)
    }

    /// Store a payload and return its content hash. Idempotent.
    pub fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let canonical = canonicalize(bytes);
        let hash = sha256_hex(&canonical);
        let path = self.object_path(&hash)?;

        if path.exists() {
            let existing = read_file(&path)?;
            if existing != canonical {
                // Never overwrite: either the stored copy is corrupt or two
                // different payloads collided.
                return Err(StoreError::Integrity {
                    actual: sha256_hex(&existing),
                    hash,
                });
            }
            tracing::trace!(%hash, "put: already present");
            return Ok(hash);
        }

        self.write_atomic(&path, &canonical)?;
        tracing::debug!(%hash, size = canonical.len(), "put: stored new artifact");
        Ok(hash)
    }

    /// Store a JSON value.
    pub fn put_json(&self, value: &Value) -> Result<String, StoreError> {
        self.put(canonical_json(value).as_bytes())
    }

    /// Store a payload together with its metadata sidecar.
    ///
    /// The sidecar is written by the first writer only; later writers of the
    /// same content get the existing metadata back.
    pub fn put_artifact(
        &self,
        bytes: &[u8],
        artifact_type: &str,
        dependencies: &[String],
    ) -> Result<ArtifactMeta, StoreError> {
        let hash = self.put(bytes)?;
        if let Some(existing) = self.meta(&hash)? {
            return Ok(existing);
        }
        let size = fs::metadata(self.object_path(&hash)?)
            .map(|m| m.len())
            .map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;
        let meta = ArtifactMeta::new(&hash, artifact_type, size, dependencies);
        let path = self.meta_path(&hash)?;
        let json = serde_json::to_vec_pretty(&meta).map_err(|source| StoreError::Meta {
            path: path.clone(),
            source,
        })?;
        self.write_atomic(&path, &json)?;
        Ok(meta)
    }

    /// Read a payload, verifying its hash.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(hash)?;
        if !path.exists() {
            return Err(StoreError::NotFound {
                hash: hash.to_string(),
            });
        }
        let bytes = read_file(&path)?;
        let actual = sha256_hex(&bytes);
        if actual != hash {
            return Err(StoreError::Integrity {
                hash: hash.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    /// Read and parse a JSON payload.
    pub fn get_json(&self, hash: &str) -> Result<Value, StoreError> {
        let bytes = self.get(hash)?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Meta {
            path: self.object_path(hash).unwrap_or_default(),
            source,
        })
    }

    /// Metadata sidecar for `hash`, if one was written.
    pub fn meta(&self, hash: &str) -> Result<Option<ArtifactMeta>, StoreError> {
        let path = self.meta_path(hash)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = read_file(&path)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Meta { path, source })
    }

    /// Whether a payload file exists for `hash` (no integrity check).
    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).map(|p| p.exists()).unwrap_or(false)
    }

    /// Re-hash the stored payload.
    pub fn verify(&self, hash: &str) -> Result<(), StoreError> {
        self.get(hash).map(|_| ())
    }

    /// Whether `hash` and all `required` hashes are present and intact, and
    /// each required hash is a declared dependency of `hash`.
    ///
    /// Missing or corrupt artifacts yield `Ok(false)`; only I/O failures are
    /// errors.
    pub fn has_dependencies(&self, hash: &str, required: &[String]) -> Result<bool, StoreError> {
        if !self.is_intact(hash)? {
            return Ok(false);
        }
        let declared = self
            .meta(hash)?
            .map(|m| m.dependency_hashes)
            .unwrap_or_default();
        for dep in required {
            if !declared.contains(dep) || !self.is_intact(dep)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_intact(&self, hash: &str) -> Result<bool, StoreError> {
        match self.verify(hash) {
            Ok(()) => Ok(true),
            Err(
                StoreError::NotFound { .. }
                | StoreError::Integrity { .. }
                | StoreError::InvalidHash(_),
            ) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All stored content hashes, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut hashes = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.root.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && is_valid_hash(name)
            {
                hashes.push(name.to_string());
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = self.root.join(TMP_DIR).join(Uuid::new_v4().to_string());
        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        written.map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, StoreError> {
    fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
