//! Experiment definitions: the input specification set of a run.
//!
//! An experiment directory holds `experiment.toml` and the input documents:
//!
//! ```toml
//! name = "pilot"
//! batch_size = 2
//! documents = ["documents/a.txt", "documents/b.txt"]
//!
//! [params]
//! model = "baseline"
//! ```
//!
//! When `documents` is omitted every file under `documents/` is used.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use walkdir::WalkDir;

use crate::hashing::{content_hash, hash_value};

pub const EXPERIMENT_FILE: &str = "experiment.toml";
const DOCUMENTS_DIR: &str = "documents";

#[derive(Debug, Deserialize)]
struct ExperimentFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default)]
    documents: Vec<String>,
    #[serde(default)]
    params: toml::Table,
}

fn default_batch_size() -> usize {
    1
}

/// One input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Path relative to the experiment directory
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    /// Documents per analysis work unit
    pub batch_size: usize,
    pub params: Value,
    /// Sorted by name
    pub documents: Vec<Document>,
}

impl Experiment {
    pub fn from_parts(name: &str, params: Value, batch_size: usize, mut documents: Vec<Document>) -> Self {
        documents.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            name: name.to_string(),
            batch_size: batch_size.max(1),
            params,
            documents,
        }
    }

    /// Load an experiment directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(EXPERIMENT_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: ExperimentFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let name = match file.name {
            Some(name) => name,
            None => dir
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "experiment".to_string()),
        };

        let relative: Vec<String> = if file.documents.is_empty() {
            discover_documents(dir)?
        } else {
            file.documents
        };
        if relative.is_empty() {
            bail!("Experiment '{}' has no documents", name);
        }

        let mut documents = Vec::with_capacity(relative.len());
        for rel in relative {
            let doc_path = dir.join(&rel);
            let bytes = std::fs::read(&doc_path)
                .with_context(|| format!("Failed to read document {}", doc_path.display()))?;
            documents.push(Document::new(rel, bytes));
        }

        let params = serde_json::to_value(&file.params).context("Invalid experiment params")?;
        Ok(Self::from_parts(&name, params, file.batch_size, documents))
    }

    /// Hash of the effective input specification set.
    ///
    /// Covers the name, parameters, batch size and every document's content
    /// hash, so any change to what the pipeline would consume changes it.
    pub fn source_state_marker(&self) -> String {
        let documents: Vec<Value> = self
            .documents
            .iter()
            .map(|d| json!({ "name": d.name, "hash": content_hash(&d.bytes) }))
            .collect();
        hash_value(&json!({
            "name": self.name,
            "params": self.params,
            "batch_size": self.batch_size,
            "documents": documents,
        }))
    }

    /// Description passed to collaborators alongside phase inputs.
    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "params": self.params,
            "batch_size": self.batch_size,
            "documents": self.documents.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        })
    }
}

fn discover_documents(dir: &Path) -> Result<Vec<String>> {
    let docs_dir = dir.join(DOCUMENTS_DIR);
    if !docs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in WalkDir::new(&docs_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to scan {}", docs_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        names.push(rel);
    }
    Ok(names)
}
