//! Provenance manifest for a single run.
//!
//! A `RunManifest` is created when a run starts, appended to after every
//! artifact write, and finalized when the run reaches a terminal state. It is
//! append-only: `record_*` calls are idempotent for identical metadata and
//! fail with [`ManifestError::Conflict`] when the same key is recorded twice
//! with different metadata. After [`RunManifest::finalize`] every mutator
//! fails with [`ManifestError::Finalized`].

mod run_store;

pub use run_store::{RunLock, RunStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::coordinator::TaskId;
use crate::errors::{FailureKind, ManifestError};
use crate::hashing::hash_value;
use crate::phase::{Phase, PhaseState};
use crate::preflight::Violation;
use crate::shape::ShapeSignature;

/// Override recorded when synthesis may proceed without evidence.
pub const NO_EVIDENCE_OVERRIDE: &str = "no_evidence";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One artifact produced during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub hash: String,
    pub artifact_type: String,
    pub shape_signature: ShapeSignature,
    /// Sorted, deduplicated
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub phase: Phase,
}

impl ArtifactRecord {
    pub fn new(
        hash: &str,
        artifact_type: &str,
        shape_signature: ShapeSignature,
        dependencies: &[String],
        phase: Phase,
    ) -> Self {
        let mut dependencies = dependencies.to_vec();
        dependencies.sort();
        dependencies.dedup();
        Self {
            hash: hash.to_string(),
            artifact_type: artifact_type.to_string(),
            shape_signature,
            dependencies,
            phase,
        }
    }

    fn diff(&self, other: &ArtifactRecord) -> Option<String> {
        if self.artifact_type != other.artifact_type {
            return Some(format!(
                "artifact_type {} != {}",
                self.artifact_type, other.artifact_type
            ));
        }
        if self.shape_signature != other.shape_signature {
            return Some("shape_signature differs".to_string());
        }
        if self.dependencies != other.dependencies {
            return Some("dependencies differ".to_string());
        }
        if self.phase != other.phase {
            return Some(format!("phase {} != {}", self.phase, other.phase));
        }
        None
    }
}

/// An experiment input stored in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub name: String,
    pub hash: String,
}

/// Result of the sample-query health check on a retrieval index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHealth {
    pub sample_hits: usize,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexHealth {
    pub fn from_hits(sample_hits: usize) -> Self {
        Self {
            sample_hits,
            passed: sample_hits > 0,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            sample_hits: 0,
            passed: false,
            error: Some(error.into()),
        }
    }
}

/// Manifest of a retrieval index built during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub name: String,
    pub phase: Phase,
    pub doc_count: usize,
    /// Sorted, deduplicated
    pub input_hashes: Vec<String>,
    #[serde(default)]
    pub config: Value,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<IndexHealth>,
}

impl IndexManifest {
    pub fn new(
        name: &str,
        phase: Phase,
        input_hashes: &[String],
        config: Value,
        doc_count: usize,
    ) -> Self {
        let mut input_hashes = input_hashes.to_vec();
        input_hashes.sort();
        input_hashes.dedup();
        let fingerprint = Self::fingerprint(&input_hashes, &config);
        Self {
            name: name.to_string(),
            phase,
            doc_count,
            input_hashes,
            config,
            fingerprint,
            health: None,
        }
    }

    /// Hash over the sorted input hashes and the index configuration.
    pub fn fingerprint(input_hashes: &[String], config: &Value) -> String {
        let mut sorted = input_hashes.to_vec();
        sorted.sort();
        hash_value(&json!({ "config": config, "input_hashes": sorted }))
    }

    pub fn with_health(mut self, health: IndexHealth) -> Self {
        self.health = Some(health);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.doc_count > 0 && self.health.as_ref().is_some_and(|h| h.passed)
    }
}

/// State and outputs of one phase within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub state: PhaseState,
    #[serde(default)]
    pub attempts: u32,
    /// Hashes of artifacts produced (or reused) by this phase
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Fingerprints of indexes built by this phase
    #[serde(default)]
    pub indexes: Vec<String>,
    /// Number of work units planned, for parallel phases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_units: Option<usize>,
    /// Result hash of each planned unit, in plan order. Units with
    /// identical results share one artifact, so this can repeat hashes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit_results: Vec<String>,
    /// Task ids dispatched for this phase, across attempts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Run the outputs were copied from, for cached phases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_from: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Why a run halted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub phase: Option<Phase>,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_tasks: Vec<TaskId>,
}

/// Per-run provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub experiment: String,
    /// Hash of the effective input specification set
    pub source_state_marker: String,
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<Uuid>,
    #[serde(default)]
    pub inputs: Vec<InputRecord>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub index_manifests: Vec<IndexManifest>,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseRecord>,
    #[serde(default)]
    pub overrides: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Audit digest, set by `finalize`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl RunManifest {
    pub fn new(
        run_id: Uuid,
        experiment: &str,
        source_state_marker: &str,
        from_phase: Phase,
        to_phase: Phase,
    ) -> Self {
        Self {
            run_id,
            experiment: experiment.to_string(),
            source_state_marker: source_state_marker.to_string(),
            from_phase,
            to_phase,
            status: RunStatus::Running,
            resumed_from: None,
            inputs: Vec::new(),
            artifacts: Vec::new(),
            index_manifests: Vec::new(),
            phases: Phase::ALL
                .iter()
                .map(|p| (*p, PhaseRecord::default()))
                .collect(),
            overrides: BTreeSet::new(),
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
            digest: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.digest.is_some()
    }

    fn ensure_open(&self) -> Result<(), ManifestError> {
        if self.is_finalized() {
            return Err(ManifestError::Finalized {
                run_id: self.run_id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Record a produced artifact. Returns `true` when newly recorded.
    pub fn record_artifact(&mut self, record: ArtifactRecord) -> Result<bool, ManifestError> {
        self.ensure_open()?;
        if let Some(existing) = self.artifacts.iter().find(|a| a.hash == record.hash) {
            return match existing.diff(&record) {
                None => Ok(false),
                Some(detail) => Err(ManifestError::Conflict {
                    hash: record.hash,
                    detail,
                }),
            };
        }
        let phase = self.phases.entry(record.phase).or_default();
        if !phase.artifacts.contains(&record.hash) {
            phase.artifacts.push(record.hash.clone());
        }
        self.artifacts.push(record);
        Ok(true)
    }

    /// Record an experiment input.
    pub fn record_input(&mut self, name: &str, hash: &str) -> Result<bool, ManifestError> {
        self.ensure_open()?;
        if let Some(existing) = self.inputs.iter().find(|i| i.name == name) {
            if existing.hash == hash {
                return Ok(false);
            }
            return Err(ManifestError::Conflict {
                hash: hash.to_string(),
                detail: format!("input '{}' already recorded as {}", name, existing.hash),
            });
        }
        self.inputs.push(InputRecord {
            name: name.to_string(),
            hash: hash.to_string(),
        });
        Ok(true)
    }

    /// Record a retrieval index manifest, keyed by fingerprint.
    pub fn record_index(&mut self, index: IndexManifest) -> Result<bool, ManifestError> {
        self.ensure_open()?;
        if let Some(existing) = self
            .index_manifests
            .iter()
            .find(|i| i.fingerprint == index.fingerprint)
        {
            if *existing == index {
                return Ok(false);
            }
            return Err(ManifestError::Conflict {
                hash: index.fingerprint,
                detail: format!("index '{}' already recorded with other metadata", existing.name),
            });
        }
        let phase = self.phases.entry(index.phase).or_default();
        if !phase.indexes.contains(&index.fingerprint) {
            phase.indexes.push(index.fingerprint.clone());
        }
        self.index_manifests.push(index);
        Ok(true)
    }

    pub fn set_override(&mut self, name: &str) -> Result<(), ManifestError> {
        self.ensure_open()?;
        self.overrides.insert(name.to_string());
        Ok(())
    }

    pub fn has_override(&self, name: &str) -> bool {
        self.overrides.contains(name)
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.get(&phase)
    }

    pub fn phase_state(&self, phase: Phase) -> PhaseState {
        self.phase(phase).map(|r| r.state).unwrap_or_default()
    }

    /// Mutable phase record; fails once finalized.
    pub fn phase_mut(&mut self, phase: Phase) -> Result<&mut PhaseRecord, ManifestError> {
        self.ensure_open()?;
        Ok(self.phases.entry(phase).or_default())
    }

    pub fn artifact(&self, hash: &str) -> Option<&ArtifactRecord> {
        self.artifacts.iter().find(|a| a.hash == hash)
    }

    pub fn artifacts_of_type<'a>(
        &'a self,
        artifact_type: &str,
    ) -> impl Iterator<Item = &'a ArtifactRecord> + use<'a> {
        let artifact_type = artifact_type.to_string();
        self.artifacts
            .iter()
            .filter(move |a| a.artifact_type == artifact_type)
    }

    pub fn artifacts_for_phase(&self, phase: Phase) -> impl Iterator<Item = &ArtifactRecord> {
        self.artifacts.iter().filter(move |a| a.phase == phase)
    }

    pub fn indexes_for_phase(&self, phase: Phase) -> impl Iterator<Item = &IndexManifest> {
        self.index_manifests.iter().filter(move |i| i.phase == phase)
    }

    /// Documents indexed by the evidence phase.
    pub fn evidence_count(&self) -> usize {
        self.indexes_for_phase(Phase::Evidence)
            .map(|i| i.doc_count)
            .sum()
    }

    /// Copy a satisfied phase's outputs from a prior run and mark it cached.
    pub fn copy_phase_from(&mut self, prior: &RunManifest, phase: Phase) -> Result<(), ManifestError> {
        self.ensure_open()?;
        for record in prior.artifacts_for_phase(phase) {
            self.record_artifact(record.clone())?;
        }
        for index in prior.indexes_for_phase(phase) {
            self.record_index(index.clone())?;
        }
        let prior_record = prior.phase(phase).cloned().unwrap_or_default();
        let record = self.phase_mut(phase)?;
        record.state = PhaseState::SkippedCached;
        record.planned_units = prior_record.planned_units;
        record.unit_results = prior_record.unit_results;
        record.cached_from = Some(prior.run_id);
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn set_failure(&mut self, failure: RunFailure) -> Result<(), ManifestError> {
        self.ensure_open()?;
        self.failure = Some(failure);
        Ok(())
    }

    /// Mark the run terminal and seal the manifest with its digest.
    pub fn finalize(&mut self, status: RunStatus) -> Result<String, ManifestError> {
        self.ensure_open()?;
        self.status = status;
        self.finished_at = Some(Utc::now());
        let digest = self.compute_digest();
        self.digest = Some(digest.clone());
        Ok(digest)
    }

    /// Digest over the canonical manifest without the `digest` field.
    pub fn compute_digest(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("digest");
        }
        hash_value(&value)
    }

    /// Whether the stored digest matches the manifest contents.
    pub fn verify_digest(&self) -> bool {
        self.digest
            .as_deref()
            .is_some_and(|d| d == self.compute_digest())
    }
}
