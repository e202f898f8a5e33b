use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::coordinator::{UnitHandler, WorkUnit};
use crate::errors::WorkError;
use crate::experiment::Experiment;
use crate::manifest::{ArtifactRecord, IndexManifest};
use crate::phase::Phase;

/// An artifact handed to a phase, with its verified bytes.
#[derive(Debug, Clone)]
pub struct InputArtifact {
    pub record: ArtifactRecord,
    pub bytes: Vec<u8>,
}

/// An experiment document as stored in the content store.
#[derive(Debug, Clone)]
pub struct InputDocument {
    pub name: String,
    pub hash: String,
    pub bytes: Vec<u8>,
}

/// Everything a phase may consume.
#[derive(Debug, Clone)]
pub struct PhaseInput {
    pub phase: Phase,
    pub run_id: Uuid,
    pub experiment: Arc<Experiment>,
    pub documents: Vec<InputDocument>,
    /// Artifacts recorded by earlier phases, in record order
    pub artifacts: Vec<InputArtifact>,
    pub indexes: Vec<IndexManifest>,
}

impl PhaseInput {
    pub fn artifacts_of_type<'a>(
        &'a self,
        artifact_type: &str,
    ) -> impl Iterator<Item = &'a InputArtifact> + use<'a> {
        let artifact_type = artifact_type.to_string();
        self.artifacts
            .iter()
            .filter(move |a| a.record.artifact_type == artifact_type)
    }

    /// Hashes of this phase's primary inputs.
    pub fn primary_hashes(&self) -> Vec<String> {
        if self.phase == Phase::Validation {
            return self.documents.iter().map(|d| d.hash.clone()).collect();
        }
        self.artifacts_of_type(self.phase.input_type())
            .map(|a| a.record.hash.clone())
            .collect()
    }
}

/// An artifact produced by a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedArtifact {
    pub artifact_type: String,
    pub payload: Vec<u8>,
    /// When empty, the phase's primary input hashes are recorded
    pub dependencies: Vec<String>,
}

impl ProducedArtifact {
    pub fn new(artifact_type: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            artifact_type: artifact_type.to_string(),
            payload: payload.into(),
            dependencies: Vec::new(),
        }
    }

    pub fn json(artifact_type: &str, value: &Value) -> Self {
        Self::new(artifact_type, value.to_string())
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// A retrieval index built by a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBuild {
    pub name: String,
    pub input_hashes: Vec<String>,
    pub config: Value,
    pub doc_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    pub artifacts: Vec<ProducedArtifact>,
    pub indexes: Vec<IndexBuild>,
}

/// External capability that does the actual work of each phase.
///
/// Single-unit phases go through `run_phase`. Parallel phases are split by
/// `plan_units` and each unit is executed by `run_unit` on a worker.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn run_phase(&self, input: &PhaseInput) -> Result<PhaseOutput, WorkError>;

    async fn plan_units(&self, input: &PhaseInput) -> Result<Vec<WorkUnit>, WorkError> {
        Err(WorkError::Deterministic(format!(
            "phase {} cannot be split into work units",
            input.phase
        )))
    }

    async fn run_unit(&self, phase: Phase, _payload: &[u8]) -> Result<Vec<u8>, WorkError> {
        Err(WorkError::Deterministic(format!(
            "no unit handler for phase {phase}"
        )))
    }

    /// Run a sample query against an index; returns the number of hits.
    async fn probe_index(&self, _phase: Phase, index: &IndexManifest) -> Result<usize, WorkError> {
        Ok(index.doc_count)
    }
}

/// Runs collaborator units on the local worker pool.
pub(crate) struct CollaboratorUnits(pub(crate) Arc<dyn Collaborator>);

#[async_trait]
impl UnitHandler for CollaboratorUnits {
    async fn run_unit(&self, phase: Phase, payload: &[u8]) -> Result<Vec<u8>, WorkError> {
        self.0.run_unit(phase, payload).await
    }
}
