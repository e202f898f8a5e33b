//! Preflight checks gating phase transitions.
//!
//! Each phase declares what must hold before it may start: required input
//! artifacts exist, are intact, are non-empty, have their declared
//! dependencies, and carry the configured sections. Any violation is fatal;
//! preflight never warns.

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::manifest::{ArtifactRecord, NO_EVIDENCE_OVERRIDE, RunManifest};
use crate::phase::{ANALYSIS_BATCH, Phase, STATISTICAL_SUMMARY, VALIDATION_REPORT};
use crate::shape::ShapeSignature;
use crate::store::ContentStore;

/// A single failed preflight rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub message: String,
}

impl Violation {
    pub fn new(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Validates phase inputs against the store and the run manifest.
pub struct PreflightValidator<'a> {
    store: &'a ContentStore,
}

impl<'a> PreflightValidator<'a> {
    pub fn new(store: &'a ContentStore) -> Self {
        Self { store }
    }

    /// Check every rule for `phase`. An empty result means the phase may run.
    ///
    /// `required_sections` applies to artifacts of the phase's primary input
    /// type. Store I/O failures are returned as errors, not violations.
    pub fn check(
        &self,
        phase: Phase,
        manifest: &RunManifest,
        required_sections: &[String],
    ) -> Result<Vec<Violation>, StoreError> {
        let mut violations = Vec::new();
        match phase {
            Phase::Validation => self.check_inputs(manifest, &mut violations)?,
            Phase::Analysis => {
                self.require_single(manifest, VALIDATION_REPORT, false, required_sections, &mut violations)?
            }
            Phase::Statistical => self.check_batches(manifest, required_sections, &mut violations)?,
            Phase::Evidence => {
                self.require_single(manifest, STATISTICAL_SUMMARY, true, required_sections, &mut violations)?
            }
            Phase::Synthesis => {
                self.require_single(manifest, STATISTICAL_SUMMARY, true, required_sections, &mut violations)?;
                check_evidence(manifest, &mut violations);
            }
        }
        if !violations.is_empty() {
            tracing::warn!(%phase, count = violations.len(), "preflight failed");
        }
        Ok(violations)
    }

    fn check_inputs(
        &self,
        manifest: &RunManifest,
        violations: &mut Vec<Violation>,
    ) -> Result<(), StoreError> {
        if manifest.inputs.is_empty() {
            violations.push(Violation::new("inputs_present", "no experiment inputs recorded"));
            return Ok(());
        }
        for input in &manifest.inputs {
            match self.store.get(&input.hash) {
                Ok(bytes) if bytes.is_empty() => violations.push(Violation::new(
                    "input_non_empty",
                    format!("input '{}' is empty", input.name),
                )),
                Ok(_) => {}
                Err(e) => self.integrity_violation(&input.name, e, violations)?,
            }
        }
        Ok(())
    }

    /// Exactly one (latest) artifact of `artifact_type` must be usable.
    fn require_single(
        &self,
        manifest: &RunManifest,
        artifact_type: &str,
        well_formed: bool,
        required_sections: &[String],
        violations: &mut Vec<Violation>,
    ) -> Result<(), StoreError> {
        let Some(record) = manifest.artifacts_of_type(artifact_type).last() else {
            violations.push(Violation::new(
                "artifact_present",
                format!("no {artifact_type} artifact recorded"),
            ));
            return Ok(());
        };
        if let Some(shape) = self.inspect(record, required_sections, violations)?
            && well_formed
            && !shape.is_well_formed()
        {
            violations.push(Violation::new(
                "well_formed",
                format!(
                    "{} {} has {} non-finite value(s) and range violations at {:?}",
                    artifact_type,
                    short(&record.hash),
                    shape.non_finite,
                    shape.range_violations
                ),
            ));
        }
        Ok(())
    }

    fn check_batches(
        &self,
        manifest: &RunManifest,
        required_sections: &[String],
        violations: &mut Vec<Violation>,
    ) -> Result<(), StoreError> {
        let batches: Vec<&ArtifactRecord> = manifest.artifacts_of_type(ANALYSIS_BATCH).collect();
        if batches.is_empty() {
            violations.push(Violation::new(
                "artifact_present",
                format!("no {ANALYSIS_BATCH} artifact recorded"),
            ));
            return Ok(());
        }
        let analysis = manifest.phase(Phase::Analysis);
        // Units with identical results share one artifact; count units.
        let produced = match analysis.map(|r| r.unit_results.as_slice()) {
            Some(results) if !results.is_empty() => {
                for hash in results {
                    if !batches.iter().any(|b| &b.hash == hash) {
                        violations.push(Violation::new(
                            "batch_count",
                            format!("unit result {} is not a recorded {ANALYSIS_BATCH}", short(hash)),
                        ));
                    }
                }
                results.len()
            }
            _ => batches.len(),
        };
        match analysis.and_then(|r| r.planned_units) {
            Some(planned) if planned != produced => violations.push(Violation::new(
                "batch_count",
                format!("expected {planned} analysis batch(es), found {produced}"),
            )),
            Some(_) => {}
            None => violations.push(Violation::new(
                "batch_count",
                "planned analysis unit count was never recorded",
            )),
        }
        for record in batches {
            self.inspect(record, required_sections, violations)?;
        }
        Ok(())
    }

    /// Verify one artifact; returns its shape when it is present and intact.
    fn inspect(
        &self,
        record: &ArtifactRecord,
        required_sections: &[String],
        violations: &mut Vec<Violation>,
    ) -> Result<Option<ShapeSignature>, StoreError> {
        let label = format!("{} {}", record.artifact_type, short(&record.hash));
        let bytes = match self.store.get(&record.hash) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.integrity_violation(&label, e, violations)?;
                return Ok(None);
            }
        };
        if !self.store.has_dependencies(&record.hash, &record.dependencies)? {
            violations.push(Violation::new(
                "dependencies",
                format!("{label} is missing recorded dependencies"),
            ));
        }
        let shape = ShapeSignature::compute(&bytes);
        if shape.is_empty() {
            violations.push(Violation::new("non_empty", format!("{label} is empty")));
        }
        let missing = shape.missing_sections(required_sections);
        if !missing.is_empty() {
            violations.push(Violation::new(
                "required_sections",
                format!("{label} lacks required section(s): {}", missing.join(", ")),
            ));
        }
        Ok(Some(shape))
    }

    fn integrity_violation(
        &self,
        label: &str,
        error: StoreError,
        violations: &mut Vec<Violation>,
    ) -> Result<(), StoreError> {
        match error {
            StoreError::NotFound { .. } | StoreError::InvalidHash(_) => {
                violations.push(Violation::new("artifact_present", format!("{label} is missing from the store")));
                Ok(())
            }
            StoreError::Integrity { actual, .. } => {
                violations.push(Violation::new(
                    "integrity",
                    format!("{label} is corrupt (content hashes to {})", short(&actual)),
                ));
                Ok(())
            }
            other => Err(other),
        }
    }
}

fn check_evidence(manifest: &RunManifest, violations: &mut Vec<Violation>) {
    let count = manifest.evidence_count();
    if count == 0 && !manifest.has_override(NO_EVIDENCE_OVERRIDE) {
        violations.push(Violation::new(
            "evidence_count",
            "evidence count is 0; pass --no-evidence to synthesize without evidence",
        ));
    }
    for index in manifest.indexes_for_phase(Phase::Evidence) {
        if index.doc_count == 0 {
            violations.push(Violation::new(
                "index_doc_count",
                format!("index '{}' has no documents", index.name),
            ));
        }
        match &index.health {
            Some(h) if h.passed => {}
            Some(h) => violations.push(Violation::new(
                "index_health",
                format!(
                    "index '{}' failed its sample query ({} hit(s){})",
                    index.name,
                    h.sample_hits,
                    h.error.as_deref().map(|e| format!(", {e}")).unwrap_or_default()
                ),
            )),
            None => violations.push(Violation::new(
                "index_health",
                format!("index '{}' was never health-checked", index.name),
            )),
        }
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}
