//! End-to-end pipeline tests against an in-process collaborator.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use cairn::config::{CairnToml, PhaseOverride};
use cairn::coordinator::WorkUnit;
use cairn::engine::{
    Collaborator, IndexBuild, PhaseEngine, PhaseInput, PhaseOutput, ProducedArtifact, RunRequest,
};
use cairn::errors::{EngineError, FailureKind, WorkError};
use cairn::experiment::{Document, Experiment};
use cairn::manifest::{RunManifest, RunStatus, RunStore};
use cairn::phase::{
    ANALYSIS_BATCH, Phase, PhaseState, STATISTICAL_SUMMARY, SYNTHESIS_REPORT,
    VALIDATION_REPORT,
};
use cairn::store::ContentStore;

/// Deterministic stand-in for the external frameworks.
#[derive(Default)]
struct Lab {
    /// Documents the evidence index reports; `None` means all inputs
    evidence_docs: Option<usize>,
    /// Transient failures to inject per analysis batch index
    flaky_batches: Mutex<HashMap<u64, usize>>,
    /// How long each analysis unit takes
    unit_delay: Option<Duration>,
    /// Every analysis unit returns the same bytes
    uniform_results: bool,
    phase_calls: Mutex<HashMap<Phase, usize>>,
    unit_calls: Mutex<HashMap<u64, usize>>,
    plans: AtomicUsize,
}

impl Lab {
    fn calls(&self, phase: Phase) -> usize {
        self.phase_calls.lock().unwrap().get(&phase).copied().unwrap_or(0)
    }

    fn unit_calls(&self, batch: u64) -> usize {
        self.unit_calls.lock().unwrap().get(&batch).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Collaborator for Lab {
    async fn run_phase(&self, input: &PhaseInput) -> Result<PhaseOutput, WorkError> {
        *self.phase_calls.lock().unwrap().entry(input.phase).or_default() += 1;
        let output = match input.phase {
            Phase::Validation => {
                let names: Vec<&str> = input.documents.iter().map(|d| d.name.as_str()).collect();
                PhaseOutput {
                    artifacts: vec![ProducedArtifact::json(
                        VALIDATION_REPORT,
                        &json!({"valid": true, "documents": names}),
                    )],
                    indexes: vec![],
                }
            }
            Phase::Statistical => {
                let scores: Vec<f64> = input
                    .artifacts_of_type(ANALYSIS_BATCH)
                    .map(|a| {
                        let v: Value = serde_json::from_slice(&a.bytes).unwrap();
                        v["score"].as_f64().unwrap()
                    })
                    .collect();
                let mean = scores.iter().sum::<f64>() / scores.len() as f64;
                PhaseOutput {
                    artifacts: vec![ProducedArtifact::json(
                        STATISTICAL_SUMMARY,
                        &json!({"batches": scores.len(), "mean": mean, "p_value": 0.04}),
                    )],
                    indexes: vec![],
                }
            }
            Phase::Evidence => {
                let doc_count = self.evidence_docs.unwrap_or(input.documents.len());
                let mut indexes = Vec::new();
                if doc_count > 0 {
                    indexes.push(IndexBuild {
                        name: "documents".into(),
                        input_hashes: input.documents.iter().map(|d| d.hash.clone()).collect(),
                        config: json!({"top_k": 5}),
                        doc_count,
                    });
                }
                PhaseOutput {
                    artifacts: vec![],
                    indexes,
                }
            }
            Phase::Synthesis => {
                let evidence: usize = input.indexes.iter().map(|i| i.doc_count).sum();
                PhaseOutput {
                    artifacts: vec![ProducedArtifact::json(
                        SYNTHESIS_REPORT,
                        &json!({"summary": "done", "evidence": evidence}),
                    )],
                    indexes: vec![],
                }
            }
            Phase::Analysis => return Err(WorkError::Deterministic("analysis is fanned out".into())),
        };
        Ok(output)
    }

    async fn plan_units(&self, input: &PhaseInput) -> Result<Vec<WorkUnit>, WorkError> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        let batch_size = input.experiment.batch_size;
        Ok(input
            .documents
            .chunks(batch_size)
            .enumerate()
            .map(|(i, docs)| {
                let names: Vec<&str> = docs.iter().map(|d| d.name.as_str()).collect();
                WorkUnit::new(json!({"batch": i, "documents": names}).to_string(), vec![])
            })
            .collect())
    }

    async fn run_unit(&self, _phase: Phase, payload: &[u8]) -> Result<Vec<u8>, WorkError> {
        let unit: Value = serde_json::from_slice(payload).unwrap();
        let batch = unit["batch"].as_u64().unwrap();
        *self.unit_calls.lock().unwrap().entry(batch).or_default() += 1;
        if let Some(delay) = self.unit_delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut flaky = self.flaky_batches.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(&batch)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(WorkError::Transient(format!("batch {batch} worker crashed")));
            }
        }
        if self.uniform_results {
            return Ok(json!({"score": 0.5}).to_string().into_bytes());
        }
        let docs = unit["documents"].as_array().unwrap().len();
        let result = json!({"batch": batch, "documents": unit["documents"], "score": docs as f64 / 4.0});
        Ok(result.to_string().into_bytes())
    }
}

fn experiment(texts: &[&str]) -> Arc<Experiment> {
    let docs = texts
        .iter()
        .enumerate()
        .map(|(i, t)| Document::new(format!("doc{i}.md"), *t))
        .collect();
    Arc::new(Experiment::from_parts("drug-trial", json!({"alpha": 0.05}), 2, docs))
}

fn four_docs() -> Arc<Experiment> {
    experiment(&["first finding", "second finding", "third finding", "fourth finding"])
}

fn engine(root: &TempDir, config: CairnToml, lab: Arc<Lab>) -> PhaseEngine {
    PhaseEngine::new(
        ContentStore::open(root.path().join("store")).unwrap(),
        RunStore::new(root.path().join("runs")),
        config,
        lab,
    )
}

fn hashes_of(manifest: &RunManifest, artifact_type: &str) -> Vec<String> {
    let mut hashes: Vec<String> = manifest
        .artifacts_of_type(artifact_type)
        .map(|a| a.hash.clone())
        .collect();
    hashes.sort();
    hashes
}

fn retrying_config(max_retries: u32) -> CairnToml {
    let mut config = CairnToml::default();
    config.phases.insert(
        "analysis".into(),
        PhaseOverride {
            max_retries: Some(max_retries),
            backoff_ms: Some(10),
            ..Default::default()
        },
    );
    config
}

#[tokio::test]
async fn test_four_document_run_end_to_end() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab::default());
    let engine = engine(&root, CairnToml::default(), lab.clone());

    let outcome = engine.run(RunRequest::new(four_docs())).await.unwrap();
    let m = &outcome.manifest;

    assert_eq!(m.status, RunStatus::Completed);
    assert!(m.verify_digest());
    assert_eq!(m.inputs.len(), 4);
    assert_eq!(hashes_of(m, VALIDATION_REPORT).len(), 1);
    assert_eq!(hashes_of(m, ANALYSIS_BATCH).len(), 2);
    assert_eq!(hashes_of(m, STATISTICAL_SUMMARY).len(), 1);
    assert_eq!(hashes_of(m, SYNTHESIS_REPORT).len(), 1);
    assert_eq!(m.artifacts.len(), 5);
    assert!(m.artifacts_for_phase(Phase::Evidence).next().is_none());

    assert_eq!(m.index_manifests.len(), 1);
    let index = &m.index_manifests[0];
    assert_eq!(index.doc_count, 4);
    assert!(index.is_healthy());
    assert_eq!(m.evidence_count(), 4);

    for phase in Phase::ALL {
        assert_eq!(m.phase_state(phase), PhaseState::Completed, "{phase}");
    }
    let analysis = m.phase(Phase::Analysis).unwrap();
    assert_eq!(analysis.planned_units, Some(2));
    assert_eq!(analysis.tasks.len(), 2);

    // Every artifact's dependencies are recorded and intact.
    let store = engine.store();
    for artifact in &m.artifacts {
        assert!(store.has_dependencies(&artifact.hash, &artifact.dependencies).unwrap());
    }
    let report = outcome.artifact(VALIDATION_REPORT).unwrap();
    for batch in m.artifacts_of_type(ANALYSIS_BATCH) {
        assert_eq!(batch.dependencies, vec![report.hash.clone()]);
    }
    let summary = outcome.artifact(STATISTICAL_SUMMARY).unwrap();
    let mut summary_deps = summary.dependencies.clone();
    summary_deps.sort();
    assert_eq!(summary_deps, hashes_of(m, ANALYSIS_BATCH));
    let synthesis_record = outcome.artifact(SYNTHESIS_REPORT).unwrap();
    assert_eq!(synthesis_record.dependencies, vec![summary.hash.clone()]);

    let synthesis: Value = store.get_json(&outcome.artifact(SYNTHESIS_REPORT).unwrap().hash).unwrap();
    assert_eq!(synthesis["evidence"], 4);

    // The persisted manifest is what the caller got back.
    let persisted = engine.runs().load(outcome.run_id).unwrap();
    assert_eq!(persisted.digest, m.digest);
    assert!(persisted.verify_digest());
}

#[tokio::test]
async fn test_identical_unit_results_share_one_artifact() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab {
        uniform_results: true,
        ..Default::default()
    });
    let engine = engine(&root, CairnToml::default(), lab);

    let outcome = engine.run(RunRequest::new(four_docs())).await.unwrap();
    let m = &outcome.manifest;
    assert_eq!(m.status, RunStatus::Completed);
    let batches = hashes_of(m, ANALYSIS_BATCH);
    assert_eq!(batches.len(), 1);
    let analysis = m.phase(Phase::Analysis).unwrap();
    assert_eq!(analysis.planned_units, Some(2));
    assert_eq!(analysis.unit_results, vec![batches[0].clone(), batches[0].clone()]);
    assert_eq!(m.phase_state(Phase::Statistical), PhaseState::Completed);

    // A resumed run carries the per-unit results with the cached phase.
    let resumed = engine.run(RunRequest::new(four_docs()).resume()).await.unwrap();
    assert_eq!(
        resumed.manifest.phase(Phase::Analysis).unwrap().unit_results,
        analysis.unit_results
    );
    assert_eq!(resumed.manifest.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_resume_reuses_every_cached_phase() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab::default());
    let engine = engine(&root, CairnToml::default(), lab.clone());

    let first = engine.run(RunRequest::new(four_docs())).await.unwrap();
    let second = engine.run(RunRequest::new(four_docs()).resume()).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.manifest.resumed_from, Some(first.run_id));
    for phase in Phase::ALL {
        assert_eq!(second.manifest.phase_state(phase), PhaseState::SkippedCached, "{phase}");
        assert_eq!(
            second.manifest.phase(phase).unwrap().cached_from,
            Some(first.run_id)
        );
        assert_eq!(lab.calls(phase), if phase == Phase::Analysis { 0 } else { 1 });
    }
    assert_eq!(lab.plans.load(Ordering::SeqCst), 1);
    assert_eq!(first.manifest.artifacts, second.manifest.artifacts);
    assert_eq!(first.manifest.index_manifests, second.manifest.index_manifests);
}

#[tokio::test]
async fn test_partial_resume_matches_full_run() {
    let fresh_root = TempDir::new().unwrap();
    let fresh = engine(&fresh_root, CairnToml::default(), Arc::new(Lab::default()))
        .run(RunRequest::new(four_docs()))
        .await
        .unwrap();

    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab::default());
    let engine = engine(&root, CairnToml::default(), lab.clone());
    let partial = engine
        .run(RunRequest::new(four_docs()).range(Phase::Validation, Phase::Statistical))
        .await
        .unwrap();
    assert_eq!(partial.manifest.phase_state(Phase::Evidence), PhaseState::Pending);

    let resumed = engine
        .run(
            RunRequest::new(four_docs())
                .range(Phase::Evidence, Phase::Synthesis)
                .resume(),
        )
        .await
        .unwrap();
    let m = &resumed.manifest;
    assert_eq!(m.phase_state(Phase::Validation), PhaseState::SkippedCached);
    assert_eq!(m.phase_state(Phase::Statistical), PhaseState::SkippedCached);
    assert_eq!(m.phase_state(Phase::Evidence), PhaseState::Completed);
    assert_eq!(m.phase_state(Phase::Synthesis), PhaseState::Completed);
    assert_eq!(lab.calls(Phase::Validation), 1);

    for artifact_type in [
        VALIDATION_REPORT,
        ANALYSIS_BATCH,
        STATISTICAL_SUMMARY,
        SYNTHESIS_REPORT,
    ] {
        assert_eq!(
            hashes_of(m, artifact_type),
            hashes_of(&fresh.manifest, artifact_type),
            "{artifact_type}"
        );
    }
    assert_eq!(m.index_manifests, fresh.manifest.index_manifests);
}

#[tokio::test]
async fn test_force_recompute_ignores_cache() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab::default());
    let engine = engine(&root, CairnToml::default(), lab.clone());

    engine.run(RunRequest::new(four_docs())).await.unwrap();
    let second = engine
        .run(RunRequest::new(four_docs()).resume().force_recompute(true))
        .await
        .unwrap();
    for phase in Phase::ALL {
        assert_eq!(second.manifest.phase_state(phase), PhaseState::Completed);
    }
    assert_eq!(lab.calls(Phase::Synthesis), 2);
    assert_eq!(lab.plans.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resume_rejects_changed_inputs() {
    let root = TempDir::new().unwrap();
    let engine = engine(&root, CairnToml::default(), Arc::new(Lab::default()));
    let first = engine.run(RunRequest::new(four_docs())).await.unwrap();

    let edited = experiment(&["first finding", "second finding", "third finding", "REVISED"]);
    let err = engine.run(RunRequest::new(edited.clone()).resume()).await.unwrap_err();
    match &err {
        EngineError::ResumeIncompatible {
            prior_run,
            prior_marker,
            current_marker,
        } => {
            assert_eq!(*prior_run, first.run_id);
            assert_eq!(prior_marker, &first.manifest.source_state_marker);
            assert_eq!(current_marker, &edited.source_state_marker());
        }
        other => panic!("expected ResumeIncompatible, got {other:?}"),
    }
    assert_eq!(err.kind(), FailureKind::ResumeIncompatible);

    let err = engine
        .run(RunRequest::new(edited).resume_from(&first.run_id.to_string()[..8]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResumeIncompatible { .. }));
    assert_eq!(engine.runs().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_zero_evidence_blocks_synthesis() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab {
        evidence_docs: Some(0),
        ..Default::default()
    });
    let engine = engine(&root, CairnToml::default(), lab.clone());
    let run_id = uuid::Uuid::new_v4();

    let err = engine
        .run(RunRequest::new(four_docs()).with_run_id(run_id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::PreflightViolation);
    assert!(err.violations().iter().any(|v| v.rule == "evidence_count"));
    assert_eq!(lab.calls(Phase::Synthesis), 0);

    let m = engine.runs().load(run_id).unwrap();
    assert_eq!(m.status, RunStatus::Failed);
    assert_eq!(m.phase_state(Phase::Evidence), PhaseState::Completed);
    assert_eq!(m.phase_state(Phase::Synthesis), PhaseState::Failed);
    assert!(!m.phase(Phase::Synthesis).unwrap().violations.is_empty());
    let failure = m.failure.as_ref().unwrap();
    assert_eq!(failure.phase, Some(Phase::Synthesis));
    assert_eq!(failure.kind, FailureKind::PreflightViolation);
    assert_eq!(failure.violations, err.violations());
    assert!(m.verify_digest());

    // Explicit override lets synthesis run without evidence.
    let outcome = engine
        .run(RunRequest::new(four_docs()).resume().no_evidence(true))
        .await
        .unwrap();
    assert_eq!(outcome.manifest.status, RunStatus::Completed);
    assert!(outcome.manifest.has_override("no_evidence"));
    assert_eq!(lab.calls(Phase::Synthesis), 1);
    assert_eq!(outcome.manifest.phase_state(Phase::Evidence), PhaseState::SkippedCached);
}

#[tokio::test]
async fn test_transient_unit_failure_redispatches_only_failed_unit() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab::default());
    lab.flaky_batches.lock().unwrap().insert(1, 1);
    let engine = engine(&root, retrying_config(1), lab.clone());

    let outcome = engine.run(RunRequest::new(four_docs())).await.unwrap();
    assert_eq!(lab.unit_calls(0), 1);
    assert_eq!(lab.unit_calls(1), 2);

    let analysis = outcome.manifest.phase(Phase::Analysis).unwrap();
    assert_eq!(analysis.attempts, 2);
    assert_eq!(analysis.tasks.len(), 3);
    assert_eq!(hashes_of(&outcome.manifest, ANALYSIS_BATCH).len(), 2);
}

#[tokio::test]
async fn test_unit_failure_without_retries_fails_run() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab::default());
    lab.flaky_batches.lock().unwrap().insert(0, 5);
    let engine = engine(&root, retrying_config(1), lab.clone());
    let run_id = uuid::Uuid::new_v4();

    let err = engine
        .run(RunRequest::new(four_docs()).with_run_id(run_id))
        .await
        .unwrap_err();
    match &err {
        EngineError::WorkerFailure { phase, failures } => {
            assert_eq!(*phase, Phase::Analysis);
            assert_eq!(failures.len(), 1);
            assert!(failures[0].retryable);
        }
        other => panic!("expected WorkerFailure, got {other:?}"),
    }
    assert_eq!(lab.unit_calls(0), 2);
    assert_eq!(lab.calls(Phase::Statistical), 0);
    let m = engine.runs().load(run_id).unwrap();
    assert_eq!(m.failure.unwrap().kind, FailureKind::WorkerFailure);
}

#[tokio::test]
async fn test_fan_in_timeout_reports_missing_tasks() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab {
        unit_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let mut config = CairnToml::default();
    config.phases.insert(
        "analysis".into(),
        PhaseOverride {
            timeout_secs: Some(1),
            ..Default::default()
        },
    );
    let engine = engine(&root, config, lab);
    let run_id = uuid::Uuid::new_v4();

    let err = engine
        .run(RunRequest::new(four_docs()).with_run_id(run_id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::CoordinationTimeout);
    assert_eq!(err.missing_tasks().len(), 2);

    let m = engine.runs().load(run_id).unwrap();
    assert_eq!(m.failure.unwrap().missing_tasks.len(), 2);
}

#[tokio::test]
async fn test_abort_marks_manifest_aborted() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab {
        unit_delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let engine = engine(&root, CairnToml::default(), lab);
    let run_id = uuid::Uuid::new_v4();

    let abort = engine.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        abort.abort();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        engine.run(RunRequest::new(four_docs()).with_run_id(run_id)),
    )
    .await
    .expect("abort should end the run promptly")
    .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Aborted {
            phase: Phase::Analysis,
            ..
        }
    ));

    let m = engine.runs().load(run_id).unwrap();
    assert_eq!(m.status, RunStatus::Aborted);
    assert_eq!(m.failure.as_ref().unwrap().kind, FailureKind::Aborted);
    // Artifacts produced before the abort stay in the store.
    let report = m.artifacts_of_type(VALIDATION_REPORT).next().unwrap();
    assert!(engine.store().contains(&report.hash));
}

#[tokio::test]
async fn test_corrupted_cache_is_recomputed() {
    let root = TempDir::new().unwrap();
    let lab = Arc::new(Lab::default());
    let engine = engine(&root, CairnToml::default(), lab.clone());
    let first = engine.run(RunRequest::new(four_docs())).await.unwrap();

    let synthesis = first.artifact(SYNTHESIS_REPORT).unwrap().hash.clone();
    std::fs::write(engine.store().object_path(&synthesis).unwrap(), b"garbage").unwrap();

    let err = engine.run(RunRequest::new(four_docs()).resume()).await.unwrap_err();
    // The rebuilt report has the same hash, so the corrupt copy is detected on write.
    assert_eq!(err.kind(), FailureKind::Integrity);
    assert_eq!(lab.calls(Phase::Synthesis), 2);
    assert_eq!(lab.calls(Phase::Evidence), 1);
}
