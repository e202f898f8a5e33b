//! Collaborator backed by external commands configured in `cairn.toml`.
//!
//! Each phase names an argv under `[phases.<name>] command`. The command
//! receives a JSON request on stdin and answers on stdout:
//!
//! - phase mode: `{"mode": "phase", "phase", "experiment", "documents",
//!   "artifacts", "indexes"}` in, `{"artifacts": [...], "indexes": [...]}` out
//! - unit mode: `{"mode": "unit", "phase", "unit"}` in, raw result bytes out
//!
//! Exit code 75 (`EX_TEMPFAIL`) marks a transient failure worth retrying;
//! any other non-zero exit is deterministic.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::collaborator::{Collaborator, IndexBuild, PhaseInput, PhaseOutput, ProducedArtifact};
use crate::config::CairnToml;
use crate::coordinator::WorkUnit;
use crate::errors::WorkError;
use crate::manifest::IndexManifest;
use crate::phase::{Phase, VALIDATION_REPORT};

/// Exit status a command uses to request a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

const STDERR_TAIL: usize = 2000;

#[derive(Debug, Deserialize)]
struct PhaseResponse {
    #[serde(default)]
    artifacts: Vec<WireArtifact>,
    #[serde(default)]
    indexes: Vec<WireIndex>,
}

#[derive(Debug, Deserialize)]
struct WireArtifact {
    artifact_type: String,
    payload: Value,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireIndex {
    name: String,
    #[serde(default)]
    input_hashes: Vec<String>,
    #[serde(default)]
    config: Value,
    doc_count: usize,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    hits: usize,
}

pub struct CommandCollaborator {
    config: CairnToml,
    work_dir: PathBuf,
}

impl CommandCollaborator {
    /// Commands run with `work_dir` (normally the experiment directory) as
    /// their working directory.
    pub fn new(config: CairnToml, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
        }
    }

    fn command_for(&self, phase: Phase) -> Result<Vec<String>, WorkError> {
        match self.config.phase_settings(phase).command {
            Some(argv) if !argv.is_empty() => Ok(argv),
            _ => Err(WorkError::Deterministic(format!(
                "no command configured for phase {phase} (set [phases.{phase}] command in cairn.toml)"
            ))),
        }
    }

    async fn invoke(&self, phase: Phase, argv: &[String], input: &[u8]) -> Result<Vec<u8>, WorkError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(WorkError::Deterministic("empty command".into()));
        };
        tracing::debug!(%phase, %program, bytes = input.len(), "invoking command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.work_dir)
            .env("CAIRN_PHASE", phase.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    WorkError::Deterministic(format!("failed to start {program}: {e}"))
                }
                _ => WorkError::Transient(format!("failed to start {program}: {e}")),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(input).await {
                tracing::debug!(error = %e, "command closed stdin");
            }
            let _ = stdin.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| WorkError::Transient(format!("failed to wait for {program}: {e}")))?;

        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail(stderr.trim(), STDERR_TAIL);
        match output.status.code() {
            Some(EXIT_TEMPFAIL) => Err(WorkError::Transient(format!(
                "{program} asked to be retried: {tail}"
            ))),
            Some(code) => Err(WorkError::Deterministic(format!(
                "{program} exited with {code}: {tail}"
            ))),
            // Killed by a signal; most often the OOM killer.
            None => Err(WorkError::Transient(format!(
                "{program} terminated by signal: {tail}"
            ))),
        }
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    async fn run_phase(&self, input: &PhaseInput) -> Result<PhaseOutput, WorkError> {
        let argv = self.command_for(input.phase)?;
        let request = phase_request(input);
        let stdout = self
            .invoke(input.phase, &argv, request.to_string().as_bytes())
            .await?;
        let response: PhaseResponse = serde_json::from_slice(&stdout).map_err(|e| {
            WorkError::Deterministic(format!("phase {} returned invalid JSON: {e}", input.phase))
        })?;

        Ok(PhaseOutput {
            artifacts: response
                .artifacts
                .into_iter()
                .map(|a| {
                    ProducedArtifact::new(&a.artifact_type, payload_bytes(a.payload))
                        .with_dependencies(a.dependencies)
                })
                .collect(),
            indexes: response
                .indexes
                .into_iter()
                .map(|i| IndexBuild {
                    name: i.name,
                    input_hashes: i.input_hashes,
                    config: i.config,
                    doc_count: i.doc_count,
                })
                .collect(),
        })
    }

    async fn plan_units(&self, input: &PhaseInput) -> Result<Vec<WorkUnit>, WorkError> {
        if input.phase == Phase::Analysis {
            return plan_document_batches(input);
        }
        Ok(input
            .artifacts_of_type(input.phase.input_type())
            .map(|a| {
                let unit = json!({
                    "artifact": a.record.hash,
                    "artifact_type": a.record.artifact_type,
                    "payload": payload_value(&a.bytes),
                });
                WorkUnit::new(unit.to_string(), vec![a.record.hash.clone()])
            })
            .collect())
    }

    async fn run_unit(&self, phase: Phase, payload: &[u8]) -> Result<Vec<u8>, WorkError> {
        let argv = self.command_for(phase)?;
        let request = json!({
            "mode": "unit",
            "phase": phase,
            "unit": payload_value(payload),
        });
        let stdout = self.invoke(phase, &argv, request.to_string().as_bytes()).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(WorkError::Deterministic(format!(
                "unit command for phase {phase} produced no output"
            )));
        }
        Ok(stdout)
    }

    async fn probe_index(&self, phase: Phase, index: &IndexManifest) -> Result<usize, WorkError> {
        let Some(argv) = self.config.phase_settings(phase).probe_command else {
            return Ok(index.doc_count);
        };
        let request = serde_json::to_vec(index)
            .map_err(|e| WorkError::Deterministic(format!("failed to encode index: {e}")))?;
        let stdout = self.invoke(phase, &argv, &request).await?;
        let response: ProbeResponse = serde_json::from_slice(&stdout)
            .map_err(|e| WorkError::Deterministic(format!("probe returned invalid JSON: {e}")))?;
        Ok(response.hits)
    }
}

/// Analysis units: the experiment's documents in `batch_size` chunks, each
/// tied to the validation report that admitted them.
fn plan_document_batches(input: &PhaseInput) -> Result<Vec<WorkUnit>, WorkError> {
    let Some(report) = input.artifacts_of_type(VALIDATION_REPORT).last() else {
        return Err(WorkError::Deterministic("no validation report to analyze".into()));
    };
    let batch_size = input.experiment.batch_size.max(1);
    Ok(input
        .documents
        .chunks(batch_size)
        .enumerate()
        .map(|(batch, docs)| {
            let unit = json!({
                "batch": batch,
                "report": report.record.hash,
                "params": input.experiment.params,
                "documents": docs.iter().map(|d| json!({
                    "name": d.name,
                    "hash": d.hash,
                    "text": String::from_utf8_lossy(&d.bytes),
                })).collect::<Vec<_>>(),
            });
            let mut deps = vec![report.record.hash.clone()];
            deps.extend(docs.iter().map(|d| d.hash.clone()));
            WorkUnit::new(unit.to_string(), deps)
        })
        .collect())
}

fn phase_request(input: &PhaseInput) -> Value {
    json!({
        "mode": "phase",
        "phase": input.phase,
        "run_id": input.run_id,
        "experiment": input.experiment.describe(),
        "documents": input.documents.iter().map(|d| json!({
            "name": d.name,
            "hash": d.hash,
            "text": String::from_utf8_lossy(&d.bytes),
        })).collect::<Vec<_>>(),
        "artifacts": input.artifacts.iter().map(|a| json!({
            "hash": a.record.hash,
            "artifact_type": a.record.artifact_type,
            "phase": a.record.phase,
            "payload": payload_value(&a.bytes),
        })).collect::<Vec<_>>(),
        "indexes": input.indexes,
    })
}

/// JSON payloads are embedded as values, anything else as a string.
fn payload_value(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn payload_bytes(payload: Value) -> Vec<u8> {
    match payload {
        Value::String(s) => s.into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseOverride;
    use crate::engine::collaborator::{InputArtifact, InputDocument};
    use crate::experiment::{Document, Experiment};
    use crate::manifest::ArtifactRecord;
    use crate::shape::ShapeSignature;
    use std::sync::Arc;
    use uuid::Uuid;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn collaborator(phase: Phase, command: Vec<String>) -> CommandCollaborator {
        let mut config = CairnToml::default();
        config.phases.insert(
            phase.as_str().to_string(),
            PhaseOverride {
                command: Some(command),
                ..Default::default()
            },
        );
        CommandCollaborator::new(config, std::env::temp_dir())
    }

    fn input(phase: Phase, batch_size: usize) -> PhaseInput {
        let docs: Vec<Document> = (0..5)
            .map(|i| Document::new(format!("d{i}.txt"), format!("doc {i}")))
            .collect();
        let experiment = Arc::new(Experiment::from_parts("cmd", json!({"k": 1}), batch_size, docs));
        let documents = experiment
            .documents
            .iter()
            .enumerate()
            .map(|(i, d)| InputDocument {
                name: d.name.clone(),
                hash: format!("{i:064x}"),
                bytes: d.bytes.clone(),
            })
            .collect();
        let report_hash = "f".repeat(64);
        PhaseInput {
            phase,
            run_id: Uuid::new_v4(),
            experiment,
            documents,
            artifacts: vec![InputArtifact {
                record: ArtifactRecord::new(
                    &report_hash,
                    VALIDATION_REPORT,
                    ShapeSignature::compute(b"{\"ok\":true}"),
                    &[],
                    Phase::Validation,
                ),
                bytes: b"{\"ok\":true}".to_vec(),
            }],
            indexes: vec![],
        }
    }

    #[tokio::test]
    async fn test_run_phase_parses_response() {
        let script = r#"cat > /dev/null; echo '{"artifacts":[{"artifact_type":"statistical_summary","payload":{"mean":1.5}}],"indexes":[]}'"#;
        let c = collaborator(Phase::Statistical, sh(script));
        let out = c.run_phase(&input(Phase::Statistical, 1)).await.unwrap();
        assert_eq!(out.artifacts.len(), 1);
        assert_eq!(out.artifacts[0].artifact_type, "statistical_summary");
        assert_eq!(out.artifacts[0].payload, br#"{"mean":1.5}"#.to_vec());
        assert!(out.indexes.is_empty());
    }

    #[tokio::test]
    async fn test_run_phase_sends_request_on_stdin() {
        // Echo the request back as a string payload.
        let script = r#"req=$(cat); printf '{"artifacts":[{"artifact_type":"echo","payload":%s}]}' "$req""#;
        let c = collaborator(Phase::Evidence, sh(script));
        let out = c.run_phase(&input(Phase::Evidence, 1)).await.unwrap();
        let request: Value = serde_json::from_slice(&out.artifacts[0].payload).unwrap();
        assert_eq!(request["mode"], "phase");
        assert_eq!(request["phase"], "evidence");
        assert_eq!(request["documents"].as_array().unwrap().len(), 5);
        assert_eq!(request["artifacts"][0]["payload"]["ok"], true);
    }

    #[tokio::test]
    async fn test_exit_codes_classify_failures() {
        let c = collaborator(Phase::Synthesis, sh("echo busy >&2; exit 75"));
        let err = c.run_phase(&input(Phase::Synthesis, 1)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("busy"));

        let c = collaborator(Phase::Synthesis, sh("echo bad input >&2; exit 3"));
        let err = c.run_phase(&input(Phase::Synthesis, 1)).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("exited with 3"));
        assert!(err.to_string().contains("bad input"));
    }

    #[tokio::test]
    async fn test_missing_command_is_deterministic() {
        let c = CommandCollaborator::new(CairnToml::default(), std::env::temp_dir());
        let err = c.run_phase(&input(Phase::Validation, 1)).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("no command configured"));

        let c = collaborator(Phase::Validation, vec!["/nonexistent/cairn-worker".into()]);
        let err = c.run_phase(&input(Phase::Validation, 1)).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_invalid_json_response() {
        let c = collaborator(Phase::Statistical, sh("cat > /dev/null; echo not json"));
        let err = c.run_phase(&input(Phase::Statistical, 1)).await.unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn test_plan_units_batches_documents() {
        let c = collaborator(Phase::Analysis, sh("true"));
        let units = c.plan_units(&input(Phase::Analysis, 2)).await.unwrap();
        assert_eq!(units.len(), 3);
        let report = "f".repeat(64);
        for unit in &units {
            assert_eq!(unit.dependencies[0], report);
        }
        assert_eq!(units[0].dependencies.len(), 3);
        assert_eq!(units[2].dependencies.len(), 2);
        let payload: Value = serde_json::from_slice(&units[1].payload).unwrap();
        assert_eq!(payload["batch"], 1);
        assert_eq!(payload["documents"][0]["name"], "d2.txt");
        assert_eq!(payload["params"]["k"], 1);
    }

    #[tokio::test]
    async fn test_plan_units_requires_report() {
        let c = collaborator(Phase::Analysis, sh("true"));
        let mut input = input(Phase::Analysis, 2);
        input.artifacts.clear();
        assert!(c.plan_units(&input).await.is_err());
    }

    #[tokio::test]
    async fn test_run_unit_returns_stdout() {
        let c = collaborator(Phase::Analysis, sh(r#"cat > /dev/null; echo '{"batch":0,"findings":[1,2]}'"#));
        let out = c.run_unit(Phase::Analysis, br#"{"batch":0}"#).await.unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["findings"][1], 2);

        let c = collaborator(Phase::Analysis, sh("cat > /dev/null"));
        assert!(c.run_unit(Phase::Analysis, b"{}").await.is_err());
    }

    #[tokio::test]
    async fn test_probe_defaults_to_doc_count() {
        let c = CommandCollaborator::new(CairnToml::default(), std::env::temp_dir());
        let index = IndexManifest::new("docs", Phase::Evidence, &[], json!({}), 7);
        assert_eq!(c.probe_index(Phase::Evidence, &index).await.unwrap(), 7);

        let mut config = CairnToml::default();
        config.phases.insert(
            "evidence".into(),
            PhaseOverride {
                probe_command: Some(sh(r#"cat > /dev/null; echo '{"hits":2}'"#)),
                ..Default::default()
            },
        );
        let c = CommandCollaborator::new(config, std::env::temp_dir());
        assert_eq!(c.probe_index(Phase::Evidence, &index).await.unwrap(), 2);
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        let s = "é".repeat(10);
        assert!(tail(&s, 5).chars().all(|c| c == 'é'));
    }
}
