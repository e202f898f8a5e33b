//! Integration tests for the cairn CLI.
//!
//! Phase collaborators are small `sh` snippets configured in
//! `.cairn/cairn.toml`, so these tests exercise the full command path:
//! config loading, experiment discovery, process collaborators, the local
//! worker pool and manifest persistence.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a cairn Command rooted at `root`
fn cairn(root: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("cairn");
    cmd.arg("--root").arg(root).env_remove("CAIRN_LOG");
    cmd
}

const CONFIG: &str = r#"
[defaults]
max_parallel = 2
timeout_secs = 30

[phases.validation]
command = ["sh", "-c", '''cat > /dev/null; echo '{"artifacts":[{"artifact_type":"validation_report","payload":{"valid":true}}]}' ''']

[phases.analysis]
command = ["sh", "-c", "cat"]

[phases.statistical]
command = ["sh", "-c", '''cat > /dev/null; echo '{"artifacts":[{"artifact_type":"statistical_summary","payload":{"mean":0.5,"p_value":0.04}}]}' ''']

[phases.evidence]
command = ["sh", "-c", '''cat > /dev/null; echo '{"indexes":[{"name":"docs","config":{"top_k":5},"doc_count":4}]}' ''']

[phases.synthesis]
command = ["sh", "-c", '''cat > /dev/null; echo '{"artifacts":[{"artifact_type":"synthesis_report","payload":{"summary":"ok"}}]}' ''']
"#;

/// Evidence phase that finds nothing.
const NO_EVIDENCE: &str = r#"
[phases.evidence]
command = ["sh", "-c", '''cat > /dev/null; echo '{"indexes":[]}' ''']
"#;

/// Create a state root with config and a four-document experiment.
fn setup(config: &str) -> (TempDir, std::path::PathBuf) {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join(".cairn")).unwrap();
    fs::write(root.path().join(".cairn/cairn.toml"), config).unwrap();

    let experiment = root.path().join("trial");
    fs::create_dir_all(experiment.join("documents")).unwrap();
    fs::write(
        experiment.join("experiment.toml"),
        "name = \"trial\"\nbatch_size = 2\n\n[params]\nalpha = 0.05\n",
    )
    .unwrap();
    for (i, text) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
        fs::write(experiment.join(format!("documents/{i}.txt")), text).unwrap();
    }
    (root, experiment)
}

fn latest_manifest(root: &Path) -> Value {
    let output = cairn(root).args(["status", "--json"]).output().unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_cairn_help() {
        cargo_bin_cmd!("cairn")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("verify"));
    }

    #[test]
    fn test_cairn_version() {
        cargo_bin_cmd!("cairn").arg("--version").assert().success();
    }

    #[test]
    fn test_runs_empty() {
        let root = TempDir::new().unwrap();
        cairn(root.path())
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded"));
    }

    #[test]
    fn test_status_without_runs_fails() {
        let root = TempDir::new().unwrap();
        cairn(root.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No runs recorded yet"));
    }

    #[test]
    fn test_invalid_phase_name_rejected() {
        let (root, experiment) = setup(CONFIG);
        cairn(root.path())
            .arg("run")
            .arg(&experiment)
            .args(["--from", "bogus"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid phase"));
    }

    #[test]
    fn test_missing_experiment_fails() {
        let root = TempDir::new().unwrap();
        cairn(root.path())
            .arg("run")
            .arg(root.path().join("nowhere"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("experiment.toml"));
    }
}

mod pipeline {
    use super::*;

    #[test]
    fn test_full_run_records_manifest() {
        let (root, experiment) = setup(CONFIG);

        cairn(root.path())
            .arg("run")
            .arg(&experiment)
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed"));

        let manifest = latest_manifest(root.path());
        assert_eq!(manifest["status"], "completed");
        assert_eq!(manifest["experiment"], "trial");
        assert_eq!(manifest["inputs"].as_array().unwrap().len(), 4);
        assert_eq!(manifest["artifacts"].as_array().unwrap().len(), 5);
        assert_eq!(manifest["phases"]["analysis"]["planned_units"], 2);
        assert_eq!(manifest["index_manifests"][0]["doc_count"], 4);

        let run_id = manifest["run_id"].as_str().unwrap();
        let run_dir = root.path().join(".cairn/runs").join(run_id);
        assert!(run_dir.join("manifest.json").exists());
        assert!(run_dir.join("completions.jsonl").exists());
        assert!(run_dir.join("logs/analysis.log").exists());
        assert!(run_dir.join("logs/run.log").exists());

        cairn(root.path())
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains(run_id));
        cairn(root.path())
            .args(["status", &run_id[..8]])
            .assert()
            .success()
            .stdout(predicate::str::contains("Evidence count: 4"));
        cairn(root.path())
            .arg("verify")
            .assert()
            .success()
            .stdout(predicate::str::contains("verified"));
    }

    #[test]
    fn test_resume_skips_cached_phases() {
        let (root, experiment) = setup(CONFIG);
        cairn(root.path()).arg("run").arg(&experiment).assert().success();
        let first = latest_manifest(root.path());

        cairn(root.path())
            .arg("run")
            .arg(&experiment)
            .arg("--resume")
            .assert()
            .success();
        let second = latest_manifest(root.path());

        assert_eq!(second["resumed_from"], first["run_id"]);
        for phase in ["validation", "analysis", "statistical", "evidence", "synthesis"] {
            assert_eq!(second["phases"][phase]["state"], "skipped_cached", "{phase}");
        }
        assert_eq!(second["artifacts"], first["artifacts"]);
    }

    #[test]
    fn test_resume_after_input_change_fails() {
        let (root, experiment) = setup(CONFIG);
        cairn(root.path()).arg("run").arg(&experiment).assert().success();

        fs::write(experiment.join("documents/0.txt"), "revised").unwrap();
        cairn(root.path())
            .arg("run")
            .arg(&experiment)
            .arg("--resume")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cannot resume"));
    }

    #[test]
    fn test_zero_evidence_blocks_synthesis() {
        let config = CONFIG.replace("[phases.evidence]", "[phases.evidence_unused]") + NO_EVIDENCE;
        let (root, experiment) = setup(&config);

        cairn(root.path())
            .arg("run")
            .arg(&experiment)
            .assert()
            .failure()
            .stderr(predicate::str::contains("evidence count is 0"));
        let failed = latest_manifest(root.path());
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["failure"]["phase"], "synthesis");
        assert_eq!(failed["failure"]["kind"], "preflight_violation");
        assert_eq!(failed["phases"]["synthesis"]["state"], "failed");
        assert!(failed["artifacts"]
            .as_array()
            .unwrap()
            .iter()
            .all(|a| a["artifact_type"] != "synthesis_report"));

        cairn(root.path())
            .arg("run")
            .arg(&experiment)
            .args(["--resume", "--no-evidence"])
            .assert()
            .success();
        let manifest = latest_manifest(root.path());
        assert_eq!(manifest["status"], "completed");
        assert_eq!(manifest["phases"]["evidence"]["state"], "skipped_cached");
    }

    #[test]
    fn test_partial_range() {
        let (root, experiment) = setup(CONFIG);
        cairn(root.path())
            .arg("run")
            .arg(&experiment)
            .args(["--from", "validation", "--to", "statistical"])
            .assert()
            .success();
        let manifest = latest_manifest(root.path());
        assert_eq!(manifest["phases"]["statistical"]["state"], "completed");
        assert_eq!(manifest["phases"]["evidence"]["state"], "pending");
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (root, experiment) = setup(CONFIG);
        cairn(root.path()).arg("run").arg(&experiment).assert().success();
        let manifest = latest_manifest(root.path());

        let hash = manifest["artifacts"][0]["hash"].as_str().unwrap();
        let object = root
            .path()
            .join(".cairn/store")
            .join(&hash[..2])
            .join(hash);
        fs::write(&object, "corrupted").unwrap();

        cairn(root.path())
            .arg("verify")
            .assert()
            .failure()
            .stdout(predicate::str::contains("Integrity"));
    }
}
