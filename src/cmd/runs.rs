//! Run listing, status and verification commands.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use cairn::manifest::{IndexManifest, RunManifest, RunStatus, RunStore};
use cairn::phase::Phase;
use cairn::store::ContentStore;

use super::load_config;

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn styled_status(status: RunStatus) -> console::StyledObject<String> {
    let s = status.to_string();
    match status {
        RunStatus::Completed => style(s).green(),
        RunStatus::Failed => style(s).red(),
        RunStatus::Aborted => style(s).yellow(),
        RunStatus::Running => style(s).cyan(),
    }
}

/// Resolve `run` (id or prefix), or the latest run when absent.
fn resolve(runs: &RunStore, run: Option<&str>) -> Result<RunManifest> {
    match run {
        Some(reference) => runs
            .resolve(reference)
            .with_context(|| format!("No unique run matches '{reference}'")),
        None => match runs.list()?.into_iter().next() {
            Some(latest) => Ok(latest),
            None => bail!("No runs recorded yet. Run 'cairn run <experiment>' first."),
        },
    }
}

pub fn cmd_runs(root: &Path, experiment: Option<&str>) -> Result<()> {
    let config = load_config(root)?;
    let runs = RunStore::new(config.runs_dir());
    let manifests = match experiment {
        Some(name) => runs.list_for(name)?,
        None => runs.list()?,
    };

    if manifests.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:<14} {:<20}",
        "Run", "Experiment", "Status", "Range", "Started"
    );
    for m in &manifests {
        println!(
            "{:<38} {:<20} {:<10} {:<14} {:<20}",
            m.run_id.to_string(),
            m.experiment,
            styled_status(m.status),
            format!("{}..{}", m.from_phase.as_str(), m.to_phase.as_str()),
            m.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn cmd_status(root: &Path, run: Option<&str>, json: bool) -> Result<()> {
    let config = load_config(root)?;
    let runs = RunStore::new(config.runs_dir());
    let manifest = resolve(&runs, run)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!();
    println!("Run:        {}", style(manifest.run_id).cyan());
    println!("Experiment: {}", manifest.experiment);
    println!("Status:     {}", styled_status(manifest.status));
    println!("Source:     {}", short(&manifest.source_state_marker));
    if let Some(prior) = manifest.resumed_from {
        println!("Resumed:    {}", prior);
    }
    if !manifest.overrides.is_empty() {
        let overrides: Vec<&str> = manifest.overrides.iter().map(String::as_str).collect();
        println!("Overrides:  {}", overrides.join(", "));
    }
    println!();

    for phase in Phase::ALL {
        let Some(record) = manifest.phase(phase) else {
            continue;
        };
        let mut detail = format!("{} artifact(s)", record.artifacts.len());
        if !record.indexes.is_empty() {
            detail.push_str(&format!(", {} index(es)", record.indexes.len()));
        }
        if let Some(planned) = record.planned_units {
            detail.push_str(&format!(", {planned} unit(s)"));
        }
        if record.attempts > 1 {
            detail.push_str(&format!(", {} attempts", record.attempts));
        }
        println!(
            "  {:<12} {:<15} {}",
            phase.as_str(),
            record.state.to_string(),
            style(detail).dim()
        );
        for violation in &record.violations {
            println!("      {}", style(violation).red());
        }
        if let Some(error) = &record.error {
            println!("      {}", style(error).red());
        }
    }
    println!();
    println!("Evidence count: {}", manifest.evidence_count());

    if let Some(failure) = &manifest.failure {
        println!();
        println!(
            "{} {:?} in {}",
            style("Failure:").red().bold(),
            failure.kind,
            failure.phase.map_or("run", |p| p.as_str())
        );
        println!("  {}", failure.message);
        if !failure.missing_tasks.is_empty() {
            println!("  Missing tasks:");
            for task in &failure.missing_tasks {
                println!("    {}", task);
            }
        }
    }
    println!();
    Ok(())
}

pub fn cmd_verify(root: &Path, run: Option<&str>) -> Result<()> {
    let config = load_config(root)?;
    let runs = RunStore::new(config.runs_dir());
    let store = ContentStore::open(config.store_dir()).context("Failed to open content store")?;
    let manifest = resolve(&runs, run)?;

    let problems = verify_manifest(&store, &manifest);
    let checked = manifest.inputs.len() + manifest.artifacts.len() + manifest.index_manifests.len();
    let stored = store.list().context("Failed to list content store")?.len();
    if problems.is_empty() {
        println!(
            "{} Run {} verified ({} entries, {} objects in store)",
            style("✓").green().bold(),
            manifest.run_id,
            checked,
            stored
        );
        return Ok(());
    }

    for problem in &problems {
        println!("{} {}", style("✗").red().bold(), problem);
    }
    bail!(
        "Run {} failed verification with {} problem(s)",
        manifest.run_id,
        problems.len()
    )
}

/// Every problem found in `manifest` and the store content it references.
fn verify_manifest(store: &ContentStore, manifest: &RunManifest) -> Vec<String> {
    let mut problems = Vec::new();
    if !manifest.is_finalized() {
        problems.push(format!("manifest is not finalized (status {})", manifest.status));
    } else if !manifest.verify_digest() {
        problems.push("manifest digest does not match its content".to_string());
    }

    for input in &manifest.inputs {
        if let Err(e) = store.verify(&input.hash) {
            problems.push(format!("input '{}': {}", input.name, e));
        }
    }
    for artifact in &manifest.artifacts {
        if let Err(e) = store.verify(&artifact.hash) {
            problems.push(format!("{} {}: {}", artifact.artifact_type, short(&artifact.hash), e));
        }
    }
    for index in &manifest.index_manifests {
        if IndexManifest::fingerprint(&index.input_hashes, &index.config) != index.fingerprint {
            problems.push(format!("index '{}': fingerprint mismatch", index.name));
        }
    }
    problems
}
