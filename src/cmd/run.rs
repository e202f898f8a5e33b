//! The `run` command.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use cairn::engine::{CommandCollaborator, PhaseEngine, RunOutcome, RunRequest};
use cairn::experiment::Experiment;
use cairn::manifest::RunStore;
use cairn::phase::{Phase, PhaseState};
use cairn::store::ContentStore;

use super::super::RunArgs;
use super::{STATE_DIR, load_config};

pub async fn cmd_run(root: &Path, verbose: u8, args: &RunArgs) -> Result<()> {
    let run_id = Uuid::new_v4();
    let run_log_dir = root
        .join(STATE_DIR)
        .join("runs")
        .join(run_id.to_string())
        .join("logs");
    let _guard = cairn::logging::init(verbose, Some(&run_log_dir))?;

    let config = load_config(root)?;
    config.ensure_directories()?;
    let experiment = Experiment::load(&args.experiment)?;

    let store = ContentStore::open(config.store_dir()).context("Failed to open content store")?;
    let runs = RunStore::new(config.runs_dir());
    let collaborator = Arc::new(CommandCollaborator::new(
        config.toml.clone(),
        &args.experiment,
    ));
    let engine = PhaseEngine::new(store, runs.clone(), config.toml.clone(), collaborator);

    let abort = engine.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{} Aborting run...", style("!").yellow().bold());
            abort.abort();
        }
    });

    let mut request = RunRequest::new(Arc::new(experiment))
        .range(args.from, args.to)
        .force_recompute(args.force_recompute)
        .no_evidence(args.no_evidence)
        .with_run_id(run_id);
    if let Some(run_ref) = &args.run_ref {
        request = request.resume_from(run_ref.clone());
    } else if args.resume {
        request = request.resume();
    }

    println!();
    println!(
        "{} {} ({} → {})",
        style("Run").bold(),
        style(run_id).cyan(),
        args.from,
        args.to
    );

    match engine.run(request).await {
        Ok(outcome) => {
            print_summary(&outcome);
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", style("✗").red().bold(), e);
            for violation in e.violations() {
                eprintln!("    {}", violation);
            }
            if let Ok(manifest) = runs.load(run_id) {
                eprintln!("  Manifest: {}", runs.manifest_path(manifest.run_id).display());
            }
            Err(anyhow::Error::new(e).context(format!("Run {run_id} failed")))
        }
    }
}

fn print_summary(outcome: &RunOutcome) {
    let manifest = &outcome.manifest;
    println!();
    for phase in Phase::ALL {
        let state = manifest.phase_state(phase);
        let marker = match state {
            PhaseState::Completed => style("✓").green(),
            PhaseState::SkippedCached => style("↺").cyan(),
            PhaseState::Failed => style("✗").red(),
            _ => style("·").dim(),
        };
        let artifacts = manifest.phase(phase).map_or(0, |r| r.artifacts.len());
        println!(
            "  {} {:<12} {:<15} {} artifact(s)",
            marker,
            phase.as_str(),
            state.to_string(),
            artifacts
        );
    }
    println!();
    println!(
        "{} {} artifact(s), evidence count {}",
        style("✓ Completed").green().bold(),
        manifest.artifacts.len(),
        manifest.evidence_count()
    );
    if let Some(prior) = manifest.resumed_from {
        println!("  Resumed from: {}", prior);
    }
    println!("  Manifest: {}", outcome.manifest_path.display());
}
