use anyhow::{Context, Result};
use cairn::phase::Phase;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cairn")]
#[command(version, about = "Artifact-oriented research pipeline orchestrator")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); CAIRN_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory holding the .cairn state directory (defaults to the current directory)
    #[arg(long, global = true, env = "CAIRN_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an experiment through the pipeline
    Run(RunArgs),
    /// List recorded runs, newest first
    Runs {
        /// Only show runs of this experiment
        #[arg(short, long)]
        experiment: Option<String>,
    },
    /// Show the manifest summary of a run
    Status {
        /// Run id or unique prefix (defaults to the latest run)
        run: Option<String>,
        /// Print the full manifest as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a run's manifest digest and the integrity of its artifacts
    Verify {
        /// Run id or unique prefix (defaults to the latest run)
        run: Option<String>,
    },
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Experiment directory (experiment.toml and documents/)
    pub experiment: PathBuf,

    /// First phase to execute
    #[arg(long, default_value = "validation")]
    pub from: Phase,

    /// Last phase to execute
    #[arg(long, default_value = "synthesis")]
    pub to: Phase,

    /// Reuse outputs of the latest compatible run
    #[arg(long)]
    pub resume: bool,

    /// Resume from a specific run (id or unique prefix); implies --resume
    #[arg(long)]
    pub run_ref: Option<String>,

    /// Ignore cached outputs and execute every phase in range
    #[arg(long)]
    pub force_recompute: bool,

    /// Allow synthesis without retrieved evidence
    #[arg(long)]
    pub no_evidence: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let root = match cli.root.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&root, cli.verbose, args).await?,
        Commands::Runs { experiment } => {
            cairn::logging::init(cli.verbose, None)?;
            cmd::cmd_runs(&root, experiment.as_deref())?
        }
        Commands::Status { run, json } => {
            cairn::logging::init(cli.verbose, None)?;
            cmd::cmd_status(&root, run.as_deref(), *json)?
        }
        Commands::Verify { run } => {
            cairn::logging::init(cli.verbose, None)?;
            cmd::cmd_verify(&root, run.as_deref())?
        }
    }

    Ok(())
}
