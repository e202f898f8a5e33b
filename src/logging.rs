//! Tracing setup for the CLI.
//!
//! Human-readable events go to stderr, filtered by `CAIRN_LOG` (falling back
//! to the verbosity flag). During a run, a JSON copy of every event is also
//! written to `runs/<run_id>/logs/run.log`.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_ENV: &str = "CAIRN_LOG";
pub const RUN_LOG_FILE: &str = "run.log";

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "cairn=info",
        1 => "cairn=debug",
        _ => "cairn=trace",
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the run log on drop and must be held until the
/// run finishes.
pub fn init(verbose: u8, run_log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match run_log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, RUN_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}
