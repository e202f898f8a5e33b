//! CLI command implementations.
//!
//! | Module | Commands handled           |
//! |--------|----------------------------|
//! | `run`  | `Run`                      |
//! | `runs` | `Runs`, `Status`, `Verify` |

pub mod run;
pub mod runs;

pub use run::cmd_run;
pub use runs::{cmd_runs, cmd_status, cmd_verify};

use anyhow::{Context, Result};
use cairn::config::CairnConfig;
use std::path::Path;

pub(crate) const STATE_DIR: &str = ".cairn";

/// Load `<root>/.cairn` configuration with environment overrides.
pub(crate) fn load_config(root: &Path) -> Result<CairnConfig> {
    CairnConfig::load(root.join(STATE_DIR))
        .with_context(|| format!("Failed to load configuration under {}", root.display()))
}
