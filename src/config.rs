//! Configuration for cairn, read from `.cairn/cairn.toml`.
//!
//! Settings are layered: file → environment → CLI. Every phase starts from
//! `[defaults]` and may override any field under `[phases.<name>]`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [defaults]
//! timeout_secs = 1800
//! max_retries = 0
//! backoff_ms = 500
//! max_parallel = 4
//! force_recompute = false
//! dispatch = "local"
//!
//! [phases.analysis]
//! parallel = true
//! command = ["python3", "analyze.py"]
//! max_retries = 2
//! required_sections = ["documents"]
//!
//! [phases.evidence]
//! command = ["./build-index.sh"]
//! probe_command = ["./probe-index.sh"]
//! ```
//!
//! Environment overrides: `CAIRN_FORCE_RECOMPUTE`, `CAIRN_TASK_TIMEOUT_SECS`,
//! `CAIRN_MAX_PARALLEL`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::phase::Phase;

pub const CONFIG_FILE: &str = "cairn.toml";

/// How parallel phases reach their workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// In-process worker pool
    #[default]
    Local,
    /// Task files in the run's queue directory, completions over HTTP
    Spool,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Local => write!(f, "local"),
            DispatchMode::Spool => write!(f, "spool"),
        }
    }
}

/// Default settings for all phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Fan-in timeout per phase
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt, transient failures only
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Upper bound on concurrently running local workers
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Ignore cached phase outputs inside the requested range
    #[serde(default)]
    pub force_recompute: bool,
    #[serde(default)]
    pub dispatch: DispatchMode,
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_parallel() -> usize {
    4
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            backoff_ms: default_backoff_ms(),
            max_parallel: default_max_parallel(),
            force_recompute: false,
            dispatch: DispatchMode::default(),
        }
    }
}

/// Per-phase override settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    /// Fan the phase out over work units
    #[serde(default)]
    pub parallel: Option<bool>,
    /// Collaborator command (argv) for this phase
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Sample-query command for retrieval indexes built by this phase
    #[serde(default)]
    pub probe_command: Option<Vec<String>>,
    /// Sections the phase's primary input must carry
    #[serde(default)]
    pub required_sections: Vec<String>,
}

/// The complete cairn.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CairnToml {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Keyed by phase name
    #[serde(default)]
    pub phases: HashMap<String, PhaseOverride>,
}

impl CairnToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cairn.toml")
    }

    /// Load `<cairn_dir>/cairn.toml`, or defaults when it does not exist.
    pub fn load_or_default(cairn_dir: &Path) -> Result<Self> {
        let path = cairn_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cairn.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CAIRN_FORCE_RECOMPUTE") {
            self.defaults.force_recompute = parse_bool(&v);
        }
        if let Some(v) = lookup("CAIRN_TASK_TIMEOUT_SECS") {
            self.defaults.timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid CAIRN_TASK_TIMEOUT_SECS '{}'", v))?;
        }
        if let Some(v) = lookup("CAIRN_MAX_PARALLEL") {
            self.defaults.max_parallel = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid CAIRN_MAX_PARALLEL '{}'", v))?;
        }
        Ok(())
    }

    /// Effective settings for `phase`.
    pub fn phase_settings(&self, phase: Phase) -> PhaseSettings {
        let mut settings = PhaseSettings {
            timeout: Duration::from_secs(self.defaults.timeout_secs),
            max_retries: self.defaults.max_retries,
            backoff: Duration::from_millis(self.defaults.backoff_ms),
            parallel: phase == Phase::Analysis,
            command: None,
            probe_command: None,
            required_sections: Vec::new(),
        };

        if let Some(o) = self.phases.get(phase.as_str()) {
            if let Some(secs) = o.timeout_secs {
                settings.timeout = Duration::from_secs(secs);
            }
            if let Some(retries) = o.max_retries {
                settings.max_retries = retries;
            }
            if let Some(ms) = o.backoff_ms {
                settings.backoff = Duration::from_millis(ms);
            }
            if let Some(parallel) = o.parallel {
                settings.parallel = parallel;
            }
            settings.command = o.command.clone();
            settings.probe_command = o.probe_command.clone();
            settings.required_sections = o.required_sections.clone();
        }
        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.defaults.max_parallel == 0 {
            warnings.push("max_parallel is 0; using 1".to_string());
        }
        if self.defaults.timeout_secs == 0 {
            warnings.push("timeout_secs is 0; every fan-in will time out".to_string());
        }
        let mut names: Vec<&String> = self.phases.keys().collect();
        names.sort();
        for name in names {
            if Phase::ALL.iter().all(|p| p.as_str() != name) {
                warnings.push(format!("Unknown phase '{}' in [phases]", name));
            }
            if let Some(cmd) = self.phases[name].command.as_ref()
                && cmd.is_empty()
            {
                warnings.push(format!("Empty command for phase '{}'", name));
            }
        }
        warnings
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Resolved settings for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub parallel: bool,
    pub command: Option<Vec<String>>,
    pub probe_command: Option<Vec<String>>,
    pub required_sections: Vec<String>,
}

impl PhaseSettings {
    /// Delay before retry number `attempt` (1-based): `backoff * 2^(attempt-1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exp)
    }
}

/// Configuration combined with the state directory layout.
#[derive(Debug, Clone)]
pub struct CairnConfig {
    /// The `.cairn` state directory
    pub cairn_dir: PathBuf,
    pub toml: CairnToml,
}

impl CairnConfig {
    /// Load from `cairn_dir`, applying process environment overrides.
    pub fn load(cairn_dir: PathBuf) -> Result<Self> {
        Self::load_with_env(cairn_dir, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(cairn_dir: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut toml = CairnToml::load_or_default(&cairn_dir)?;
        toml.apply_env(lookup)?;
        for warning in toml.validate() {
            tracing::warn!("{}", warning);
        }
        Ok(Self { cairn_dir, toml })
    }

    pub fn store_dir(&self) -> PathBuf {
        self.cairn_dir.join("store")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.cairn_dir.join("runs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.cairn_dir.join(CONFIG_FILE)
    }

    pub fn phase_settings(&self, phase: Phase) -> PhaseSettings {
        self.toml.phase_settings(phase)
    }

    pub fn max_parallel(&self) -> usize {
        self.toml.defaults.max_parallel.max(1)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.store_dir()).context("Failed to create store directory")?;
        std::fs::create_dir_all(self.runs_dir()).context("Failed to create runs directory")?;
        Ok(())
    }
}
