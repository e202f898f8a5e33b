//! Phase-scoped journal files.
//!
//! Each run keeps one append-only file per phase at `logs/<phase>.log`, with
//! one `phase|attempt|status|timestamp` line per state transition.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::phase::Phase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub phase: String,
    pub attempt: u32,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

pub struct PhaseJournal {
    log_dir: PathBuf,
}

impl PhaseJournal {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    fn path(&self, phase: Phase) -> PathBuf {
        self.log_dir.join(format!("{}.log", phase.as_str()))
    }

    pub fn record(&self, phase: Phase, attempt: u32, status: &str) -> Result<()> {
        fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        let entry = format!(
            "{}|{}|{}|{}\n",
            phase,
            attempt,
            status,
            Utc::now().to_rfc3339()
        );
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(phase))
            .context("Failed to open phase journal")?
            .write_all(entry.as_bytes())
            .context("Failed to write journal entry")?;
        Ok(())
    }

    pub fn entries(&self, phase: Phase) -> Result<Vec<JournalEntry>> {
        let path = self.path(phase);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).context("Failed to read phase journal")?;
        Ok(content
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split('|').collect();
                if parts.len() != 4 {
                    return None;
                }
                Some(JournalEntry {
                    phase: parts[0].to_string(),
                    attempt: parts[1].parse().unwrap_or(0),
                    status: parts[2].to_string(),
                    timestamp: DateTime::parse_from_rfc3339(parts[3])
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect())
    }

    /// Last status recorded for `phase`.
    pub fn last_status(&self, phase: Phase) -> Option<String> {
        self.entries(phase).ok()?.pop().map(|e| e.status)
    }
}
