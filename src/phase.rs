//! Pipeline phases and per-phase run state.
//!
//! This module provides:
//! - `Phase`, the fixed, ordered phase sequence of a research pipeline
//! - `PhaseState`, the state of one phase within one run
//! - Artifact type names each phase produces and consumes

use serde::{Deserialize, Serialize};

/// Artifact type of raw experiment inputs.
pub const INPUT_DOCUMENT: &str = "input_document";
/// Artifact type produced by validation.
pub const VALIDATION_REPORT: &str = "validation_report";
/// Artifact type produced by each analysis work unit.
pub const ANALYSIS_BATCH: &str = "analysis_batch";
/// Artifact type produced by statistical aggregation.
pub const STATISTICAL_SUMMARY: &str = "statistical_summary";
/// Artifact type for optional evidence payloads.
pub const EVIDENCE_BUNDLE: &str = "evidence_bundle";
/// Artifact type produced by synthesis.
pub const SYNTHESIS_REPORT: &str = "synthesis_report";

/// One stage of the pipeline. Variant order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Check the input specification set
    Validation,
    /// Per-document analysis, fanned out to workers
    Analysis,
    /// Aggregate statistics over all analysis batches
    Statistical,
    /// Build retrieval indexes and gather evidence
    Evidence,
    /// Produce the final synthesis
    Synthesis,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 5] = [
        Phase::Validation,
        Phase::Analysis,
        Phase::Statistical,
        Phase::Evidence,
        Phase::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validation => "validation",
            Phase::Analysis => "analysis",
            Phase::Statistical => "statistical",
            Phase::Evidence => "evidence",
            Phase::Synthesis => "synthesis",
        }
    }

    /// Position in the phase sequence.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The phase immediately before this one.
    pub fn previous(&self) -> Option<Phase> {
        self.index().checked_sub(1).map(|i| Phase::ALL[i])
    }

    /// Phases `from..=to` in order; empty when `from` comes after `to`.
    pub fn range(from: Phase, to: Phase) -> Vec<Phase> {
        Phase::ALL
            .iter()
            .copied()
            .filter(|p| *p >= from && *p <= to)
            .collect()
    }

    /// Phases strictly before `phase`.
    pub fn before(phase: Phase) -> Vec<Phase> {
        Phase::ALL.iter().copied().filter(|p| *p < phase).collect()
    }

    /// Artifact type this phase primarily produces.
    pub fn output_type(&self) -> &'static str {
        match self {
            Phase::Validation => VALIDATION_REPORT,
            Phase::Analysis => ANALYSIS_BATCH,
            Phase::Statistical => STATISTICAL_SUMMARY,
            Phase::Evidence => EVIDENCE_BUNDLE,
            Phase::Synthesis => SYNTHESIS_REPORT,
        }
    }

    /// Artifact type this phase requires as its primary input.
    pub fn input_type(&self) -> &'static str {
        match self {
            Phase::Validation => INPUT_DOCUMENT,
            Phase::Analysis => VALIDATION_REPORT,
            Phase::Statistical => ANALYSIS_BATCH,
            Phase::Evidence | Phase::Synthesis => STATISTICAL_SUMMARY,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "validation" | "validate" => Ok(Phase::Validation),
            "analysis" | "analyze" => Ok(Phase::Analysis),
            "statistical" | "statistics" | "stats" => Ok(Phase::Statistical),
            "evidence" => Ok(Phase::Evidence),
            "synthesis" | "synthesize" => Ok(Phase::Synthesis),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: validation, analysis, statistical, evidence, synthesis",
                s
            ),
        }
    }
}

/// State of one phase within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Outputs reused from a prior compatible run
    SkippedCached,
}

impl PhaseState {
    /// Whether the phase has usable outputs.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PhaseState::Completed | PhaseState::SkippedCached)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseState::Completed | PhaseState::Failed | PhaseState::SkippedCached
        )
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseState::Pending => "pending",
            PhaseState::Running => "running",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
            PhaseState::SkippedCached => "skipped_cached",
        };
        f.write_str(s)
    }
}
