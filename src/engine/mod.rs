//! Phase engine: drives a run through the ordered phases.
//!
//! For every phase in the requested range the engine either reuses the
//! outputs of a compatible prior run (`skipped_cached`), or runs preflight,
//! executes the phase through the [`Collaborator`] (directly, or fanned out
//! through the [`TaskCoordinator`] for parallel phases), writes the outputs
//! through the content store and records them in the run manifest.
//!
//! The first failure halts the run. The manifest is persisted with a failure
//! record (phase, kind, message, violations, missing task ids) before the
//! error is returned.

mod collaborator;
mod command;

pub use collaborator::{
    Collaborator, IndexBuild, InputArtifact, InputDocument, PhaseInput, PhaseOutput,
    ProducedArtifact,
};
pub use command::CommandCollaborator;

use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{CairnToml, DispatchMode, PhaseSettings};
use crate::coordinator::{
    AbortHandle, AbortSignal, CallbackServer, CompletionLog, LocalWorkerPool, SpoolDispatcher,
    TaskCoordinator, WorkUnit,
};
use crate::errors::{CoordinationError, EngineError, FailureKind, StoreError, WorkError};
use crate::experiment::Experiment;
use crate::journal::PhaseJournal;
use crate::manifest::{
    ArtifactRecord, IndexHealth, IndexManifest, NO_EVIDENCE_OVERRIDE, RunFailure, RunManifest,
    RunStatus, RunStore,
};
use crate::phase::{INPUT_DOCUMENT, Phase, PhaseState};
use crate::preflight::PreflightValidator;
use crate::shape::ShapeSignature;
use crate::store::ContentStore;
use collaborator::CollaboratorUnits;

pub const COMPLETIONS_FILE: &str = "completions.jsonl";
pub const QUEUE_DIR: &str = "queue";

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub experiment: Arc<Experiment>,
    pub from: Phase,
    pub to: Phase,
    /// Reuse outputs from the most recent compatible run
    pub resume: bool,
    /// Resume from this run (id or unique prefix) instead of the latest
    pub run_ref: Option<String>,
    /// Id for the new run; generated when absent
    pub run_id: Option<Uuid>,
    pub force_recompute: bool,
    /// Allow synthesis without evidence
    pub no_evidence: bool,
}

impl RunRequest {
    pub fn new(experiment: Arc<Experiment>) -> Self {
        Self {
            experiment,
            from: Phase::Validation,
            to: Phase::Synthesis,
            resume: false,
            run_ref: None,
            run_id: None,
            force_recompute: false,
            no_evidence: false,
        }
    }

    pub fn range(mut self, from: Phase, to: Phase) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn resume_from(mut self, run_ref: impl Into<String>) -> Self {
        self.resume = true;
        self.run_ref = Some(run_ref.into());
        self
    }

    pub fn force_recompute(mut self, force: bool) -> Self {
        self.force_recompute = force;
        self
    }

    pub fn no_evidence(mut self, allow: bool) -> Self {
        self.no_evidence = allow;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// A completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub manifest: RunManifest,
    pub manifest_path: PathBuf,
}

impl RunOutcome {
    /// The most recently recorded artifact of `artifact_type`.
    pub fn artifact(&self, artifact_type: &str) -> Option<&ArtifactRecord> {
        self.manifest.artifacts_of_type(artifact_type).last()
    }
}

struct FanOut {
    coordinator: TaskCoordinator,
    _server: Option<CallbackServer>,
}

struct RunContext {
    run_id: Uuid,
    experiment: Arc<Experiment>,
    prior: Option<RunManifest>,
    force_recompute: bool,
    journal: PhaseJournal,
    signal: AbortSignal,
    run_dir: PathBuf,
    fan_out: Option<FanOut>,
}

pub struct PhaseEngine {
    store: ContentStore,
    runs: RunStore,
    config: CairnToml,
    collaborator: Arc<dyn Collaborator>,
    abort: AbortHandle,
}

impl PhaseEngine {
    pub fn new(
        store: ContentStore,
        runs: RunStore,
        config: CairnToml,
        collaborator: Arc<dyn Collaborator>,
    ) -> Self {
        Self {
            store,
            runs,
            config,
            collaborator,
            abort: AbortHandle::new(),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// Handle that aborts any run in progress on this engine.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Execute a run to completion or first failure.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, EngineError> {
        if request.from > request.to {
            return Err(EngineError::InvalidRange {
                from: request.from,
                to: request.to,
            });
        }
        let marker = request.experiment.source_state_marker();
        let prior = if request.resume {
            Some(self.find_prior(&request, &marker)?)
        } else {
            None
        };
        let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);
        let span = tracing::info_span!("run", %run_id, experiment = %request.experiment.name);
        self.run_owned(request, marker, prior, run_id)
            .instrument(span)
            .await
    }

    /// Latest compatible prior run, honoring `run_ref`.
    fn find_prior(&self, request: &RunRequest, marker: &str) -> Result<RunManifest, EngineError> {
        if let Some(run_ref) = &request.run_ref {
            let prior = self.runs.resolve(run_ref)?;
            if prior.source_state_marker != marker {
                return Err(EngineError::ResumeIncompatible {
                    prior_run: prior.run_id,
                    prior_marker: prior.source_state_marker,
                    current_marker: marker.to_string(),
                });
            }
            return Ok(prior);
        }

        let runs = self.runs.list_for(&request.experiment.name)?;
        if let Some(prior) = runs.iter().find(|m| m.source_state_marker == marker) {
            return Ok(prior.clone());
        }
        match runs.into_iter().next() {
            Some(latest) => Err(EngineError::ResumeIncompatible {
                prior_run: latest.run_id,
                prior_marker: latest.source_state_marker,
                current_marker: marker.to_string(),
            }),
            None => Err(EngineError::NoPriorRun {
                experiment: request.experiment.name.clone(),
            }),
        }
    }

    async fn run_owned(
        &self,
        request: RunRequest,
        marker: String,
        prior: Option<RunManifest>,
        run_id: Uuid,
    ) -> Result<RunOutcome, EngineError> {
        let _lock = self.runs.lock(run_id)?;
        let run_dir = self.runs.run_dir(run_id);

        let mut manifest = RunManifest::new(
            run_id,
            &request.experiment.name,
            &marker,
            request.from,
            request.to,
        );
        manifest.resumed_from = prior.as_ref().map(|p| p.run_id);
        if request.no_evidence {
            manifest.set_override(NO_EVIDENCE_OVERRIDE)?;
        }
        self.runs.save(&manifest)?;
        tracing::info!(
            from = %request.from,
            to = %request.to,
            resumed_from = ?manifest.resumed_from,
            "run started"
        );

        let mut ctx = RunContext {
            run_id,
            experiment: request.experiment.clone(),
            prior,
            force_recompute: request.force_recompute || self.config.defaults.force_recompute,
            journal: PhaseJournal::new(run_dir.join("logs")),
            signal: self.abort.signal(),
            run_dir,
            fan_out: None,
        };
        let mut current = None;
        let result = self
            .execute(&mut ctx, &mut manifest, request.from, request.to, &mut current)
            .await;
        drop(ctx.fan_out.take());

        match result {
            Ok(()) => {
                manifest.finalize(RunStatus::Completed)?;
                let manifest_path = self.runs.save(&manifest)?;
                tracing::info!(artifacts = manifest.artifacts.len(), "run completed");
                Ok(RunOutcome {
                    run_id,
                    manifest,
                    manifest_path,
                })
            }
            Err(e) => {
                self.record_failure(&ctx, &mut manifest, current, &e);
                if let Err(save_err) = self.runs.save(&manifest) {
                    tracing::error!(error = %save_err, "failed to persist failed manifest");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        manifest: &mut RunManifest,
        from: Phase,
        to: Phase,
        current: &mut Option<Phase>,
    ) -> Result<(), EngineError> {
        for doc in &ctx.experiment.documents {
            let meta = self.store.put_artifact(&doc.bytes, INPUT_DOCUMENT, &[])?;
            manifest.record_input(&doc.name, &meta.content_hash)?;
        }
        self.runs.save(manifest)?;

        // Earlier phases come from the prior run so later phases see inputs.
        if let Some(prior) = &ctx.prior {
            for phase in Phase::before(from) {
                if self.cache_valid(prior, phase)? {
                    manifest.copy_phase_from(prior, phase)?;
                    journal(&ctx.journal, phase, 0, "skipped_cached");
                } else {
                    tracing::warn!(%phase, prior_run = %prior.run_id, "prior run has no usable outputs");
                }
            }
            self.runs.save(manifest)?;
        }

        for phase in Phase::range(from, to) {
            *current = Some(phase);
            if ctx.signal.is_aborted() {
                return Err(EngineError::Aborted {
                    run_id: ctx.run_id,
                    phase,
                });
            }
            let span = tracing::info_span!("phase", %phase);
            self.run_phase(ctx, manifest, phase).instrument(span).await?;
        }
        *current = None;
        Ok(())
    }

    async fn run_phase(
        &self,
        ctx: &mut RunContext,
        manifest: &mut RunManifest,
        phase: Phase,
    ) -> Result<(), EngineError> {
        if !ctx.force_recompute
            && let Some(prior) = &ctx.prior
            && self.cache_valid(prior, phase)?
        {
            manifest.copy_phase_from(prior, phase)?;
            self.runs.save(manifest)?;
            journal(&ctx.journal, phase, 0, "skipped_cached");
            tracing::info!(prior_run = %prior.run_id, "phase outputs reused");
            return Ok(());
        }

        let settings = self.config.phase_settings(phase);
        {
            let record = manifest.phase_mut(phase)?;
            record.state = PhaseState::Running;
            record.started_at = Some(Utc::now());
        }
        self.runs.save(manifest)?;
        journal(&ctx.journal, phase, 1, "running");

        let violations = PreflightValidator::new(&self.store).check(
            phase,
            manifest,
            &settings.required_sections,
        )?;
        if !violations.is_empty() {
            return Err(EngineError::Preflight { phase, violations });
        }

        let input = self.phase_input(ctx, manifest, phase)?;
        if settings.parallel {
            self.run_parallel(ctx, manifest, &input, &settings).await?;
        } else {
            self.run_single(ctx, manifest, &input, &settings).await?;
        }

        let record = manifest.phase_mut(phase)?;
        record.state = PhaseState::Completed;
        record.finished_at = Some(Utc::now());
        let attempts = record.attempts;
        let produced = record.artifacts.len();
        self.runs.save(manifest)?;
        journal(&ctx.journal, phase, attempts, "completed");
        tracing::info!(attempts, artifacts = produced, "phase completed");
        Ok(())
    }

    async fn run_single(
        &self,
        ctx: &mut RunContext,
        manifest: &mut RunManifest,
        input: &PhaseInput,
        settings: &PhaseSettings,
    ) -> Result<(), EngineError> {
        let phase = input.phase;
        let (output, attempts) = self
            .with_retries(ctx, phase, settings, || self.collaborator.run_phase(input))
            .await?;
        manifest.phase_mut(phase)?.attempts = attempts;

        let default_deps = input.primary_hashes();
        for produced in output.artifacts {
            let deps = if produced.dependencies.is_empty() {
                default_deps.clone()
            } else {
                produced.dependencies
            };
            let meta = self
                .store
                .put_artifact(&produced.payload, &produced.artifact_type, &deps)?;
            self.record_stored(manifest, phase, &produced.artifact_type, &meta.content_hash, &deps)?;
        }

        for build in output.indexes {
            let index = IndexManifest::new(
                &build.name,
                phase,
                &build.input_hashes,
                build.config,
                build.doc_count,
            );
            let health = match self.collaborator.probe_index(phase, &index).await {
                Ok(hits) => IndexHealth::from_hits(hits),
                Err(e) => IndexHealth::failed(e.to_string()),
            };
            tracing::info!(
                index = %index.name,
                doc_count = index.doc_count,
                healthy = health.passed,
                "index recorded"
            );
            manifest.record_index(index.with_health(health))?;
        }
        self.runs.save(manifest)?;
        Ok(())
    }

    async fn run_parallel(
        &self,
        ctx: &mut RunContext,
        manifest: &mut RunManifest,
        input: &PhaseInput,
        settings: &PhaseSettings,
    ) -> Result<(), EngineError> {
        let phase = input.phase;
        let run_id = ctx.run_id;
        let (mut units, _) = self
            .with_retries(ctx, phase, settings, || self.collaborator.plan_units(input))
            .await?;
        let default_deps = input.primary_hashes();
        for unit in &mut units {
            if unit.dependencies.is_empty() {
                unit.dependencies = default_deps.clone();
            }
        }
        manifest.phase_mut(phase)?.planned_units = Some(units.len());
        self.runs.save(manifest)?;
        if units.is_empty() {
            tracing::warn!("no work units planned");
            return Ok(());
        }

        let mut signal = ctx.signal.clone();
        let fan_out = match ctx.fan_out.take() {
            Some(fan_out) => fan_out,
            None => self.build_fan_out(&ctx.run_dir).await?,
        };
        let fan_out = ctx.fan_out.insert(fan_out);

        let mut results: Vec<Option<String>> = vec![None; units.len()];
        let mut pending: Vec<usize> = (0..units.len()).collect();
        let mut round = 0u32;
        loop {
            round += 1;
            let batch: Vec<WorkUnit> = pending.iter().map(|&i| units[i].clone()).collect();
            let outcome = fan_out
                .coordinator
                .fan_out(phase, &batch, settings.timeout, &signal)
                .await
                .map_err(|e| match e {
                    CoordinationError::Aborted { .. } => EngineError::Aborted { run_id, phase },
                    other => other.into(),
                })?;
            {
                let record = manifest.phase_mut(phase)?;
                record.attempts = round;
                record.tasks.extend(outcome.tasks.iter().map(|t| t.task_id));
            }
            for unit in &outcome.succeeded {
                results[pending[unit.index]] = Some(unit.result_hash.clone());
            }
            if outcome.all_succeeded() {
                break;
            }

            if outcome.all_retryable() && round <= settings.max_retries {
                let failed: Vec<usize> = outcome.failed.iter().map(|f| pending[f.index]).collect();
                tracing::warn!(round, failed = failed.len(), "re-dispatching failed units");
                journal(&ctx.journal, phase, round, "retrying");
                if sleep_or_abort(&mut signal, settings.backoff_for(round)).await {
                    return Err(EngineError::Aborted { run_id, phase });
                }
                pending = failed;
                continue;
            }
            return Err(EngineError::WorkerFailure {
                phase,
                failures: outcome.failures(),
            });
        }

        let mut unit_results: Vec<String> = Vec::with_capacity(units.len());
        for (i, result) in results.into_iter().enumerate() {
            let Some(hash) = result else { continue };
            if unit_results.contains(&hash) {
                tracing::debug!(%hash, unit = i, "unit result shared with an earlier unit");
            } else {
                // Store metadata is write-once; whichever unit stored first owns it.
                let dependencies = match self.store.meta(&hash)? {
                    Some(meta) => meta.dependency_hashes,
                    None => units[i].dependencies.clone(),
                };
                self.record_stored(manifest, phase, phase.output_type(), &hash, &dependencies)?;
            }
            unit_results.push(hash);
        }
        manifest.phase_mut(phase)?.unit_results = unit_results;
        self.runs.save(manifest)?;
        Ok(())
    }

    /// Call a collaborator operation, retrying transient failures with
    /// exponential backoff. Returns the value and the number of attempts.
    async fn with_retries<T, F, Fut>(
        &self,
        ctx: &mut RunContext,
        phase: Phase,
        settings: &PhaseSettings,
        mut call: F,
    ) -> Result<(T, u32), EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                result = call() => result,
                _ = ctx.signal.aborted() => {
                    return Err(EngineError::Aborted { run_id: ctx.run_id, phase });
                }
            };
            match result {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_transient() && attempt <= settings.max_retries => {
                    tracing::warn!(attempt, error = %e, "transient failure, retrying");
                    journal(&ctx.journal, phase, attempt, "retrying");
                    if sleep_or_abort(&mut ctx.signal, settings.backoff_for(attempt)).await {
                        return Err(EngineError::Aborted {
                            run_id: ctx.run_id,
                            phase,
                        });
                    }
                }
                Err(e) => {
                    return Err(EngineError::Collaborator {
                        phase,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    async fn build_fan_out(&self, run_dir: &Path) -> Result<FanOut, EngineError> {
        let log = CompletionLog::open(&run_dir.join(COMPLETIONS_FILE))?;
        match self.config.defaults.dispatch {
            DispatchMode::Local => {
                let pool = LocalWorkerPool::new(
                    Arc::new(CollaboratorUnits(self.collaborator.clone())),
                    self.store.clone(),
                    log.clone(),
                    self.config.defaults.max_parallel,
                );
                Ok(FanOut {
                    coordinator: TaskCoordinator::new(self.store.clone(), log, Arc::new(pool)),
                    _server: None,
                })
            }
            DispatchMode::Spool => {
                let mut server = CallbackServer::new(log.clone());
                let url = server
                    .start()
                    .await
                    .map_err(|e| CoordinationError::Server(format!("{e:#}")))?;
                let spool = SpoolDispatcher::new(run_dir.join(QUEUE_DIR), self.store.clone(), Some(url));
                Ok(FanOut {
                    coordinator: TaskCoordinator::new(self.store.clone(), log, Arc::new(spool)),
                    _server: Some(server),
                })
            }
        }
    }

    /// Record an artifact already in the store, computing its shape.
    fn record_stored(
        &self,
        manifest: &mut RunManifest,
        phase: Phase,
        artifact_type: &str,
        hash: &str,
        dependencies: &[String],
    ) -> Result<(), EngineError> {
        let bytes = self.store.get(hash)?;
        let shape = ShapeSignature::compute(&bytes);
        manifest.record_artifact(ArtifactRecord::new(hash, artifact_type, shape, dependencies, phase))?;
        self.runs.save(manifest)?;
        tracing::debug!(%hash, artifact_type, "artifact recorded");
        Ok(())
    }

    /// Whether `prior` holds usable outputs for `phase`.
    fn cache_valid(&self, prior: &RunManifest, phase: Phase) -> Result<bool, EngineError> {
        if !prior.phase_state(phase).is_satisfied() {
            return Ok(false);
        }
        for artifact in prior.artifacts_for_phase(phase) {
            match self.store.verify(&artifact.hash) {
                Ok(()) => {}
                Err(e @ (StoreError::NotFound { .. } | StoreError::Integrity { .. })) => {
                    tracing::warn!(%phase, error = %e, "cached artifact unusable");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn phase_input(
        &self,
        ctx: &RunContext,
        manifest: &RunManifest,
        phase: Phase,
    ) -> Result<PhaseInput, EngineError> {
        let mut documents = Vec::with_capacity(manifest.inputs.len());
        for input in &manifest.inputs {
            documents.push(InputDocument {
                name: input.name.clone(),
                hash: input.hash.clone(),
                bytes: self.store.get(&input.hash)?,
            });
        }
        let mut artifacts = Vec::new();
        for record in manifest.artifacts.iter().filter(|a| a.phase < phase) {
            artifacts.push(InputArtifact {
                record: record.clone(),
                bytes: self.store.get(&record.hash)?,
            });
        }
        Ok(PhaseInput {
            phase,
            run_id: ctx.run_id,
            experiment: ctx.experiment.clone(),
            documents,
            artifacts,
            indexes: manifest
                .index_manifests
                .iter()
                .filter(|i| i.phase < phase)
                .cloned()
                .collect(),
        })
    }

    fn record_failure(
        &self,
        ctx: &RunContext,
        manifest: &mut RunManifest,
        phase: Option<Phase>,
        error: &EngineError,
    ) {
        let kind = error.kind();
        let message = error.to_string();
        tracing::error!(phase = ?phase, ?kind, error = %message, "run failed");

        if let Some(phase) = phase
            && let Ok(record) = manifest.phase_mut(phase)
        {
            record.state = PhaseState::Failed;
            record.error = Some(message.clone());
            record.violations = error.violations().to_vec();
            record.finished_at = Some(Utc::now());
            journal(&ctx.journal, phase, record.attempts.max(1), "failed");
        }

        let failure = RunFailure {
            phase,
            kind,
            message,
            violations: error.violations().to_vec(),
            missing_tasks: error.missing_tasks().to_vec(),
        };
        let status = if kind == FailureKind::Aborted {
            RunStatus::Aborted
        } else {
            RunStatus::Failed
        };
        if let Err(e) = manifest.set_failure(failure) {
            tracing::warn!(error = %e, "could not record failure");
        }
        if let Err(e) = manifest.finalize(status) {
            tracing::warn!(error = %e, "could not finalize manifest");
        }
    }
}

fn journal(journal: &PhaseJournal, phase: Phase, attempt: u32, status: &str) {
    if let Err(e) = journal.record(phase, attempt, status) {
        tracing::warn!(%phase, error = %e, "failed to write phase journal");
    }
}

/// Sleep for `delay`; returns `true` if abort was requested first.
async fn sleep_or_abort(signal: &mut AbortSignal, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = signal.aborted() => true,
    }
}
