//! Orchestrator - drives one run through the frame state machine
//!
//! One frame and one attempt are in flight at a time. Every phase transition
//! is validated against the phase table and followed by a ledger snapshot, so
//! a killed process resumes from the last completed step.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::adapter::{AuditRequest, FrameAuditor, FrameGenerator, GenerationRequest, GenerationResult};
use crate::config::Config;
use crate::domain::{
    AttemptOutcome, FinalStatus, FrameStatus, NewAttempt, Phase, PhaseTransitionError, ReasonCode, RunStatus,
    generate_run_id, now_ms, primary_reason,
};
use crate::events::{EventLogger, RunEvent};
use crate::report::{StopReport, save_report};
use crate::retry::{LadderDecision, RetryDecision, RetryLadder, RetryTable};
use crate::state::{
    AttemptLedger, ConfigSnapshot, LedgerError, ResumeDecision, RunPaths, StateStore, StoreError, config_hash,
    decide_resumption, decide_resumption_for_run, write_json_atomic,
};

use super::prompt::{PromptContext, PromptRenderer};
use super::reference::{find_next_pending_frame, has_sequence_gaps, select_reference};
use super::stop::{StopReason, StopVerdict, compute_statistics, evaluate};

/// Fatal orchestrator errors
///
/// Anything here ends the run with status `failed`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    InvalidTransition(#[from] PhaseTransitionError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("prompt template error: {0}")]
    Prompt(#[from] handlebars::RenderError),

    #[error("no candidate for frame {frame} in phase {phase}")]
    MissingCandidate { frame: usize, phase: Phase },
}

/// How a run is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Resume the latest run of the configured sequence if possible, else start fresh
    Auto { force: bool },
    /// Always start a new run
    Fresh,
    /// Resume a specific run or refuse
    Resume { run_id: String, force: bool },
}

impl Default for StartMode {
    fn default() -> Self {
        StartMode::Auto { force: false }
    }
}

/// Cooperative abort flag, checked before every loop iteration
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        info!("abort requested");
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every frame resolved
    Completed {
        run_id: String,
        approved: usize,
        failed: usize,
        total_attempts: u32,
    },
    /// Halted early; resumable
    Stopped {
        run_id: String,
        reason: StopReason,
        report_path: PathBuf,
    },
    /// Fatal error
    Failed {
        run_id: Option<String>,
        phase: Phase,
        frame: Option<usize>,
        cause: String,
    },
    /// Nothing to resume
    Refused { reason: String },
}

impl RunOutcome {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunOutcome::Completed { run_id, .. } | RunOutcome::Stopped { run_id, .. } => Some(run_id),
            RunOutcome::Failed { run_id, .. } => run_id.as_deref(),
            RunOutcome::Refused { .. } => None,
        }
    }
}

/// Drives runs of the configured sequence
pub struct Orchestrator {
    config: Config,
    runs_dir: PathBuf,
    store: Arc<dyn StateStore>,
    generator: Arc<dyn FrameGenerator>,
    auditor: Arc<dyn FrameAuditor>,
    ladder: RetryLadder,
    abort: AbortHandle,
    mode: StartMode,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn StateStore>,
        generator: Arc<dyn FrameGenerator>,
        auditor: Arc<dyn FrameAuditor>,
    ) -> Self {
        debug!(identity_key = %config.identity_key(), "Orchestrator::new: called");
        Self {
            runs_dir: config.storage.runs_dir.clone(),
            ladder: RetryLadder::from_config(&config.retry),
            config,
            store,
            generator,
            auditor,
            abort: AbortHandle::new(),
            mode: StartMode::default(),
        }
    }

    /// Builder method to set the start mode
    pub fn with_mode(mut self, mode: StartMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method to override the runs directory
    pub fn with_runs_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = runs_dir.into();
        self
    }

    /// Builder method to share an abort flag
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run until the sequence completes, halts or hits a fatal error
    pub async fn run(&self) -> RunOutcome {
        debug!(mode = ?self.mode, runs_dir = ?self.runs_dir, "Orchestrator::run: called");

        let mut session = match self.open_session().await {
            Ok(SessionStart::Ready(session)) => session,
            Ok(SessionStart::Refused(reason)) => {
                info!(%reason, "run refused");
                return RunOutcome::Refused { reason };
            }
            Err(e) => {
                error!(error = %e, "failed to initialize run");
                return RunOutcome::Failed {
                    run_id: None,
                    phase: Phase::Init,
                    frame: None,
                    cause: e.to_string(),
                };
            }
        };

        match session.drive().await {
            Ok(outcome) => outcome,
            Err(e) => session.fail(e).await,
        }
    }

    async fn open_session(&self) -> Result<SessionStart, OrchestratorError> {
        match &self.mode {
            StartMode::Fresh => Ok(SessionStart::Ready(self.fresh_session().await?)),
            StartMode::Auto { force } => {
                let decision = decide_resumption(&self.runs_dir, &self.config, *force).await?;
                if decision.can_resume {
                    return self.adopt_session(decision).await;
                }
                if decision.config_mismatch {
                    warn!(reason = %decision.reason, "config changed since the last run, starting a new run");
                } else {
                    info!(reason = %decision.reason, "starting a new run");
                }
                Ok(SessionStart::Ready(self.fresh_session().await?))
            }
            StartMode::Resume { run_id, force } => {
                let decision = decide_resumption_for_run(&self.runs_dir, run_id, &self.config, *force).await?;
                if !decision.can_resume {
                    return Ok(SessionStart::Refused(decision.reason));
                }
                self.adopt_session(decision).await
            }
        }
    }

    /// INIT for a new run: folder, immutable config snapshot, fresh ledger
    async fn fresh_session(&self) -> Result<RunSession, OrchestratorError> {
        let identity_key = self.config.identity_key();
        let run_id = generate_run_id();
        let paths = RunPaths::new(&self.runs_dir, &identity_key, &run_id);
        debug!(%run_id, dir = ?paths.dir, "Orchestrator::fresh_session: called");

        let candidates = paths.candidates();
        tokio::fs::create_dir_all(&candidates)
            .await
            .map_err(|e| StoreError::io(&candidates, e))?;

        let fingerprint = self.config.run_fingerprint();
        let snapshot = ConfigSnapshot {
            identity_key: identity_key.clone(),
            config_hash: config_hash(&fingerprint),
            config: fingerprint,
            created_at: now_ms(),
        };
        write_json_atomic(&paths.config_snapshot(), &snapshot).await?;

        let ledger = AttemptLedger::initialize(run_id.clone(), self.config.sequence.total_frames)
            .with_status(RunStatus::InProgress)?;

        let mut events = EventLogger::new(paths.events());
        events.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            identity_key: identity_key.clone(),
            total_frames: ledger.total_frames(),
            resumed: false,
        });
        info!(%run_id, %identity_key, total_frames = ledger.total_frames(), "started new run");

        Ok(self.session(identity_key, paths, ledger, RetryTable::new(&self.config.retry), 0, events))
    }

    /// INIT for a resumed run: load the ledger, reopen it, rebuild retry history
    async fn adopt_session(&self, decision: ResumeDecision) -> Result<SessionStart, OrchestratorError> {
        let Some(existing) = decision.existing_run else {
            return Ok(SessionStart::Refused("no run to resume".to_string()));
        };
        debug!(run_id = %existing.run_id, "Orchestrator::adopt_session: called");

        let paths = RunPaths::from_dir(&existing.run_path);
        let Some(ledger) = self.store.load(&paths.dir).await? else {
            return Ok(SessionStart::Refused(format!(
                "run {} has no state snapshot",
                existing.run_id
            )));
        };
        let reopened: Vec<usize> = ledger
            .run
            .frame_states
            .iter()
            .filter(|f| f.status == FrameStatus::Failed)
            .map(|f| f.index)
            .collect();
        let ledger = ledger.reopen().with_status(RunStatus::InProgress)?;

        // Ladder history only covers attempts made since the frame was reopened
        let mut retry = RetryTable::new(&self.config.retry);
        for frame in ledger.run.unaccepted_frames() {
            if let Some(entry) = ledger.frame_attempts(frame)
                && !entry.current_budget().is_empty()
            {
                retry.rehydrate(frame, entry.current_budget());
            }
        }

        let frame = decision
            .first_pending_frame
            .or_else(|| find_next_pending_frame(&ledger.run))
            .unwrap_or(0);

        let mut events = EventLogger::new(paths.events());
        events.emit(RunEvent::RunStarted {
            run_id: existing.run_id.clone(),
            identity_key: existing.identity_key.clone(),
            total_frames: ledger.total_frames(),
            resumed: true,
        });
        if decision.config_mismatch {
            warn!(run_id = %existing.run_id, "resuming with a changed config, keeping the original config snapshot");
            events.emit(RunEvent::Warning {
                message: "config changed since the run started; resumed with --force, original config.json kept"
                    .to_string(),
            });
        }
        if !reopened.is_empty() {
            info!(run_id = %existing.run_id, ?reopened, "failed frames reopened with a fresh attempt budget");
            events.emit(RunEvent::Warning {
                message: format!("failed frames reopened for another pass: {:?}", reopened),
            });
        }
        if !decision.corrupted_frames.is_empty() {
            events.emit(RunEvent::Warning {
                message: format!(
                    "approved frames with missing or empty artifacts: {:?}",
                    decision.corrupted_frames
                ),
            });
        }
        info!(run_id = %existing.run_id, frame, attempts = ledger.total_attempts, "resuming run");

        Ok(SessionStart::Ready(self.session(
            existing.identity_key,
            paths,
            ledger,
            retry,
            frame,
            events,
        )))
    }

    fn session(
        &self,
        identity_key: String,
        paths: RunPaths,
        ledger: AttemptLedger,
        retry: RetryTable,
        frame: usize,
        events: EventLogger,
    ) -> RunSession {
        RunSession {
            config: self.config.clone(),
            store: self.store.clone(),
            generator: self.generator.clone(),
            auditor: self.auditor.clone(),
            ladder: self.ladder.clone(),
            abort: self.abort.clone(),
            prompts: PromptRenderer::new(),
            identity_key,
            paths,
            phase: ledger.run.phase,
            ledger,
            retry,
            frame,
            pending_retry: None,
            candidate: None,
            events,
        }
    }
}

enum SessionStart {
    Ready(RunSession),
    Refused(String),
}

/// Output of GENERATING handed to AUDITING and APPROVING
#[derive(Debug, Clone)]
struct Candidate {
    attempt: u32,
    /// None when generation failed
    artifact: Option<String>,
    reference: String,
}

/// One adopted or fresh run being driven
struct RunSession {
    config: Config,
    store: Arc<dyn StateStore>,
    generator: Arc<dyn FrameGenerator>,
    auditor: Arc<dyn FrameAuditor>,
    ladder: RetryLadder,
    abort: AbortHandle,
    prompts: PromptRenderer,
    identity_key: String,
    paths: RunPaths,
    ledger: AttemptLedger,
    retry: RetryTable,
    phase: Phase,
    frame: usize,
    pending_retry: Option<RetryDecision>,
    candidate: Option<Candidate>,
    events: EventLogger,
}

impl RunSession {
    async fn drive(&mut self) -> Result<RunOutcome, OrchestratorError> {
        debug!(run_id = %self.ledger.run_id(), frame = self.frame, "RunSession::drive: called");
        self.persist().await?;
        if self.abort.is_requested() {
            return self.halt_on_abort().await;
        }
        self.transition(Phase::Generating).await?;

        loop {
            if self.abort.is_requested() {
                return self.halt_on_abort().await;
            }
            match self.phase {
                Phase::Generating => self.generate().await?,
                Phase::Auditing => self.audit().await?,
                Phase::RetryDeciding => self.decide_retry().await?,
                Phase::Approving => self.approve().await?,
                Phase::NextFrame => {
                    if let Some(outcome) = self.next_frame().await? {
                        return Ok(outcome);
                    }
                }
                phase @ (Phase::Init | Phase::Stopped | Phase::Completed) => {
                    // The loop only ever sees working phases
                    return Err(PhaseTransitionError {
                        from: phase,
                        to: Phase::Generating,
                    }
                    .into());
                }
            }
        }
    }

    /// GENERATING: resolve the reference, call the generator, record a pending attempt
    async fn generate(&mut self) -> Result<(), OrchestratorError> {
        let frame = self.frame;
        self.update(|l| l.start_frame(frame))?;

        let retry = self.pending_retry.take();
        let action = retry.as_ref().map(|d| d.action);
        let force_reset = retry.as_ref().is_some_and(|d| d.force_reset);
        let accepted = self.ledger.run.accepted_artifacts();
        if retry.is_none() && has_sequence_gaps(&accepted, frame) {
            warn!(frame, "generating past frames that were not accepted");
            self.events.emit(RunEvent::Warning {
                message: format!("frame {} generated with unaccepted frames before it", frame),
            });
        }
        let selection = select_reference(frame, &accepted, &self.config.sequence.baseline, force_reset);

        let attempt = self.ledger.attempt_count(frame) + 1;
        debug!(frame, attempt, ?action, source = %selection.source, "RunSession::generate: called");

        let context = PromptContext::new(
            &self.config.sequence.character,
            &self.config.sequence.animation,
            frame,
            self.ledger.total_frames(),
            &selection,
            action,
        );
        let prompt = self.prompts.render(&self.config.sequence.prompt_template, &context)?;

        let request = GenerationRequest {
            run_id: self.ledger.run_id().to_string(),
            frame_index: frame,
            attempt_index: attempt,
            total_frames: self.ledger.total_frames(),
            reference: selection.reference.clone(),
            reference_source: selection.source,
            prompt,
            retry_action: action,
            output_path: self
                .paths
                .candidates()
                .join(format!("frame_{:03}_attempt_{:02}.png", frame, attempt)),
        };

        let started = Instant::now();
        let result = self.generator.generate(&request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (artifact, seed) = match &result {
            GenerationResult::Generated { artifact, seed, .. } => (Some(artifact.clone()), *seed),
            GenerationResult::Failed { message, .. } => {
                warn!(frame, attempt, %message, "generation failed");
                (None, None)
            }
        };

        let record = NewAttempt::new(result.raw_prompt())
            .with_seed(seed)
            .with_duration_ms(duration_ms)
            .with_retry_strategy(action);
        self.update(|l| l.record_attempt(frame, record))?;
        if let Some(action) = action {
            self.retry.state_mut(frame).record_action_tried(action);
        }

        self.events.emit(RunEvent::AttemptGenerated {
            frame,
            attempt,
            reference_source: selection.source,
            retry_action: action,
            generated: artifact.is_some(),
        });

        self.candidate = Some(Candidate {
            attempt,
            artifact,
            reference: selection.reference,
        });
        self.transition(Phase::Auditing).await
    }

    /// AUDITING: judge the candidate and feed the result to the retry history
    async fn audit(&mut self) -> Result<(), OrchestratorError> {
        let frame = self.frame;
        let candidate = self.candidate.clone().ok_or(OrchestratorError::MissingCandidate {
            frame,
            phase: self.phase,
        })?;
        debug!(frame, attempt = candidate.attempt, "RunSession::audit: called");

        let outcome = match &candidate.artifact {
            Some(artifact) => {
                let request = AuditRequest {
                    run_id: self.ledger.run_id().to_string(),
                    frame_index: frame,
                    attempt_index: candidate.attempt,
                    candidate: artifact.clone(),
                    reference: candidate.reference.clone(),
                    baseline: self.config.sequence.baseline.clone(),
                };
                self.auditor.audit(&request).await.into_outcome()
            }
            None => AttemptOutcome::generation_failed(),
        };

        let passed = outcome.passed();
        let score = outcome.ladder_score();
        let result = outcome.result;
        let reason_codes = outcome.reason_codes.clone();
        let composite_score = outcome.composite_score;
        self.update(|l| l.update_attempt_result(frame, outcome))?;

        let history = self.retry.state_mut(frame);
        if let Some(score) = score {
            history.record_score(score);
        }
        history.record_outcome(passed);

        self.events.emit(RunEvent::AttemptAudited {
            frame,
            attempt: candidate.attempt,
            result,
            reason_codes,
            composite_score,
        });

        if passed {
            info!(frame, attempt = candidate.attempt, ?score, "candidate passed audit");
            self.transition(Phase::Approving).await
        } else {
            debug!(frame, attempt = candidate.attempt, %result, "candidate failed audit");
            self.candidate = None;
            self.transition(Phase::RetryDeciding).await
        }
    }

    /// RETRY_DECIDING: attempt cap first, then the ladder
    async fn decide_retry(&mut self) -> Result<(), OrchestratorError> {
        let frame = self.frame;
        let attempt = self.ledger.attempt_count(frame);
        debug!(frame, attempt, "RunSession::decide_retry: called");

        if self
            .ledger
            .is_max_attempts_reached(frame, self.config.retry.max_attempts_per_frame)
        {
            self.replace(|l| l.mark_max_attempts_reached(frame));
            self.finish_failed_frame(frame, FinalStatus::Failed);
            return self.transition(Phase::NextFrame).await;
        }

        let reason = self
            .ledger
            .frame_attempts(frame)
            .and_then(|f| f.latest())
            .map(|r| primary_reason(&r.reason_codes))
            .unwrap_or(ReasonCode::Unclassified);

        let history = self.retry.state_mut(frame);
        match self.ladder.get_next_action(history, frame, reason, attempt) {
            LadderDecision::Retry(decision) => {
                self.events.emit(RunEvent::RetryScheduled {
                    frame,
                    attempt,
                    reason,
                    action: decision.action,
                });
                self.pending_retry = Some(decision);
                self.transition(Phase::Generating).await
            }
            LadderDecision::Stop(stop) => {
                let why = format!("{}: {}", stop.stop_reason, stop.detail);
                self.replace(|l| l.mark_rejected(frame, why));
                self.finish_failed_frame(frame, FinalStatus::Rejected);
                self.transition(Phase::NextFrame).await
            }
        }
    }

    fn finish_failed_frame(&mut self, frame: usize, status: FinalStatus) {
        let reason = self
            .ledger
            .frame_attempts(frame)
            .and_then(|f| f.final_reason.clone())
            .unwrap_or_default();
        self.events.emit(RunEvent::FrameFailed {
            frame,
            attempts: self.ledger.attempt_count(frame),
            status,
            reason,
        });
    }

    /// APPROVING: commit the candidate as the frame's accepted artifact
    async fn approve(&mut self) -> Result<(), OrchestratorError> {
        let frame = self.frame;
        let artifact = self
            .candidate
            .take()
            .and_then(|c| c.artifact)
            .ok_or(OrchestratorError::MissingCandidate {
                frame,
                phase: self.phase,
            })?;
        debug!(frame, %artifact, "RunSession::approve: called");

        self.update(|l| l.mark_approved(frame, artifact.clone()))?;
        self.retry.reset_frame_retry_state(frame);
        self.events.emit(RunEvent::FrameApproved {
            frame,
            attempts: self.ledger.attempt_count(frame),
            artifact,
        });
        self.transition(Phase::NextFrame).await
    }

    /// NEXT_FRAME: complete, halt on a stop condition, or advance
    async fn next_frame(&mut self) -> Result<Option<RunOutcome>, OrchestratorError> {
        debug!(frame = self.frame, "RunSession::next_frame: called");

        if self.ledger.run.all_approved() {
            return self.complete().await.map(Some);
        }

        let verdict = evaluate(&self.ledger, &self.config.stop_conditions);
        if verdict.should_stop
            && let Some(reason) = verdict.reason
        {
            return self.halt(reason, verdict).await.map(Some);
        }

        if self.ledger.run.all_resolved() {
            return self.complete().await.map(Some);
        }

        match find_next_pending_frame(&self.ledger.run) {
            Some(next) => {
                debug!(from = self.frame, to = next, "RunSession::next_frame: advancing");
                self.frame = next;
                self.pending_retry = None;
                self.candidate = None;
                self.transition(Phase::Generating).await?;
                Ok(None)
            }
            None => self.complete().await.map(Some),
        }
    }

    async fn complete(&mut self) -> Result<RunOutcome, OrchestratorError> {
        self.update(|l| l.with_status(RunStatus::Completed))?;
        self.transition(Phase::Completed).await?;

        let approved = self.ledger.run.approved_frames().len();
        let failed = self.ledger.total_frames() - approved;
        let total_attempts = self.ledger.total_attempts;
        self.events.emit(RunEvent::RunCompleted {
            approved,
            failed,
            total_attempts,
        });
        info!(run_id = %self.ledger.run_id(), approved, failed, total_attempts, "run completed");

        Ok(RunOutcome::Completed {
            run_id: self.ledger.run_id().to_string(),
            approved,
            failed,
            total_attempts,
        })
    }

    async fn halt_on_abort(&mut self) -> Result<RunOutcome, OrchestratorError> {
        warn!(run_id = %self.ledger.run_id(), phase = %self.phase, frame = self.frame, "honoring abort request");
        let verdict = StopVerdict {
            should_stop: true,
            reason: Some(StopReason::UserAbort),
            threshold: None,
            actual: None,
            statistics: compute_statistics(&self.ledger, &self.config.stop_conditions),
        };
        self.halt(StopReason::UserAbort, verdict).await
    }

    /// STOPPED: write the diagnostic report and pause the run
    async fn halt(&mut self, reason: StopReason, verdict: StopVerdict) -> Result<RunOutcome, OrchestratorError> {
        debug!(%reason, threshold = ?verdict.threshold, actual = ?verdict.actual, "RunSession::halt: called");
        let report = StopReport::build(&self.ledger, &self.identity_key, reason, &verdict);
        let report_path = self.paths.report();
        save_report(&report_path, &report).await?;

        let message = report.message.clone();
        self.update(|l| l.with_stop_reason(message).with_status(RunStatus::Paused))?;
        self.transition(Phase::Stopped).await?;

        self.events.emit(RunEvent::RunStopped {
            reason,
            threshold: verdict.threshold,
            actual: verdict.actual,
        });
        warn!(run_id = %self.ledger.run_id(), %reason, message = %report.message, "run stopped");

        Ok(RunOutcome::Stopped {
            run_id: self.ledger.run_id().to_string(),
            reason,
            report_path,
        })
    }

    /// Record a fatal error; persisting it is best effort
    async fn fail(&mut self, err: OrchestratorError) -> RunOutcome {
        let phase = self.phase;
        let frame = Some(self.frame);
        let cause = err.to_string();
        error!(run_id = %self.ledger.run_id(), %phase, ?frame, %cause, "run failed");

        self.replace(|l| l.with_fatal(phase, frame, cause.clone()));
        if let Err(e) = self.store.save(&self.paths.dir, &self.ledger).await {
            error!(error = %e, "failed to persist fatal state");
        }
        self.events.emit(RunEvent::RunFailed {
            phase,
            frame,
            cause: cause.clone(),
        });

        RunOutcome::Failed {
            run_id: Some(self.ledger.run_id().to_string()),
            phase,
            frame,
            cause,
        }
    }

    /// Validated transition followed by a snapshot
    async fn transition(&mut self, to: Phase) -> Result<(), OrchestratorError> {
        let from = self.phase;
        self.phase = PhaseTransitionError::check(from, to)?;
        debug!(%from, %to, frame = self.frame, "RunSession::transition: called");
        self.replace(|l| l.with_phase(to));
        self.persist().await?;
        self.events.emit(RunEvent::PhaseChanged {
            from,
            to,
            frame: self.frame,
        });
        Ok(())
    }

    async fn persist(&self) -> Result<(), OrchestratorError> {
        self.store.save(&self.paths.dir, &self.ledger).await?;
        Ok(())
    }

    /// Apply a fallible ledger update; the current snapshot survives a failure
    fn update(&mut self, f: impl FnOnce(AttemptLedger) -> Result<AttemptLedger, LedgerError>) -> Result<(), LedgerError> {
        self.ledger = f(self.ledger.clone())?;
        Ok(())
    }

    fn replace(&mut self, f: impl FnOnce(AttemptLedger) -> AttemptLedger) {
        self.ledger = f(self.ledger.clone());
    }
}
