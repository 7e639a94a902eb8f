//! Attempt ledger
//!
//! The ledger is the run state plus every attempt made for every frame. All
//! updates take the ledger by value and hand back the next snapshot, so the
//! orchestrator always holds exactly one consistent version to persist.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{
    AttemptOutcome, AttemptRecord, AttemptResult, FatalRecord, FinalStatus, FrameStatus, NewAttempt, Phase,
    RunState, RunStatus, StatusTransitionError, now_ms,
};

/// Errors from ledger misuse (programming errors, fatal to a run)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("frame {frame} out of range (total {total})")]
    FrameOutOfRange { frame: usize, total: usize },

    #[error("frame {frame} has no pending attempt to update")]
    NoPendingAttempt { frame: usize },

    #[error(transparent)]
    Status(#[from] StatusTransitionError),
}

/// Attempt history of one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameAttempts {
    pub attempts: Vec<AttemptRecord>,
    pub current_attempt: u32,
    #[serde(default)]
    pub final_status: Option<FinalStatus>,
    #[serde(default)]
    pub final_reason: Option<String>,
    /// Attempts recorded before the frame was last reopened by a resume
    #[serde(default)]
    pub reopened_at: u32,
}

impl FrameAttempts {
    /// Most recent attempt
    pub fn latest(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    /// Attempts made since the frame was last reopened
    pub fn current_budget(&self) -> &[AttemptRecord] {
        let start = (self.reopened_at as usize).min(self.attempts.len());
        &self.attempts[start..]
    }
}

/// Circuit breaker verdict
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub tripped: bool,
    pub total_attempts: u32,
    pub estimated_cost: f64,
    pub limit: u32,
}

/// Run state plus per-frame attempt history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLedger {
    pub run: RunState,
    pub total_attempts: u32,
    /// One entry per frame, index == frame index
    pub frames: Vec<FrameAttempts>,
}

impl AttemptLedger {
    /// Fresh ledger: every frame pending, zero attempts
    pub fn initialize(run_id: impl Into<String>, total_frames: usize) -> Self {
        let run = RunState::new(run_id, total_frames);
        info!(run_id = %run.run_id, total_frames, "AttemptLedger::initialize: called");
        Self {
            run,
            total_attempts: 0,
            frames: vec![FrameAttempts::default(); total_frames],
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn total_frames(&self) -> usize {
        self.run.total_frames
    }

    /// Attempt history for a frame
    pub fn frame_attempts(&self, frame: usize) -> Option<&FrameAttempts> {
        self.frames.get(frame)
    }

    /// Number of attempts recorded for a frame
    pub fn attempt_count(&self, frame: usize) -> u32 {
        self.frames.get(frame).map(|f| f.current_attempt).unwrap_or(0)
    }

    /// Append a pending attempt; its index is `current_attempt + 1`
    pub fn record_attempt(mut self, frame: usize, attempt: NewAttempt) -> Result<Self, LedgerError> {
        debug!(run_id = %self.run.run_id, frame, "AttemptLedger::record_attempt: called");
        self.check_frame(frame)?;
        let entry = &mut self.frames[frame];
        let attempt_index = entry.current_attempt + 1;
        entry.attempts.push(attempt.into_record(attempt_index));
        entry.current_attempt = attempt_index;
        self.total_attempts += 1;
        if let Some(state) = self.run.frame_mut(frame) {
            state.attempts = attempt_index;
        }
        self.run.updated_at = now_ms();
        debug!(frame, attempt_index, total = self.total_attempts, "AttemptLedger::record_attempt: recorded");
        Ok(self)
    }

    /// Fill in the audit outcome of the latest attempt
    ///
    /// Only a `pending` record can be filled; records are never rewritten.
    pub fn update_attempt_result(mut self, frame: usize, outcome: AttemptOutcome) -> Result<Self, LedgerError> {
        debug!(frame, result = %outcome.result, "AttemptLedger::update_attempt_result: called");
        self.check_frame(frame)?;
        let record = self.frames[frame]
            .attempts
            .last_mut()
            .filter(|r| r.result == AttemptResult::Pending)
            .ok_or(LedgerError::NoPendingAttempt { frame })?;
        record.result = outcome.result;
        record.reason_codes = outcome.reason_codes;
        record.composite_score = outcome.composite_score;
        record.identity_score = outcome.identity_score;
        self.run.updated_at = now_ms();
        Ok(self)
    }

    /// Attempts counted against the per-frame cap
    pub fn budget_attempt_count(&self, frame: usize) -> u32 {
        self.frames.get(frame).map(|f| f.current_budget().len() as u32).unwrap_or(0)
    }

    /// Check if a frame used up its attempts since it was last (re)opened
    pub fn is_max_attempts_reached(&self, frame: usize, max_attempts: u32) -> bool {
        let reached = self.budget_attempt_count(frame) >= max_attempts;
        debug!(frame, max_attempts, reached, "AttemptLedger::is_max_attempts_reached: called");
        reached
    }

    /// Mark a frame failed after hitting the attempt cap
    pub fn mark_max_attempts_reached(self, frame: usize) -> Self {
        let attempts = self.budget_attempt_count(frame);
        warn!(run_id = %self.run.run_id, frame, attempts, "frame reached max attempts, marking failed");
        self.finalize(frame, FinalStatus::Failed, format!("max attempts reached ({})", attempts))
    }

    /// Mark a frame rejected by the retry ladder
    pub fn mark_rejected(self, frame: usize, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(run_id = %self.run.run_id, frame, %reason, "frame rejected");
        self.finalize(frame, FinalStatus::Rejected, reason)
    }

    /// Commit an accepted candidate
    pub fn mark_approved(mut self, frame: usize, artifact: impl Into<String>) -> Result<Self, LedgerError> {
        let artifact = artifact.into();
        debug!(frame, %artifact, "AttemptLedger::mark_approved: called");
        self.check_frame(frame)?;
        if let Some(state) = self.run.frame_mut(frame) {
            state.status = FrameStatus::Approved;
            state.approved_artifact = Some(artifact);
            state.last_error = None;
        }
        let entry = &mut self.frames[frame];
        entry.final_status = Some(FinalStatus::Approved);
        entry.final_reason = None;
        self.run.updated_at = now_ms();
        Ok(self)
    }

    /// Mark a frame as being worked on
    pub fn start_frame(mut self, frame: usize) -> Result<Self, LedgerError> {
        debug!(frame, "AttemptLedger::start_frame: called");
        self.check_frame(frame)?;
        self.run.current_frame = frame;
        if let Some(state) = self.run.frame_mut(frame) {
            state.status = FrameStatus::InProgress;
        }
        self.run.updated_at = now_ms();
        Ok(self)
    }

    /// Record the phase of the latest transition
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.run.phase = phase;
        self.run.updated_at = now_ms();
        self
    }

    /// Move the run status forward
    pub fn with_status(mut self, status: RunStatus) -> Result<Self, LedgerError> {
        self.run.set_status(status)?;
        Ok(self)
    }

    /// Record why the run halted
    pub fn with_stop_reason(mut self, reason: impl Into<String>) -> Self {
        self.run.stop_reason = Some(reason.into());
        self.run.updated_at = now_ms();
        self
    }

    /// Record a fatal error and mark the run failed
    ///
    /// Never fails: a ledger that is already completed keeps its status.
    pub fn with_fatal(mut self, phase: Phase, frame: Option<usize>, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        if let Err(e) = self.run.set_status(RunStatus::Failed) {
            warn!(error = %e, "AttemptLedger::with_fatal: status not updated");
        }
        self.run.fatal = Some(FatalRecord {
            phase,
            frame,
            cause,
            at: now_ms(),
        });
        self
    }

    /// Prepare an adopted ledger for another pass
    ///
    /// Every frame not accepted yet goes back to pending. Failed and rejected
    /// frames lose their final status and get a fresh attempt budget; their
    /// attempt history and the global counter are untouched. Stale halt
    /// records are cleared.
    pub fn reopen(mut self) -> Self {
        debug!(run_id = %self.run.run_id, "AttemptLedger::reopen: called");
        for (state, entry) in self.run.frame_states.iter_mut().zip(self.frames.iter_mut()) {
            match state.status {
                FrameStatus::Approved | FrameStatus::Pending => {}
                FrameStatus::InProgress => {
                    debug!(frame = state.index, "AttemptLedger::reopen: frame back to pending");
                    state.status = FrameStatus::Pending;
                }
                FrameStatus::Failed => {
                    info!(frame = state.index, attempts = entry.current_attempt, final_status = ?entry.final_status, "reopening failed frame");
                    state.status = FrameStatus::Pending;
                    state.last_error = None;
                    entry.final_status = None;
                    entry.final_reason = None;
                    entry.reopened_at = entry.current_attempt;
                }
            }
        }
        self.run.stop_reason = None;
        self.run.fatal = None;
        self.run.phase = Phase::Init;
        self.run.updated_at = now_ms();
        self
    }

    /// Global spend check, independent of the active frame
    pub fn check_circuit_breaker(&self, limit: u32, cost_per_attempt: f64) -> CircuitBreakerStatus {
        let status = CircuitBreakerStatus {
            tripped: self.total_attempts >= limit,
            total_attempts: self.total_attempts,
            estimated_cost: f64::from(self.total_attempts) * cost_per_attempt,
            limit,
        };
        debug!(?status, "AttemptLedger::check_circuit_breaker: called");
        status
    }

    fn finalize(mut self, frame: usize, status: FinalStatus, reason: String) -> Self {
        if frame >= self.frames.len() {
            warn!(frame, "AttemptLedger::finalize: frame out of range, ignoring");
            return self;
        }
        let entry = &mut self.frames[frame];
        entry.final_status = Some(status);
        entry.final_reason = Some(reason.clone());
        if let Some(state) = self.run.frame_mut(frame) {
            state.status = FrameStatus::Failed;
            state.last_error = Some(reason);
        }
        self.run.updated_at = now_ms();
        self
    }

    fn check_frame(&self, frame: usize) -> Result<(), LedgerError> {
        if frame < self.frames.len() {
            Ok(())
        } else {
            Err(LedgerError::FrameOutOfRange {
                frame,
                total: self.frames.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReasonCode;
    use proptest::prelude::*;

    fn failed() -> AttemptOutcome {
        AttemptOutcome::from_verdict(false, vec![ReasonCode::IdentityDrift], Some(0.5), None)
    }

    #[test]
    fn test_initialize() {
        let ledger = AttemptLedger::initialize("run-1", 3);
        assert_eq!(ledger.total_attempts, 0);
        assert_eq!(ledger.frames.len(), 3);
        assert_eq!(ledger.run.frame_states.len(), 3);
        assert_eq!(ledger.attempt_count(2), 0);
    }

    #[test]
    fn test_record_attempt_increments_counters() {
        let ledger = AttemptLedger::initialize("run-1", 2)
            .record_attempt(0, NewAttempt::new("p"))
            .unwrap()
            .record_attempt(0, NewAttempt::new("p"))
            .unwrap()
            .record_attempt(1, NewAttempt::new("p"))
            .unwrap();

        assert_eq!(ledger.total_attempts, 3);
        assert_eq!(ledger.attempt_count(0), 2);
        assert_eq!(ledger.attempt_count(1), 1);
        assert_eq!(ledger.run.frame_states[0].attempts, 2);
        let indices: Vec<u32> = ledger.frames[0].attempts.iter().map(|a| a.attempt_index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_record_attempt_out_of_range() {
        let err = AttemptLedger::initialize("run-1", 2)
            .record_attempt(5, NewAttempt::new("p"))
            .unwrap_err();
        assert_eq!(err, LedgerError::FrameOutOfRange { frame: 5, total: 2 });
    }

    #[test]
    fn test_update_only_pending_record() {
        let ledger = AttemptLedger::initialize("run-1", 1)
            .record_attempt(0, NewAttempt::new("p"))
            .unwrap()
            .update_attempt_result(0, failed())
            .unwrap();

        let record = ledger.frames[0].latest().unwrap();
        assert_eq!(record.result, AttemptResult::SoftFail);
        assert_eq!(record.composite_score, Some(0.5));

        let err = ledger.update_attempt_result(0, failed()).unwrap_err();
        assert_eq!(err, LedgerError::NoPendingAttempt { frame: 0 });
    }

    #[test]
    fn test_max_attempts_and_mark_failed() {
        let mut ledger = AttemptLedger::initialize("run-1", 1);
        for _ in 0..3 {
            ledger = ledger.record_attempt(0, NewAttempt::new("p")).unwrap();
        }
        assert!(!ledger.is_max_attempts_reached(0, 4));
        assert!(ledger.is_max_attempts_reached(0, 3));

        let ledger = ledger.mark_max_attempts_reached(0);
        assert_eq!(ledger.frames[0].final_status, Some(FinalStatus::Failed));
        assert_eq!(ledger.run.frame_states[0].status, FrameStatus::Failed);
        assert!(ledger.run.frame_states[0].last_error.as_deref().unwrap().contains("max attempts"));
    }

    #[test]
    fn test_mark_rejected_and_approved() {
        let ledger = AttemptLedger::initialize("run-1", 2)
            .mark_rejected(0, "LADDER_EXHAUSTED")
            .mark_approved(1, "frame_001.png")
            .unwrap();

        assert_eq!(ledger.frames[0].final_status, Some(FinalStatus::Rejected));
        assert_eq!(ledger.frames[0].final_reason.as_deref(), Some("LADDER_EXHAUSTED"));
        assert_eq!(ledger.run.frame_states[0].status, FrameStatus::Failed);
        assert_eq!(ledger.frames[1].final_status, Some(FinalStatus::Approved));
        assert_eq!(ledger.run.accepted_artifacts()[1].as_deref(), Some("frame_001.png"));
    }

    #[test]
    fn test_mark_rejected_out_of_range_never_fails() {
        let ledger = AttemptLedger::initialize("run-1", 1).mark_rejected(9, "nope");
        assert_eq!(ledger.frames[0].final_status, None);
    }

    #[test]
    fn test_circuit_breaker_boundary() {
        let mut ledger = AttemptLedger::initialize("run-1", 1);
        for _ in 0..9 {
            ledger = ledger.record_attempt(0, NewAttempt::new("p")).unwrap();
        }
        let status = ledger.check_circuit_breaker(10, 0.5);
        assert!(!status.tripped);
        assert_eq!(status.total_attempts, 9);
        assert!((status.estimated_cost - 4.5).abs() < 1e-9);

        let ledger = ledger.record_attempt(0, NewAttempt::new("p")).unwrap();
        let status = ledger.check_circuit_breaker(10, 0.5);
        assert!(status.tripped);
        assert_eq!(status.limit, 10);
    }

    #[test]
    fn test_reopen_resets_in_progress_frames() {
        let ledger = AttemptLedger::initialize("run-1", 2)
            .start_frame(1)
            .unwrap()
            .record_attempt(1, NewAttempt::new("p"))
            .unwrap()
            .with_phase(Phase::Auditing)
            .with_stop_reason("USER_ABORT")
            .reopen();

        assert_eq!(ledger.run.frame_states[1].status, FrameStatus::Pending);
        assert_eq!(ledger.attempt_count(1), 1);
        assert_eq!(ledger.run.stop_reason, None);
        assert_eq!(ledger.run.phase, Phase::Init);
    }

    #[test]
    fn test_reopen_gives_failed_frames_a_fresh_budget() {
        let mut ledger = AttemptLedger::initialize("run-1", 3)
            .mark_approved(0, "frame_000.png")
            .unwrap();
        for _ in 0..2 {
            ledger = ledger
                .record_attempt(1, NewAttempt::new("p"))
                .unwrap()
                .update_attempt_result(1, failed())
                .unwrap();
        }
        let ledger = ledger
            .mark_max_attempts_reached(1)
            .mark_rejected(2, "LADDER_EXHAUSTED")
            .with_stop_reason("CONSECUTIVE_FAILS");
        assert!(ledger.is_max_attempts_reached(1, 2));

        let ledger = ledger.reopen();
        assert_eq!(ledger.run.frame_states[0].status, FrameStatus::Approved);
        for frame in [1, 2] {
            assert_eq!(ledger.run.frame_states[frame].status, FrameStatus::Pending);
            assert_eq!(ledger.run.frame_states[frame].last_error, None);
            assert_eq!(ledger.frames[frame].final_status, None);
            assert_eq!(ledger.frames[frame].final_reason, None);
        }
        assert_eq!(ledger.frames[1].attempts.len(), 2);
        assert_eq!(ledger.attempt_count(1), 2);
        assert_eq!(ledger.total_attempts, 2);
        assert!(ledger.frames[1].current_budget().is_empty());
        assert!(!ledger.is_max_attempts_reached(1, 2));

        let ledger = ledger.record_attempt(1, NewAttempt::new("p")).unwrap();
        assert_eq!(ledger.frames[1].latest().unwrap().attempt_index, 3);
        assert_eq!(ledger.budget_attempt_count(1), 1);
        assert_eq!(ledger.total_attempts, 3);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let ledger = AttemptLedger::initialize("run-1", 2)
            .record_attempt(0, NewAttempt::new("p"))
            .unwrap()
            .mark_max_attempts_reached(0)
            .reopen();
        let again = ledger.clone().reopen();
        assert_eq!(again.frames, ledger.frames);
        assert_eq!(again.run.frame_states, ledger.run.frame_states);
    }

    #[test]
    fn test_with_fatal_marks_failed() {
        let ledger = AttemptLedger::initialize("run-1", 1)
            .with_status(RunStatus::InProgress)
            .unwrap()
            .with_fatal(Phase::Generating, Some(0), "disk full");
        assert_eq!(ledger.run.status, RunStatus::Failed);
        let fatal = ledger.run.fatal.unwrap();
        assert_eq!(fatal.phase, Phase::Generating);
        assert_eq!(fatal.frame, Some(0));
    }

    #[test]
    fn test_serde_roundtrip() {
        let ledger = AttemptLedger::initialize("run-1", 2)
            .record_attempt(0, NewAttempt::new("p").with_seed(Some(7)))
            .unwrap()
            .update_attempt_result(0, failed())
            .unwrap();
        let json = serde_json::to_string_pretty(&ledger).unwrap();
        let back: AttemptLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
    }

    proptest! {
        #[test]
        fn prop_attempt_indices_are_monotonic(frames in proptest::collection::vec(0usize..4, 1..40)) {
            let mut ledger = AttemptLedger::initialize("run-prop", 4);
            for frame in &frames {
                ledger = ledger.record_attempt(*frame, NewAttempt::new("p")).unwrap();
            }
            prop_assert_eq!(ledger.total_attempts as usize, frames.len());
            let mut sum = 0;
            for entry in &ledger.frames {
                let indices: Vec<u32> = entry.attempts.iter().map(|a| a.attempt_index).collect();
                let expected: Vec<u32> = (1..=entry.attempts.len() as u32).collect();
                prop_assert_eq!(indices, expected);
                prop_assert_eq!(entry.current_attempt as usize, entry.attempts.len());
                sum += entry.attempts.len();
            }
            prop_assert_eq!(sum, frames.len());
        }
    }
}
