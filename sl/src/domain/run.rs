//! RunState domain type
//!
//! Tracks the runtime state of one frame sequence: run status, per-frame
//! status, accepted artifacts and the orchestrator phase of the last
//! transition.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::now_ms;
use super::phase::Phase;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, nothing generated yet
    #[default]
    Initializing,
    /// Orchestrator is looping
    InProgress,
    /// Halted by a stop condition or abort; resumable
    Paused,
    /// Every frame resolved
    Completed,
    /// Fatal error; resumable once the cause is fixed
    Failed,
}

impl RunStatus {
    /// Check whether moving from `self` to `next` is allowed
    ///
    /// Status only moves forward. `paused -> in_progress` and
    /// `failed -> in_progress` are the resume edges. Nothing leaves `completed`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunStatus::Initializing, RunStatus::InProgress)
                | (RunStatus::Initializing, RunStatus::Failed)
                | (RunStatus::InProgress, RunStatus::Paused)
                | (RunStatus::InProgress, RunStatus::Completed)
                | (RunStatus::InProgress, RunStatus::Failed)
                | (RunStatus::Paused, RunStatus::InProgress)
                | (RunStatus::Paused, RunStatus::Failed)
                | (RunStatus::Failed, RunStatus::InProgress)
        )
    }

    /// Check if the run can be picked up again
    pub fn is_resumable(self) -> bool {
        !matches!(self, RunStatus::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug!(?self, "RunStatus::fmt: called");
        match self {
            Self::Initializing => {
                debug!("RunStatus::fmt: Initializing branch");
                write!(f, "initializing")
            }
            Self::InProgress => {
                debug!("RunStatus::fmt: InProgress branch");
                write!(f, "in_progress")
            }
            Self::Paused => {
                debug!("RunStatus::fmt: Paused branch");
                write!(f, "paused")
            }
            Self::Completed => {
                debug!("RunStatus::fmt: Completed branch");
                write!(f, "completed")
            }
            Self::Failed => {
                debug!("RunStatus::fmt: Failed branch");
                write!(f, "failed")
            }
        }
    }
}

/// Attempted backwards move of the run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid run status transition {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Per-frame status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    #[default]
    Pending,
    InProgress,
    Approved,
    Failed,
}

impl FrameStatus {
    /// Approved or failed; only a resume reopens a failed frame
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameStatus::Approved | FrameStatus::Failed)
    }
}

impl std::fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStatus::Pending => write!(f, "pending"),
            FrameStatus::InProgress => write!(f, "in_progress"),
            FrameStatus::Approved => write!(f, "approved"),
            FrameStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State of one frame in the sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    pub index: usize,
    pub status: FrameStatus,
    pub attempts: u32,
    /// Artifact reference of the accepted candidate
    #[serde(default)]
    pub approved_artifact: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl FrameState {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: FrameStatus::Pending,
            attempts: 0,
            approved_artifact: None,
            last_error: None,
        }
    }
}

/// Where and why the orchestrator hit a fatal error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalRecord {
    pub phase: Phase,
    pub frame: Option<usize>,
    pub cause: String,
    pub at: i64,
}

/// Durable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Unique run identifier
    pub run_id: String,

    /// Current status
    pub status: RunStatus,

    /// Number of frames in the sequence
    pub total_frames: usize,

    /// One entry per frame, index == position
    pub frame_states: Vec<FrameState>,

    /// Frame the orchestrator is working on
    #[serde(default)]
    pub current_frame: usize,

    /// Phase of the last persisted transition
    #[serde(default)]
    pub phase: Phase,

    /// Why the run was halted early (STOPPED)
    #[serde(default)]
    pub stop_reason: Option<String>,

    /// Fatal error record (status failed)
    #[serde(default)]
    pub fatal: Option<FatalRecord>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl RunState {
    /// Create a run with every frame pending
    pub fn new(run_id: impl Into<String>, total_frames: usize) -> Self {
        let run_id = run_id.into();
        debug!(%run_id, total_frames, "RunState::new: called");
        let now = now_ms();
        Self {
            run_id,
            status: RunStatus::Initializing,
            total_frames,
            frame_states: (0..total_frames).map(FrameState::new).collect(),
            current_frame: 0,
            phase: Phase::Init,
            stop_reason: None,
            fatal: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the run status forward
    ///
    /// Setting the current status again is a no-op.
    pub fn set_status(&mut self, status: RunStatus) -> Result<(), StatusTransitionError> {
        debug!(run_id = %self.run_id, from = %self.status, to = %status, "RunState::set_status: called");
        if self.status == status {
            debug!("RunState::set_status: unchanged");
            return Ok(());
        }
        if !self.status.can_transition_to(status) {
            debug!("RunState::set_status: rejected");
            return Err(StatusTransitionError {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.updated_at = now_ms();
        Ok(())
    }

    /// Get a frame by index
    pub fn frame(&self, index: usize) -> Option<&FrameState> {
        self.frame_states.get(index)
    }

    pub(crate) fn frame_mut(&mut self, index: usize) -> Option<&mut FrameState> {
        self.frame_states.get_mut(index)
    }

    /// Accepted artifact per frame (None where nothing was accepted)
    pub fn accepted_artifacts(&self) -> Vec<Option<String>> {
        self.frame_states
            .iter()
            .map(|f| match f.status {
                FrameStatus::Approved => f.approved_artifact.clone(),
                _ => None,
            })
            .collect()
    }

    /// Indices of approved frames
    pub fn approved_frames(&self) -> Vec<usize> {
        self.frames_with(|s| s == FrameStatus::Approved)
    }

    /// Indices of frames not accepted yet, failed ones included
    pub fn unaccepted_frames(&self) -> Vec<usize> {
        self.frames_with(|s| s != FrameStatus::Approved)
    }

    /// Check if every frame was approved
    pub fn all_approved(&self) -> bool {
        self.frame_states.iter().all(|f| f.status == FrameStatus::Approved)
    }

    /// Check if every frame is approved or failed
    pub fn all_resolved(&self) -> bool {
        self.frame_states.iter().all(|f| f.status.is_terminal())
    }

    fn frames_with(&self, pred: impl Fn(FrameStatus) -> bool) -> Vec<usize> {
        self.frame_states
            .iter()
            .filter(|f| pred(f.status))
            .map(|f| f.index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_state() {
        let state = RunState::new("run-1", 4);
        assert_eq!(state.frame_states.len(), 4);
        assert_eq!(state.status, RunStatus::Initializing);
        assert!(state.frame_states.iter().all(|f| f.status == FrameStatus::Pending));
        assert_eq!(state.frame_states[3].index, 3);
        assert_eq!(state.unaccepted_frames(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut state = RunState::new("run-1", 1);
        state.set_status(RunStatus::InProgress).unwrap();
        state.set_status(RunStatus::InProgress).unwrap();
        state.set_status(RunStatus::Completed).unwrap();

        let err = state.set_status(RunStatus::InProgress).unwrap_err();
        assert_eq!(err.from, RunStatus::Completed);
        assert_eq!(err.to, RunStatus::InProgress);
        assert!(state.set_status(RunStatus::Failed).is_err());
    }

    #[test]
    fn test_resume_edges() {
        assert!(RunStatus::Paused.can_transition_to(RunStatus::InProgress));
        assert!(RunStatus::Failed.can_transition_to(RunStatus::InProgress));
        assert!(!RunStatus::InProgress.can_transition_to(RunStatus::Initializing));
        assert!(!RunStatus::Completed.is_resumable());
        assert!(RunStatus::Paused.is_resumable());
    }

    #[test]
    fn test_accepted_artifacts_only_for_approved() {
        let mut state = RunState::new("run-1", 3);
        state.frame_states[0].status = FrameStatus::Approved;
        state.frame_states[0].approved_artifact = Some("f0.png".to_string());
        state.frame_states[1].status = FrameStatus::Failed;
        state.frame_states[1].approved_artifact = Some("stale.png".to_string());

        assert_eq!(
            state.accepted_artifacts(),
            vec![Some("f0.png".to_string()), None, None]
        );
        assert_eq!(state.approved_frames(), vec![0]);
        assert_eq!(state.unaccepted_frames(), vec![1, 2]);
        assert!(!state.all_resolved());
        assert!(!state.all_approved());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RunStatus::InProgress.to_string(), "in_progress");
        assert_eq!(FrameStatus::Approved.to_string(), "approved");
    }

    #[test]
    fn test_serde_roundtrip_keeps_phase() {
        let mut state = RunState::new("run-1", 2);
        state.phase = Phase::Auditing;
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"phase\":\"AUDITING\""));
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
