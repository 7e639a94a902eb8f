//! Orchestrator phases and the transition table
//!
//! The orchestrator is an explicit state machine. Every move goes through
//! [`Phase::can_transition_to`]; anything outside the table is a fatal error.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Detecting/adopting a prior run or starting fresh
    #[default]
    Init,
    /// Calling the generation collaborator for the current frame
    Generating,
    /// Calling the audit collaborator on the candidate
    Auditing,
    /// Candidate failed; consulting max-attempts and the retry ladder
    RetryDeciding,
    /// Committing an accepted candidate
    Approving,
    /// Frame resolved; evaluating stop conditions and advancing
    NextFrame,
    /// Halted early with a diagnostic report (resumable)
    Stopped,
    /// Every frame resolved
    Completed,
}

impl Phase {
    /// Check whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: Self) -> bool {
        let allowed = match (self, next) {
            // Abort: any non-terminal phase may halt
            (from, Phase::Stopped) => !from.is_terminal(),
            (Phase::Init, Phase::Generating)
            | (Phase::Generating, Phase::Auditing)
            | (Phase::Auditing, Phase::Approving)
            | (Phase::Auditing, Phase::RetryDeciding)
            | (Phase::RetryDeciding, Phase::Generating)
            | (Phase::RetryDeciding, Phase::NextFrame)
            | (Phase::Approving, Phase::NextFrame)
            | (Phase::NextFrame, Phase::Generating)
            | (Phase::NextFrame, Phase::Completed) => true,
            _ => false,
        };
        debug!(from = %self, to = %next, allowed, "Phase::can_transition_to: called");
        allowed
    }

    /// Check if this phase ends the run loop
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Completed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Init => write!(f, "INIT"),
            Phase::Generating => write!(f, "GENERATING"),
            Phase::Auditing => write!(f, "AUDITING"),
            Phase::RetryDeciding => write!(f, "RETRY_DECIDING"),
            Phase::Approving => write!(f, "APPROVING"),
            Phase::NextFrame => write!(f, "NEXT_FRAME"),
            Phase::Stopped => write!(f, "STOPPED"),
            Phase::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// Attempted move outside the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition {from} -> {to}")]
pub struct PhaseTransitionError {
    pub from: Phase,
    pub to: Phase,
}

impl PhaseTransitionError {
    /// Validate a transition, returning the target phase on success
    pub fn check(from: Phase, to: Phase) -> Result<Phase, Self> {
        if from.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Self { from, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            Phase::Init,
            Phase::Generating,
            Phase::Auditing,
            Phase::RetryDeciding,
            Phase::Generating,
            Phase::Auditing,
            Phase::Approving,
            Phase::NextFrame,
            Phase::Generating,
            Phase::Auditing,
            Phase::RetryDeciding,
            Phase::NextFrame,
            Phase::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Phase::Init.can_transition_to(Phase::Auditing));
        assert!(!Phase::Generating.can_transition_to(Phase::Approving));
        assert!(!Phase::Approving.can_transition_to(Phase::Generating));
        assert!(!Phase::NextFrame.can_transition_to(Phase::Auditing));
        assert!(!Phase::Completed.can_transition_to(Phase::Generating));
    }

    #[test]
    fn test_abort_from_any_live_phase() {
        for phase in [
            Phase::Init,
            Phase::Generating,
            Phase::Auditing,
            Phase::RetryDeciding,
            Phase::Approving,
            Phase::NextFrame,
        ] {
            assert!(phase.can_transition_to(Phase::Stopped), "{}", phase);
        }
        assert!(!Phase::Stopped.can_transition_to(Phase::Stopped));
        assert!(!Phase::Completed.can_transition_to(Phase::Stopped));
    }

    #[test]
    fn test_check_returns_error() {
        let err = PhaseTransitionError::check(Phase::Auditing, Phase::Completed).unwrap_err();
        assert_eq!(err.from, Phase::Auditing);
        assert_eq!(err.to, Phase::Completed);
        assert_eq!(err.to_string(), "invalid phase transition AUDITING -> COMPLETED");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Phase::RetryDeciding).unwrap();
        assert_eq!(json, "\"RETRY_DECIDING\"");
        let back: Phase = serde_json::from_str("\"NEXT_FRAME\"").unwrap();
        assert_eq!(back, Phase::NextFrame);
    }
}
