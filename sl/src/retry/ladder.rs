//! Retry ladder decisions
//!
//! Check order for a failed attempt:
//! 1. identity collapse (repeated resets with low scores)
//! 2. pass/fail oscillation (alternating outcomes after repeated resets)
//! 3. the first untried rung for the failure reason
//! 4. escalation: reset to baseline, then default regenerate
//! 5. ladder exhausted

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::domain::{ReasonCode, RetryAction};

use super::state::RetryState;

/// Rungs tried after the per-reason ladder runs out
pub const ESCALATION: [RetryAction; 2] = [RetryAction::ResetToBaseline, RetryAction::DefaultRegenerate];

/// Why the ladder gave up on a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LadderStopReason {
    IdentityCollapse,
    OscillationDetected,
    LadderExhausted,
}

impl std::fmt::Display for LadderStopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LadderStopReason::IdentityCollapse => write!(f, "IDENTITY_COLLAPSE"),
            LadderStopReason::OscillationDetected => write!(f, "OSCILLATION_DETECTED"),
            LadderStopReason::LadderExhausted => write!(f, "LADDER_EXHAUSTED"),
        }
    }
}

/// Try again with this rung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub frame: usize,
    /// Attempt that failed
    pub attempt: u32,
    pub reason: ReasonCode,
    pub action: RetryAction,
    /// Generate from the baseline instead of the previous frame
    pub force_reset: bool,
}

/// Give up on the frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDecision {
    pub frame: usize,
    pub attempt: u32,
    pub reason: ReasonCode,
    pub stop_reason: LadderStopReason,
    pub detail: String,
}

/// Ladder output
#[derive(Debug, Clone, PartialEq)]
pub enum LadderDecision {
    Retry(RetryDecision),
    Stop(StopDecision),
}

/// Deterministic retry ladder
#[derive(Debug, Clone)]
pub struct RetryLadder {
    collapse_threshold: f64,
}

impl Default for RetryLadder {
    fn default() -> Self {
        Self::new(0.9)
    }
}

impl RetryLadder {
    pub fn new(collapse_threshold: f64) -> Self {
        Self { collapse_threshold }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.collapse_threshold)
    }

    /// Rungs for a failure reason, in the order they are tried
    pub fn actions_for(reason: ReasonCode) -> &'static [RetryAction] {
        use RetryAction::*;
        match reason {
            ReasonCode::FormatMismatch
            | ReasonCode::WidthMismatch
            | ReasonCode::HeightMismatch
            | ReasonCode::NoAlpha => &[SeedReroll, PostProcess],
            ReasonCode::OpaqueBackground | ReasonCode::BackgroundLeak => &[TightenNegativePrompt, PostProcess],
            ReasonCode::ExcessiveHalo => &[PostProcess, TightenNegativePrompt],
            ReasonCode::BaselineDrift => &[PoseRescue, SeedReroll],
            ReasonCode::ExtraLimbs | ReasonCode::MissingLimbs => &[TargetedInpaint, PoseRescue, SeedReroll],
            ReasonCode::WrongOutfit => &[IdentityRescue, TargetedInpaint],
            ReasonCode::IdentityBreak => &[TargetedInpaint, IdentityRescue],
            ReasonCode::IdentityDrift => &[IdentityRescue, SeedReroll],
            ReasonCode::PaletteDrift => &[PostProcess, IdentityRescue],
            ReasonCode::LineDrift | ReasonCode::BlurDetected => &[TightenNegativePrompt, SeedReroll],
            ReasonCode::TemporalFlicker => &[SeedReroll, PoseRescue],
            ReasonCode::HaloDetected | ReasonCode::FringeDetected => &[PostProcess, TightenNegativePrompt],
            ReasonCode::GenerationFailed | ReasonCode::AuditError | ReasonCode::Unclassified => {
                &[SeedReroll, TightenNegativePrompt]
            }
        }
    }

    /// Decide the next step for a failed attempt
    pub fn get_next_action(&self, state: &RetryState, frame: usize, reason: ReasonCode, attempt: u32) -> LadderDecision {
        debug!(frame, %reason, attempt, tried = ?state.actions_tried, "RetryLadder::get_next_action: called");

        if let Some(detail) = self.detect_collapse(state) {
            warn!(frame, attempt, %detail, "identity collapse detected");
            return self.stop(frame, attempt, reason, LadderStopReason::IdentityCollapse, detail);
        }

        if let Some(detail) = detect_oscillation(state) {
            warn!(frame, attempt, %detail, "oscillation detected");
            return self.stop(frame, attempt, reason, LadderStopReason::OscillationDetected, detail);
        }

        let next = Self::actions_for(reason)
            .iter()
            .chain(ESCALATION.iter())
            .copied()
            .find(|action| !state.has_tried(*action));

        match next {
            Some(action) => {
                info!(frame, attempt, %reason, %action, "retry ladder chose next rung");
                LadderDecision::Retry(RetryDecision {
                    frame,
                    attempt,
                    reason,
                    action,
                    force_reset: action.is_reset(),
                })
            }
            None => {
                let detail = format!(
                    "all {} rungs for {} and escalation tried",
                    Self::actions_for(reason).len(),
                    reason
                );
                warn!(frame, attempt, %detail, "retry ladder exhausted");
                self.stop(frame, attempt, reason, LadderStopReason::LadderExhausted, detail)
            }
        }
    }

    fn detect_collapse(&self, state: &RetryState) -> Option<String> {
        if state.consecutive_reset_count < 2 {
            return None;
        }
        let scores = state.last_scores(2);
        if scores.len() == 2 && scores.iter().all(|s| *s < self.collapse_threshold) {
            Some(format!(
                "{} consecutive resets, last scores {:.3} and {:.3} below {:.3}",
                state.consecutive_reset_count, scores[0], scores[1], self.collapse_threshold
            ))
        } else {
            None
        }
    }

    fn stop(
        &self,
        frame: usize,
        attempt: u32,
        reason: ReasonCode,
        stop_reason: LadderStopReason,
        detail: String,
    ) -> LadderDecision {
        LadderDecision::Stop(StopDecision {
            frame,
            attempt,
            reason,
            stop_reason,
            detail,
        })
    }
}

fn detect_oscillation(state: &RetryState) -> Option<String> {
    if state.consecutive_reset_count <= 2 {
        return None;
    }
    let outcomes = state.last_outcomes(4);
    if outcomes.len() < 4 || !outcomes.windows(2).all(|w| w[0] != w[1]) {
        return None;
    }
    let pattern: Vec<&str> = outcomes.iter().map(|p| if *p { "pass" } else { "fail" }).collect();
    Some(format!(
        "outcomes alternate [{}] after {} consecutive resets",
        pattern.join(", "),
        state.consecutive_reset_count
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_action(decision: LadderDecision) -> RetryAction {
        match decision {
            LadderDecision::Retry(d) => d.action,
            LadderDecision::Stop(s) => panic!("expected retry, got stop {:?}", s),
        }
    }

    fn stop_reason(decision: LadderDecision) -> LadderStopReason {
        match decision {
            LadderDecision::Stop(s) => s.stop_reason,
            LadderDecision::Retry(d) => panic!("expected stop, got retry {:?}", d),
        }
    }

    #[test]
    fn test_every_reason_has_two_rungs() {
        for code in ReasonCode::ALL {
            assert!(RetryLadder::actions_for(code).len() >= 2, "{}", code);
        }
    }

    #[test]
    fn test_first_untried_rung() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();

        let action = retry_action(ladder.get_next_action(&state, 1, ReasonCode::IdentityDrift, 1));
        assert_eq!(action, RetryAction::IdentityRescue);

        state.record_action_tried(action);
        let action = retry_action(ladder.get_next_action(&state, 1, ReasonCode::IdentityDrift, 2));
        assert_eq!(action, RetryAction::SeedReroll);
    }

    #[test]
    fn test_escalation_then_exhaustion() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        let reason = ReasonCode::HaloDetected;

        let mut taken = Vec::new();
        for attempt in 1..=4 {
            let action = retry_action(ladder.get_next_action(&state, 0, reason, attempt));
            state.record_action_tried(action);
            taken.push(action);
        }
        assert_eq!(
            taken,
            vec![
                RetryAction::PostProcess,
                RetryAction::TightenNegativePrompt,
                RetryAction::ResetToBaseline,
                RetryAction::DefaultRegenerate,
            ]
        );

        let decision = ladder.get_next_action(&state, 0, reason, 5);
        assert_eq!(stop_reason(decision), LadderStopReason::LadderExhausted);
    }

    #[test]
    fn test_reset_rung_forces_baseline() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        state.record_action_tried(RetryAction::IdentityRescue);
        state.record_action_tried(RetryAction::SeedReroll);

        match ladder.get_next_action(&state, 3, ReasonCode::IdentityDrift, 3) {
            LadderDecision::Retry(d) => {
                assert_eq!(d.action, RetryAction::ResetToBaseline);
                assert!(d.force_reset);
                assert_eq!(d.frame, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_identity_collapse() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        state.record_action_tried(RetryAction::ResetToBaseline);
        state.record_action_tried(RetryAction::ResetToBaseline);
        state.record_score(0.85);
        state.record_score(0.80);

        let decision = ladder.get_next_action(&state, 2, ReasonCode::IdentityDrift, 3);
        assert_eq!(stop_reason(decision), LadderStopReason::IdentityCollapse);
    }

    #[test]
    fn test_no_collapse_when_a_score_is_healthy() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        state.record_action_tried(RetryAction::ResetToBaseline);
        state.record_action_tried(RetryAction::ResetToBaseline);
        state.record_score(0.95);
        state.record_score(0.80);

        let decision = ladder.get_next_action(&state, 2, ReasonCode::IdentityDrift, 3);
        assert_eq!(retry_action(decision), RetryAction::IdentityRescue);
    }

    #[test]
    fn test_oscillation_detected() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        for _ in 0..3 {
            state.record_action_tried(RetryAction::ResetToBaseline);
        }
        for passed in [true, false, true, false] {
            state.record_outcome(passed);
        }

        let decision = ladder.get_next_action(&state, 4, ReasonCode::TemporalFlicker, 5);
        assert_eq!(stop_reason(decision), LadderStopReason::OscillationDetected);
    }

    #[test]
    fn test_no_oscillation_with_two_resets() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        state.record_action_tried(RetryAction::ResetToBaseline);
        state.record_action_tried(RetryAction::ResetToBaseline);
        for passed in [true, false, true, false] {
            state.record_outcome(passed);
        }

        let decision = ladder.get_next_action(&state, 4, ReasonCode::TemporalFlicker, 5);
        assert_eq!(retry_action(decision), RetryAction::SeedReroll);
    }

    #[test]
    fn test_identity_break_inpaints_first() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        let first = retry_action(ladder.get_next_action(&state, 0, ReasonCode::IdentityBreak, 1));
        assert_eq!(first, RetryAction::TargetedInpaint);
        state.record_action_tried(first);
        let second = retry_action(ladder.get_next_action(&state, 0, ReasonCode::IdentityBreak, 2));
        assert_eq!(second, RetryAction::IdentityRescue);

        let outfit = RetryState::default();
        let action = retry_action(ladder.get_next_action(&outfit, 0, ReasonCode::WrongOutfit, 1));
        assert_eq!(action, RetryAction::IdentityRescue);
    }

    #[test]
    fn test_collapse_checked_before_oscillation() {
        let ladder = RetryLadder::default();
        let mut state = RetryState::default();
        for _ in 0..3 {
            state.record_action_tried(RetryAction::ResetToBaseline);
        }
        for passed in [true, false, true, false] {
            state.record_outcome(passed);
        }
        state.record_score(0.5);
        state.record_score(0.5);

        let decision = ladder.get_next_action(&state, 0, ReasonCode::IdentityBreak, 8);
        assert_eq!(stop_reason(decision), LadderStopReason::IdentityCollapse);
    }
}
