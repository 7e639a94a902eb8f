//! Reference selection
//!
//! Each frame is generated from a reference image: the previous accepted frame
//! when there is one, the baseline otherwise. Pure functions, no I/O.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{FrameStatus, RunState};

/// Which input a reference came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    Baseline,
    Previous,
}

impl std::fmt::Display for ReferenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceSource::Baseline => write!(f, "baseline"),
            ReferenceSource::Previous => write!(f, "previous"),
        }
    }
}

/// Reference chosen for a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSelection {
    pub reference: String,
    pub source: ReferenceSource,
    pub reason: String,
}

/// Pick the reference for `frame`
///
/// First match wins: frame 0 uses the baseline; a forced reset uses the
/// baseline; an accepted previous frame is used as-is; otherwise the previous
/// frame is missing (a gap) and the baseline is used with a warning.
pub fn select_reference(
    frame: usize,
    accepted: &[Option<String>],
    baseline: &str,
    force_reset: bool,
) -> ReferenceSelection {
    debug!(frame, force_reset, "select_reference: called");

    if frame == 0 {
        return baseline_selection(baseline, "first frame uses the baseline");
    }

    if force_reset {
        info!(frame, "drift recovery: resetting reference to baseline");
        return baseline_selection(baseline, "forced reset to baseline");
    }

    if let Some(Some(previous)) = accepted.get(frame - 1) {
        debug!(frame, %previous, "select_reference: chaining from previous frame");
        return ReferenceSelection {
            reference: previous.clone(),
            source: ReferenceSource::Previous,
            reason: format!("chained from accepted frame {}", frame - 1),
        };
    }

    warn!(frame, previous = frame - 1, "no accepted previous frame, falling back to baseline");
    baseline_selection(baseline, &format!("frame {} not accepted, fell back to baseline", frame - 1))
}

fn baseline_selection(baseline: &str, reason: &str) -> ReferenceSelection {
    ReferenceSelection {
        reference: baseline.to_string(),
        source: ReferenceSource::Baseline,
        reason: reason.to_string(),
    }
}

/// Check for unaccepted frames before `up_to`
pub fn has_sequence_gaps(accepted: &[Option<String>], up_to: usize) -> bool {
    let end = up_to.min(accepted.len());
    let gaps = accepted[..end].iter().any(|a| a.is_none());
    debug!(up_to, gaps, "has_sequence_gaps: called");
    gaps
}

/// First frame still waiting to be generated
pub fn find_next_pending_frame(state: &RunState) -> Option<usize> {
    let next = state
        .frame_states
        .iter()
        .find(|f| matches!(f.status, FrameStatus::Pending | FrameStatus::InProgress))
        .map(|f| f.index);
    debug!(?next, "find_next_pending_frame: called");
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(list: &[Option<&str>]) -> Vec<Option<String>> {
        list.iter().map(|a| a.map(String::from)).collect()
    }

    #[test]
    fn test_frame_zero_uses_baseline() {
        let sel = select_reference(0, &accepted(&[Some("f0.png")]), "base.png", false);
        assert_eq!(sel.reference, "base.png");
        assert_eq!(sel.source, ReferenceSource::Baseline);
    }

    #[test]
    fn test_chains_from_previous() {
        let sel = select_reference(2, &accepted(&[Some("f0.png"), Some("f1.png"), None]), "base.png", false);
        assert_eq!(sel.reference, "f1.png");
        assert_eq!(sel.source, ReferenceSource::Previous);
    }

    #[test]
    fn test_force_reset_uses_baseline() {
        let sel = select_reference(2, &accepted(&[Some("f0.png"), Some("f1.png"), None]), "base.png", true);
        assert_eq!(sel.reference, "base.png");
        assert_eq!(sel.source, ReferenceSource::Baseline);
        assert!(sel.reason.contains("forced"));
    }

    #[test]
    fn test_gap_falls_back_to_baseline() {
        let list = accepted(&[Some("f0.png"), Some("f1.png"), None, None]);
        let sel = select_reference(3, &list, "base.png", false);
        assert_eq!(sel.reference, "base.png");
        assert_eq!(sel.source, ReferenceSource::Baseline);
        assert!(sel.reason.contains("frame 2"));
    }

    #[test]
    fn test_gap_beyond_list_falls_back() {
        let sel = select_reference(5, &accepted(&[Some("f0.png")]), "base.png", false);
        assert_eq!(sel.source, ReferenceSource::Baseline);
    }

    #[test]
    fn test_has_sequence_gaps() {
        let list = accepted(&[Some("f0.png"), None, Some("f2.png")]);
        assert!(!has_sequence_gaps(&list, 1));
        assert!(has_sequence_gaps(&list, 2));
        assert!(has_sequence_gaps(&list, 10));
        assert!(!has_sequence_gaps(&list, 0));
    }

    #[test]
    fn test_find_next_pending_frame() {
        let mut state = RunState::new("r", 3);
        state.frame_states[0].status = FrameStatus::Approved;
        state.frame_states[1].status = FrameStatus::Failed;
        assert_eq!(find_next_pending_frame(&state), Some(2));

        state.frame_states[2].status = FrameStatus::Approved;
        assert_eq!(find_next_pending_frame(&state), None);
    }
}
