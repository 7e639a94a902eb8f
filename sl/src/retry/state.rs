//! Per-frame retry history
//!
//! Process-local. It is never written to disk; on resume it is rebuilt from the
//! attempt records of the frame being resumed.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::config::RetryConfig;
use crate::domain::{AttemptRecord, AttemptResult, RetryAction};

/// Retry history of one frame
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    /// Ladder rungs taken, in order (a rung can appear more than once)
    pub actions_tried: Vec<RetryAction>,
    /// Reset-to-baseline rungs taken back to back
    pub consecutive_reset_count: u32,
    recent_scores: VecDeque<f64>,
    recent_outcomes: VecDeque<bool>,
    score_window: usize,
    outcome_window: usize,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(5, 6)
    }
}

impl RetryState {
    /// Empty history with the given rolling window sizes
    pub fn new(score_window: usize, outcome_window: usize) -> Self {
        Self {
            actions_tried: Vec::new(),
            consecutive_reset_count: 0,
            recent_scores: VecDeque::with_capacity(score_window),
            recent_outcomes: VecDeque::with_capacity(outcome_window),
            score_window: score_window.max(1),
            outcome_window: outcome_window.max(1),
        }
    }

    /// Rebuild from durable attempt records
    ///
    /// Each record carries the rung it was generated with, its score and its
    /// outcome, which is everything the live history would have seen.
    /// Pending records only contribute their rung.
    pub fn rebuild(attempts: &[AttemptRecord], score_window: usize, outcome_window: usize) -> Self {
        debug!(attempts = attempts.len(), "RetryState::rebuild: called");
        let mut state = Self::new(score_window, outcome_window);
        for record in attempts {
            if let Some(action) = record.retry_strategy {
                state.record_action_tried(action);
            }
            if record.result == AttemptResult::Pending {
                continue;
            }
            if let Some(score) = record.ladder_score() {
                state.record_score(score);
            }
            state.record_outcome(record.result == AttemptResult::Passed);
        }
        state
    }

    /// Record a rung; resets extend the consecutive-reset streak, anything else ends it
    pub fn record_action_tried(&mut self, action: RetryAction) {
        self.actions_tried.push(action);
        if action.is_reset() {
            self.consecutive_reset_count += 1;
        } else {
            self.consecutive_reset_count = 0;
        }
        debug!(%action, consecutive_resets = self.consecutive_reset_count, "RetryState::record_action_tried: called");
    }

    /// Record a quality score, keeping the last `score_window`
    pub fn record_score(&mut self, score: f64) {
        self.recent_scores.push_back(score);
        while self.recent_scores.len() > self.score_window {
            self.recent_scores.pop_front();
        }
    }

    /// Record a pass/fail outcome, keeping the last `outcome_window`
    pub fn record_outcome(&mut self, passed: bool) {
        self.recent_outcomes.push_back(passed);
        while self.recent_outcomes.len() > self.outcome_window {
            self.recent_outcomes.pop_front();
        }
    }

    pub fn has_tried(&self, action: RetryAction) -> bool {
        self.actions_tried.contains(&action)
    }

    /// Up to `n` most recent scores, oldest first
    pub fn last_scores(&self, n: usize) -> Vec<f64> {
        let skip = self.recent_scores.len().saturating_sub(n);
        self.recent_scores.iter().skip(skip).copied().collect()
    }

    /// Up to `n` most recent outcomes, oldest first
    pub fn last_outcomes(&self, n: usize) -> Vec<bool> {
        let skip = self.recent_outcomes.len().saturating_sub(n);
        self.recent_outcomes.iter().skip(skip).copied().collect()
    }
}

/// Retry histories keyed by frame index
#[derive(Debug, Clone)]
pub struct RetryTable {
    states: HashMap<usize, RetryState>,
    score_window: usize,
    outcome_window: usize,
}

impl Default for RetryTable {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryTable {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            states: HashMap::new(),
            score_window: config.score_window,
            outcome_window: config.outcome_window,
        }
    }

    /// History of a frame, created empty on first use
    pub fn state_mut(&mut self, frame: usize) -> &mut RetryState {
        let (score_window, outcome_window) = (self.score_window, self.outcome_window);
        self.states
            .entry(frame)
            .or_insert_with(|| RetryState::new(score_window, outcome_window))
    }

    pub fn get(&self, frame: usize) -> Option<&RetryState> {
        self.states.get(&frame)
    }

    /// Replace a frame's history with one rebuilt from its attempt records
    pub fn rehydrate(&mut self, frame: usize, attempts: &[AttemptRecord]) {
        debug!(frame, attempts = attempts.len(), "RetryTable::rehydrate: called");
        let state = RetryState::rebuild(attempts, self.score_window, self.outcome_window);
        self.states.insert(frame, state);
    }

    /// Forget a frame's history (on acceptance)
    pub fn reset_frame_retry_state(&mut self, frame: usize) {
        debug!(frame, "RetryTable::reset_frame_retry_state: called");
        self.states.remove(&frame);
    }
}
