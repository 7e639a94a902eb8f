//! Stop-condition evaluation
//!
//! Run-level halt decision made after every frame. Pure: reads the ledger and
//! the thresholds, never mutates anything.
//!
//! Priority when several conditions hold: circuit breaker, consecutive
//! failures, reject rate, retry rate.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::StopConditionsConfig;
use crate::state::AttemptLedger;

/// Why a run halted early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    CircuitBreaker,
    ConsecutiveFails,
    RejectRate,
    RetryRate,
    /// Operator abort; never produced by the evaluator
    UserAbort,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::CircuitBreaker => write!(f, "CIRCUIT_BREAKER"),
            StopReason::ConsecutiveFails => write!(f, "CONSECUTIVE_FAILS"),
            StopReason::RejectRate => write!(f, "REJECT_RATE"),
            StopReason::RetryRate => write!(f, "RETRY_RATE"),
            StopReason::UserAbort => write!(f, "USER_ABORT"),
        }
    }
}

/// Rolling statistics over the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Frames with at least one attempt
    pub frames_attempted: usize,
    /// Frames with more than one attempt
    pub frames_retried: usize,
    /// Frames with a final status
    pub frames_finished: usize,
    pub frames_approved: usize,
    /// Failed plus rejected
    pub frames_failed: usize,
    pub retry_rate: f64,
    pub reject_rate: f64,
    /// Trailing failed/rejected frames, reset by an approval
    pub consecutive_failures: u32,
    pub total_attempts: u32,
    pub estimated_cost: f64,
}

/// Halt decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopVerdict {
    pub should_stop: bool,
    pub reason: Option<StopReason>,
    /// Configured limit that was crossed
    pub threshold: Option<f64>,
    /// Observed value that crossed it
    pub actual: Option<f64>,
    pub statistics: RunStatistics,
}

impl StopVerdict {
    fn go(statistics: RunStatistics) -> Self {
        Self {
            should_stop: false,
            reason: None,
            threshold: None,
            actual: None,
            statistics,
        }
    }

    fn halt(reason: StopReason, threshold: f64, actual: f64, statistics: RunStatistics) -> Self {
        Self {
            should_stop: true,
            reason: Some(reason),
            threshold: Some(threshold),
            actual: Some(actual),
            statistics,
        }
    }
}

/// Compute rolling statistics from the ledger
pub fn compute_statistics(ledger: &AttemptLedger, config: &StopConditionsConfig) -> RunStatistics {
    let mut stats = RunStatistics {
        total_attempts: ledger.total_attempts,
        estimated_cost: f64::from(ledger.total_attempts) * config.cost_per_attempt,
        ..Default::default()
    };

    for entry in &ledger.frames {
        if entry.current_attempt > 0 {
            stats.frames_attempted += 1;
        }
        if entry.current_attempt > 1 {
            stats.frames_retried += 1;
        }
        if let Some(status) = entry.final_status {
            stats.frames_finished += 1;
            if status.is_failure() {
                stats.frames_failed += 1;
            } else {
                stats.frames_approved += 1;
            }
        }
    }

    // Frames finish in index order, so the trailing streak is read backwards by index
    stats.consecutive_failures = ledger
        .frames
        .iter()
        .rev()
        .filter_map(|f| f.final_status)
        .take_while(|s| s.is_failure())
        .count() as u32;

    stats.retry_rate = ratio(stats.frames_retried, stats.frames_attempted);
    stats.reject_rate = ratio(stats.frames_failed, stats.frames_finished);
    stats
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Decide whether the run must halt
pub fn evaluate(ledger: &AttemptLedger, config: &StopConditionsConfig) -> StopVerdict {
    let stats = compute_statistics(ledger, config);
    debug!(?stats, "evaluate: called");

    let breaker = ledger.check_circuit_breaker(config.circuit_breaker_limit, config.cost_per_attempt);
    let verdict = if breaker.tripped {
        StopVerdict::halt(
            StopReason::CircuitBreaker,
            f64::from(breaker.limit),
            f64::from(breaker.total_attempts),
            stats,
        )
    } else if stats.consecutive_failures >= config.max_consecutive_fails {
        StopVerdict::halt(
            StopReason::ConsecutiveFails,
            f64::from(config.max_consecutive_fails),
            f64::from(stats.consecutive_failures),
            stats,
        )
    } else if stats.reject_rate > config.max_reject_rate {
        let actual = stats.reject_rate;
        StopVerdict::halt(StopReason::RejectRate, config.max_reject_rate, actual, stats)
    } else if stats.retry_rate > config.max_retry_rate {
        let actual = stats.retry_rate;
        StopVerdict::halt(StopReason::RetryRate, config.max_retry_rate, actual, stats)
    } else {
        StopVerdict::go(stats)
    };

    if let Some(reason) = verdict.reason {
        info!(%reason, threshold = ?verdict.threshold, actual = ?verdict.actual, "stop condition met");
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewAttempt;

    /// Ledger where each entry is (attempts, outcome) with outcome one of
    /// "approved", "failed", "rejected" or "" (unfinished)
    fn ledger_with(frames: &[(u32, &str)]) -> AttemptLedger {
        let mut ledger = AttemptLedger::initialize("run-stats", frames.len());
        for (i, (attempts, outcome)) in frames.iter().enumerate() {
            for _ in 0..*attempts {
                ledger = ledger.record_attempt(i, NewAttempt::new("p")).unwrap();
            }
            ledger = match *outcome {
                "approved" => ledger.mark_approved(i, format!("f{}.png", i)).unwrap(),
                "failed" => ledger.mark_max_attempts_reached(i),
                "rejected" => ledger.mark_rejected(i, "LADDER_EXHAUSTED"),
                _ => ledger,
            };
        }
        ledger
    }

    fn config() -> StopConditionsConfig {
        StopConditionsConfig {
            max_retry_rate: 0.5,
            max_reject_rate: 0.5,
            max_consecutive_fails: 3,
            circuit_breaker_limit: 50,
            cost_per_attempt: 0.1,
        }
    }

    #[test]
    fn test_statistics() {
        let ledger = ledger_with(&[(1, "approved"), (3, "approved"), (2, "failed"), (1, "")]);
        let stats = compute_statistics(&ledger, &config());

        assert_eq!(stats.frames_attempted, 4);
        assert_eq!(stats.frames_retried, 2);
        assert_eq!(stats.frames_finished, 3);
        assert_eq!(stats.frames_failed, 1);
        assert_eq!(stats.consecutive_failures, 1);
        assert!((stats.retry_rate - 0.5).abs() < 1e-9);
        assert!((stats.reject_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.total_attempts, 7);
        assert!((stats.estimated_cost - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_empty_ledger_does_not_stop() {
        let ledger = AttemptLedger::initialize("r", 4);
        let verdict = evaluate(&ledger, &config());
        assert!(!verdict.should_stop);
        assert_eq!(verdict.statistics.retry_rate, 0.0);
        assert_eq!(verdict.statistics.reject_rate, 0.0);
    }

    #[test]
    fn test_approval_resets_consecutive_failures() {
        let ledger = ledger_with(&[(1, "failed"), (1, "rejected"), (1, "approved"), (1, "failed")]);
        let stats = compute_statistics(&ledger, &config());
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[test]
    fn test_consecutive_fails() {
        let ledger = ledger_with(&[(1, "approved"), (1, "approved"), (1, "approved"), (1, "failed"), (1, "rejected"), (1, "failed")]);
        let verdict = evaluate(&ledger, &config());
        assert!(verdict.should_stop);
        assert_eq!(verdict.reason, Some(StopReason::ConsecutiveFails));
        assert_eq!(verdict.threshold, Some(3.0));
        assert_eq!(verdict.actual, Some(3.0));
    }

    #[test]
    fn test_circuit_breaker_beats_consecutive_fails() {
        let ledger = ledger_with(&[(4, "failed"), (4, "failed"), (4, "failed")]);
        let mut cfg = config();
        cfg.circuit_breaker_limit = 12;

        let verdict = evaluate(&ledger, &cfg);
        assert_eq!(verdict.reason, Some(StopReason::CircuitBreaker));
        assert_eq!(verdict.actual, Some(12.0));
    }

    #[test]
    fn test_circuit_breaker_boundary() {
        let mut cfg = config();
        cfg.circuit_breaker_limit = 5;

        let below = ledger_with(&[(4, "")]);
        assert!(!evaluate(&below, &cfg).should_stop);

        let at = ledger_with(&[(5, "")]);
        assert_eq!(evaluate(&at, &cfg).reason, Some(StopReason::CircuitBreaker));
    }

    #[test]
    fn test_reject_rate_beats_retry_rate() {
        // reject 2/3, retry 3/3
        let ledger = ledger_with(&[(2, "failed"), (2, "approved"), (2, "rejected")]);
        let verdict = evaluate(&ledger, &config());
        assert_eq!(verdict.reason, Some(StopReason::RejectRate));
    }

    #[test]
    fn test_retry_rate() {
        let ledger = ledger_with(&[(2, "approved"), (2, "approved"), (1, "approved")]);
        let verdict = evaluate(&ledger, &config());
        assert_eq!(verdict.reason, Some(StopReason::RetryRate));
        let actual = verdict.actual.unwrap();
        assert!((actual - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_at_threshold_do_not_stop() {
        let ledger = ledger_with(&[(2, "approved"), (1, "failed")]);
        let verdict = evaluate(&ledger, &config());
        assert!(!verdict.should_stop, "{:?}", verdict);
    }

    #[test]
    fn test_stop_reason_serde() {
        let json = serde_json::to_string(&StopReason::ConsecutiveFails).unwrap();
        assert_eq!(json, "\"CONSECUTIVE_FAILS\"");
        assert_eq!(StopReason::UserAbort.to_string(), "USER_ABORT");
    }
}
