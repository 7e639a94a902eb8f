//! Stop report construction and storage

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{FinalStatus, FrameStatus, ReasonCode};
use crate::r#loop::{RunStatistics, StopReason, StopVerdict};
use crate::state::{AttemptLedger, StoreError, read_json, write_json_atomic};

/// How many reason codes the report ranks
const TOP_CODES: usize = 5;

/// Per-frame line of the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameBreakdown {
    pub index: usize,
    pub status: FrameStatus,
    pub attempts: u32,
    pub final_status: Option<FinalStatus>,
    pub final_reason: Option<String>,
    /// Distinct codes seen across all attempts, first-seen order
    pub reason_codes: Vec<ReasonCode>,
    /// Ladder score of the latest audited attempt
    pub last_score: Option<f64>,
}

/// Reason code frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonCount {
    pub code: ReasonCode,
    pub count: usize,
}

/// Suggested change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remediation {
    /// Code the suggestion addresses; None for run-level advice
    pub code: Option<ReasonCode>,
    pub suggestion: String,
}

/// Diagnostic report for a halted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopReport {
    pub run_id: String,
    pub identity_key: String,
    pub stop_reason: StopReason,
    pub threshold: Option<f64>,
    pub actual: Option<f64>,
    pub message: String,
    pub statistics: RunStatistics,
    pub frames: Vec<FrameBreakdown>,
    pub top_reason_codes: Vec<ReasonCount>,
    pub remediations: Vec<Remediation>,
    pub generated_at: DateTime<Utc>,
}

impl StopReport {
    /// Build the report from the ledger and the halt verdict
    pub fn build(ledger: &AttemptLedger, identity_key: &str, reason: StopReason, verdict: &StopVerdict) -> Self {
        debug!(run_id = %ledger.run.run_id, %reason, "StopReport::build: called");
        let frames = frame_breakdown(ledger);
        let top_reason_codes = top_reason_codes(ledger);
        let remediations = remediations(reason, &top_reason_codes);
        let message = summary_message(reason, verdict);

        Self {
            run_id: ledger.run.run_id.clone(),
            identity_key: identity_key.to_string(),
            stop_reason: reason,
            threshold: verdict.threshold,
            actual: verdict.actual,
            message,
            statistics: verdict.statistics.clone(),
            frames,
            top_reason_codes,
            remediations,
            generated_at: Utc::now(),
        }
    }
}

fn frame_breakdown(ledger: &AttemptLedger) -> Vec<FrameBreakdown> {
    ledger
        .run
        .frame_states
        .iter()
        .map(|state| {
            let entry = ledger.frame_attempts(state.index);
            let mut reason_codes = Vec::new();
            let mut last_score = None;
            if let Some(entry) = entry {
                for record in &entry.attempts {
                    for code in &record.reason_codes {
                        if !reason_codes.contains(code) {
                            reason_codes.push(*code);
                        }
                    }
                    if let Some(score) = record.ladder_score() {
                        last_score = Some(score);
                    }
                }
            }
            FrameBreakdown {
                index: state.index,
                status: state.status,
                attempts: state.attempts,
                final_status: entry.and_then(|e| e.final_status),
                final_reason: entry.and_then(|e| e.final_reason.clone()),
                reason_codes,
                last_score,
            }
        })
        .collect()
}

fn top_reason_codes(ledger: &AttemptLedger) -> Vec<ReasonCount> {
    let mut counts: HashMap<ReasonCode, usize> = HashMap::new();
    for entry in &ledger.frames {
        for record in &entry.attempts {
            for code in &record.reason_codes {
                *counts.entry(*code).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<ReasonCount> = counts.into_iter().map(|(code, count)| ReasonCount { code, count }).collect();
    // Ties broken by table order so reports are stable
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then(a.code.cmp(&b.code)));
    ranked.truncate(TOP_CODES);
    ranked
}

fn remediations(reason: StopReason, top: &[ReasonCount]) -> Vec<Remediation> {
    let mut out: Vec<Remediation> = top
        .iter()
        .take(3)
        .map(|rc| Remediation {
            code: Some(rc.code),
            suggestion: rc.code.remediation().to_string(),
        })
        .collect();

    let run_level = match reason {
        StopReason::CircuitBreaker => {
            "Attempt budget spent. Fix the dominant failure before raising stop-conditions.circuit-breaker-limit"
        }
        StopReason::ConsecutiveFails => {
            "Several frames in a row failed. Check the last accepted frame for drift before resuming"
        }
        StopReason::RejectRate => "Too many frames rejected. Revisit the baseline and prompt template",
        StopReason::RetryRate => "Most frames need retries. Tune generation settings for first-pass quality",
        StopReason::UserAbort => "Run was aborted. Resume it with `sl resume <run-id>`",
    };
    out.push(Remediation {
        code: None,
        suggestion: run_level.to_string(),
    });
    out
}

fn summary_message(reason: StopReason, verdict: &StopVerdict) -> String {
    let stats = &verdict.statistics;
    match (verdict.threshold, verdict.actual) {
        (Some(threshold), Some(actual)) => format!(
            "{}: {} crossed limit {} ({} of {} frames approved, {} attempts)",
            reason,
            format_value(reason, actual),
            format_value(reason, threshold),
            stats.frames_approved,
            stats.frames_finished,
            stats.total_attempts
        ),
        _ => format!(
            "{} ({} of {} frames approved, {} attempts)",
            reason, stats.frames_approved, stats.frames_finished, stats.total_attempts
        ),
    }
}

fn format_value(reason: StopReason, value: f64) -> String {
    match reason {
        StopReason::RejectRate | StopReason::RetryRate => format!("{:.0}%", value * 100.0),
        _ => format!("{}", value),
    }
}

impl std::fmt::Display for StopReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run {} ({}) stopped", self.run_id, self.identity_key)?;
        writeln!(f, "  {}", self.message)?;
        writeln!(
            f,
            "  retry rate {:.0}%, reject rate {:.0}%, consecutive failures {}, est. cost {:.2}",
            self.statistics.retry_rate * 100.0,
            self.statistics.reject_rate * 100.0,
            self.statistics.consecutive_failures,
            self.statistics.estimated_cost
        )?;
        writeln!(f, "Frames:")?;
        for frame in &self.frames {
            let codes: Vec<&str> = frame.reason_codes.iter().map(|c| c.as_str()).collect();
            write!(f, "  {:>3}  {:<11} attempts {}", frame.index, frame.status, frame.attempts)?;
            if let Some(reason) = &frame.final_reason {
                write!(f, "  [{}]", reason)?;
            }
            if !codes.is_empty() {
                write!(f, "  {}", codes.join(","))?;
            }
            writeln!(f)?;
        }
        if !self.top_reason_codes.is_empty() {
            writeln!(f, "Top reason codes:")?;
            for rc in &self.top_reason_codes {
                writeln!(f, "  {:<24} {:>3}  {}", rc.code.as_str(), rc.count, rc.code.description())?;
            }
        }
        writeln!(f, "Suggested changes:")?;
        for r in &self.remediations {
            match r.code {
                Some(code) => writeln!(f, "  - {}: {}", code, r.suggestion)?,
                None => writeln!(f, "  - {}", r.suggestion)?,
            }
        }
        Ok(())
    }
}

/// Atomically write the report
pub async fn save_report(path: &Path, report: &StopReport) -> Result<(), StoreError> {
    debug!(?path, "save_report: called");
    write_json_atomic(path, report).await
}

/// Load a report; None if the run has none
pub async fn load_report(path: &Path) -> Result<Option<StopReport>, StoreError> {
    read_json(path).await
}
