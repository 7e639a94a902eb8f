//! Run event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttemptResult, FinalStatus, Phase, ReasonCode, RetryAction};
use crate::r#loop::{ReferenceSource, StopReason};

/// Observable orchestrator activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    // === Run Lifecycle ===
    /// A run started or was resumed
    RunStarted {
        run_id: String,
        identity_key: String,
        total_frames: usize,
        resumed: bool,
    },
    /// The orchestrator moved to a new phase
    PhaseChanged { from: Phase, to: Phase, frame: usize },
    /// The run halted early
    RunStopped {
        reason: StopReason,
        threshold: Option<f64>,
        actual: Option<f64>,
    },
    /// Every frame resolved
    RunCompleted {
        approved: usize,
        failed: usize,
        total_attempts: u32,
    },
    /// Fatal error
    RunFailed {
        phase: Phase,
        frame: Option<usize>,
        cause: String,
    },

    // === Attempts ===
    /// A generation attempt was made
    AttemptGenerated {
        frame: usize,
        attempt: u32,
        reference_source: ReferenceSource,
        retry_action: Option<RetryAction>,
        generated: bool,
    },
    /// An attempt was audited
    AttemptAudited {
        frame: usize,
        attempt: u32,
        result: AttemptResult,
        reason_codes: Vec<ReasonCode>,
        composite_score: Option<f64>,
    },
    /// The retry ladder chose a rung
    RetryScheduled {
        frame: usize,
        attempt: u32,
        reason: ReasonCode,
        action: RetryAction,
    },

    // === Frames ===
    /// A candidate was accepted
    FrameApproved {
        frame: usize,
        attempts: u32,
        artifact: String,
    },
    /// A frame was given up on
    FrameFailed {
        frame: usize,
        attempts: u32,
        status: FinalStatus,
        reason: String,
    },

    // === Diagnostics ===
    /// Non-fatal problem worth keeping in the history
    Warning { message: String },
}

impl RunEvent {
    /// Short event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "RunStarted",
            RunEvent::PhaseChanged { .. } => "PhaseChanged",
            RunEvent::RunStopped { .. } => "RunStopped",
            RunEvent::RunCompleted { .. } => "RunCompleted",
            RunEvent::RunFailed { .. } => "RunFailed",
            RunEvent::AttemptGenerated { .. } => "AttemptGenerated",
            RunEvent::AttemptAudited { .. } => "AttemptAudited",
            RunEvent::RetryScheduled { .. } => "RetryScheduled",
            RunEvent::FrameApproved { .. } => "FrameApproved",
            RunEvent::FrameFailed { .. } => "FrameFailed",
            RunEvent::Warning { .. } => "Warning",
        }
    }
}

/// Line in `events.jsonl`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Timestamp of the event
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// The event
    pub event: RunEvent,
}

impl EventLogEntry {
    /// Create a new log entry with current timestamp
    pub fn new(event: RunEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
