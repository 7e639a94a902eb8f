//! SpriteLoop - resumable generate/audit/retry orchestrator for frame sequences
//!
//! SpriteLoop produces an animation one frame at a time. Each frame is
//! generated from the previous accepted frame (or the baseline), audited, and
//! retried through a deterministic ladder of corrective actions until it is
//! accepted or given up on. After every frame the run checks its stop
//! conditions and halts early, with a diagnostic report, instead of burning
//! through the attempt budget.
//!
//! # Core Concepts
//!
//! - **Durable ledger**: every attempt is recorded and snapshotted after each
//!   state-machine transition, so a killed run resumes without redoing work
//! - **Retry ladder**: failure reason codes map to ordered corrective actions,
//!   with identity-collapse and oscillation detection
//! - **Stop conditions**: circuit breaker, consecutive failures, reject rate
//!   and retry rate, checked in that order
//!
//! # Modules
//!
//! - [`domain`] - Run, frame and attempt types, reason codes, phases
//! - [`state`] - Attempt ledger, durable store, run detection
//! - [`retry`] - Retry ladder and per-frame retry history
//! - [`r#loop`] - Orchestrator, reference selection, stop conditions
//! - [`adapter`] - Generation and audit collaborators
//! - [`report`] - Diagnostic stop reports
//! - [`events`] - Run event log
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod adapter;
pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod report;
pub mod retry;
pub mod state;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use adapter::{
    AuditRequest, AuditVerdict, CommandAuditor, CommandGenerator, FrameAuditor, FrameGenerator, GenerationRequest,
    GenerationResult,
};
pub use config::{Config, RetryConfig, SequenceConfig, StopConditionsConfig};
pub use domain::{
    AttemptRecord, AttemptResult, FinalStatus, FrameStatus, Phase, ReasonCode, RetryAction, RunState, RunStatus,
};
pub use events::{EventLogEntry, EventLogger, RunEvent, read_run_events};
pub use r#loop::{
    AbortHandle, Orchestrator, OrchestratorError, RunOutcome, RunStatistics, StartMode, StopReason, StopVerdict,
};
pub use report::StopReport;
pub use retry::{LadderDecision, RetryLadder, RetryState, RetryTable};
pub use state::{AttemptLedger, JsonStateStore, ResumeDecision, RunPaths, StateStore, StoreError};
