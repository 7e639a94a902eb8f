//! Domain types for SpriteLoop
//!
//! Core domain types: RunState, FrameState, AttemptRecord, ReasonCode, Phase.
//! Everything here is plain serde data; persistence lives in [`crate::state`].

mod attempt;
mod id;
mod phase;
mod reason;
mod run;

pub use attempt::{AttemptOutcome, AttemptRecord, AttemptResult, FinalStatus, NewAttempt, hash_prompt};
pub use id::{generate_run_id, identity_key, slugify};
pub use phase::{Phase, PhaseTransitionError};
pub use reason::{ReasonCode, RetryAction, classify_reason_codes, primary_reason};
pub use run::{FatalRecord, FrameState, FrameStatus, RunState, RunStatus, StatusTransitionError};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
