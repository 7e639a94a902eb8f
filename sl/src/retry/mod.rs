//! Retry ladder
//!
//! Decides what to do after a failed attempt: the next rung for the failure
//! reason, an escalation, or giving up on the frame. The per-frame history the
//! ladder reads lives in a [`RetryTable`] owned by the orchestrator.

mod ladder;
mod state;

pub use ladder::{LadderDecision, LadderStopReason, RetryDecision, RetryLadder, StopDecision};
pub use state::{RetryState, RetryTable};
