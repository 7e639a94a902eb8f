//! Frame loop
//!
//! The [`Orchestrator`] drives a run frame by frame through the phase state
//! machine. Reference selection and stop-condition evaluation are pure helpers
//! it consults along the way.

mod engine;
mod prompt;
mod reference;
mod stop;

pub use engine::{AbortHandle, Orchestrator, OrchestratorError, RunOutcome, StartMode};
pub use prompt::{PromptContext, PromptRenderer};
pub use reference::{ReferenceSelection, ReferenceSource, find_next_pending_frame, has_sequence_gaps, select_reference};
pub use stop::{RunStatistics, StopReason, StopVerdict, compute_statistics, evaluate};
