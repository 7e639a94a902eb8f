//! Run event log
//!
//! Every significant orchestrator step is appended to the run's
//! `events.jsonl`, one [`EventLogEntry`] per line. The log is for history and
//! debugging; resumption never reads it.

mod logger;
mod types;

pub use logger::{EventLogger, read_run_events};
pub use types::{EventLogEntry, RunEvent};
