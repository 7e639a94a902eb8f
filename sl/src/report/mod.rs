//! Diagnostic reports
//!
//! Written when a run halts early, so an operator can see why it stopped and
//! what to change before resuming.

mod diagnostics;

pub use diagnostics::{FrameBreakdown, ReasonCount, Remediation, StopReport, load_report, save_report};
