//! Collaborator contracts
//!
//! Generation and audit are external. The orchestrator only sees these two
//! traits; neither call can fail with an error, failures are values.

mod client;
mod command;

pub use client::{AuditRequest, AuditVerdict, FrameAuditor, FrameGenerator, GenerationRequest, GenerationResult};
pub use command::{CommandAuditor, CommandGenerator, CommandOutput, run_command};

#[cfg(test)]
pub use client::mock;
