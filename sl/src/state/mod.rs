//! Durable run state
//!
//! The attempt ledger is the single source of truth for a run. It is
//! persisted as a JSON snapshot after every orchestrator transition, and
//! read back by the run detector to decide whether a run can be resumed.

mod ledger;
mod recovery;
mod store;

pub use ledger::{AttemptLedger, CircuitBreakerStatus, FrameAttempts, LedgerError};
pub use recovery::{
    ExistingRun, ResumeDecision, canonicalize_json, config_hash, current_config_hash, decide_resumption,
    decide_resumption_for_run, find_existing_run, find_run_by_id, list_runs, load_existing_run,
};
pub use store::{
    CANDIDATES_DIR, CONFIG_SNAPSHOT_FILE, ConfigSnapshot, EVENTS_FILE, JsonStateStore, REPORT_FILE, RunPaths,
    STATE_FILE, StateStore, StoreError, atomic_write_file, read_json, write_json_atomic,
};
