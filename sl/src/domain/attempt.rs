//! AttemptRecord domain type
//!
//! One record per generation attempt for a frame. Records are appended by the
//! ledger and only ever filled in once, after the audit.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::now_ms;
use super::reason::{ReasonCode, RetryAction};

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    /// Generated, not yet audited
    #[default]
    Pending,
    /// Audit accepted the candidate
    Passed,
    /// Audit rejected it on soft metrics only
    SoftFail,
    /// Audit rejected it on a hard gate (or nothing was generated)
    HardFail,
}

impl AttemptResult {
    /// Check if the attempt failed
    pub fn is_failure(self) -> bool {
        matches!(self, AttemptResult::SoftFail | AttemptResult::HardFail)
    }
}

impl std::fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptResult::Pending => write!(f, "pending"),
            AttemptResult::Passed => write!(f, "passed"),
            AttemptResult::SoftFail => write!(f, "soft_fail"),
            AttemptResult::HardFail => write!(f, "hard_fail"),
        }
    }
}

/// Final verdict for a frame in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// A candidate was accepted
    Approved,
    /// The per-frame attempt cap was reached
    Failed,
    /// The retry ladder gave up on the frame
    Rejected,
}

impl FinalStatus {
    /// Failed and rejected both count against the run
    pub fn is_failure(self) -> bool {
        matches!(self, FinalStatus::Failed | FinalStatus::Rejected)
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalStatus::Approved => write!(f, "approved"),
            FinalStatus::Failed => write!(f, "failed"),
            FinalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// A single generation attempt for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based, strictly increasing per frame
    pub attempt_index: u32,

    /// When the attempt was recorded (Unix milliseconds)
    pub timestamp: i64,

    /// SHA-256 prefix of the raw prompt sent to the generator
    pub prompt_hash: String,

    /// Seed reported by the generator, if any
    #[serde(default)]
    pub seed: Option<u64>,

    /// Audit outcome
    pub result: AttemptResult,

    /// Reason codes reported by the audit
    #[serde(default)]
    pub reason_codes: Vec<ReasonCode>,

    /// Composite quality score in [0, 1]
    #[serde(default)]
    pub composite_score: Option<f64>,

    /// Identity similarity score in [0, 1]
    #[serde(default)]
    pub identity_score: Option<f64>,

    /// Generation wall time
    pub duration_ms: u64,

    /// Ladder rung this attempt was generated with (None for the first attempt)
    #[serde(default)]
    pub retry_strategy: Option<RetryAction>,
}

/// Inputs for a new ledger record; the ledger assigns index and timestamp
#[derive(Debug, Clone, Default)]
pub struct NewAttempt {
    pub prompt_hash: String,
    pub seed: Option<u64>,
    pub duration_ms: u64,
    pub retry_strategy: Option<RetryAction>,
}

impl NewAttempt {
    /// Create from the raw prompt that was sent to the generator
    pub fn new(raw_prompt: &str) -> Self {
        Self {
            prompt_hash: hash_prompt(raw_prompt),
            ..Default::default()
        }
    }

    /// Builder method to set the seed
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Builder method to set the generation duration
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Builder method to set the ladder rung
    pub fn with_retry_strategy(mut self, action: Option<RetryAction>) -> Self {
        self.retry_strategy = action;
        self
    }

    pub(crate) fn into_record(self, attempt_index: u32) -> AttemptRecord {
        AttemptRecord {
            attempt_index,
            timestamp: now_ms(),
            prompt_hash: self.prompt_hash,
            seed: self.seed,
            result: AttemptResult::Pending,
            reason_codes: Vec::new(),
            composite_score: None,
            identity_score: None,
            duration_ms: self.duration_ms,
            retry_strategy: self.retry_strategy,
        }
    }
}

/// Audit result to fill into the latest pending record
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub result: AttemptResult,
    pub reason_codes: Vec<ReasonCode>,
    pub composite_score: Option<f64>,
    pub identity_score: Option<f64>,
}

impl AttemptOutcome {
    /// Build from an audit verdict
    ///
    /// A failed verdict is a hard fail if any code is a hard gate, otherwise
    /// a soft fail. A failed verdict with no codes is tagged `Unclassified`.
    pub fn from_verdict(
        passed: bool,
        mut reason_codes: Vec<ReasonCode>,
        composite_score: Option<f64>,
        identity_score: Option<f64>,
    ) -> Self {
        debug!(passed, ?reason_codes, "AttemptOutcome::from_verdict: called");
        let result = if passed {
            AttemptResult::Passed
        } else {
            if reason_codes.is_empty() {
                debug!("AttemptOutcome::from_verdict: failed without codes");
                reason_codes.push(ReasonCode::Unclassified);
            }
            if reason_codes.iter().any(|c| c.is_hard_gate()) {
                AttemptResult::HardFail
            } else {
                AttemptResult::SoftFail
            }
        };
        Self {
            result,
            reason_codes,
            composite_score,
            identity_score,
        }
    }

    /// Hard fail for a generation that produced nothing
    pub fn generation_failed() -> Self {
        Self::from_verdict(false, vec![ReasonCode::GenerationFailed], None, None)
    }

    /// Score fed to the retry ladder: identity when present, else composite
    pub fn ladder_score(&self) -> Option<f64> {
        self.identity_score.or(self.composite_score)
    }

    pub fn passed(&self) -> bool {
        self.result == AttemptResult::Passed
    }
}

impl AttemptRecord {
    /// Score fed to the retry ladder: identity when present, else composite
    pub fn ladder_score(&self) -> Option<f64> {
        self.identity_score.or(self.composite_score)
    }
}

/// Short SHA-256 hex digest of a prompt
pub fn hash_prompt(raw_prompt: &str) -> String {
    let digest = Sha256::digest(raw_prompt.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}
