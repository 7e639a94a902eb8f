//! Generation and audit collaborator traits

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{AttemptOutcome, RetryAction, classify_reason_codes};
use crate::r#loop::ReferenceSource;

/// Input for one generation attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub run_id: String,
    pub frame_index: usize,
    pub attempt_index: u32,
    pub total_frames: usize,
    /// Reference artifact to condition on
    pub reference: String,
    pub reference_source: ReferenceSource,
    /// Rendered prompt context
    pub prompt: String,
    /// Ladder rung for retries, None on the first attempt
    pub retry_action: Option<RetryAction>,
    /// Suggested path for the candidate artifact
    pub output_path: PathBuf,
}

/// Result of a generation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationResult {
    Generated {
        artifact: String,
        raw_prompt: String,
        seed: Option<u64>,
    },
    Failed {
        message: String,
        raw_prompt: String,
    },
}

impl GenerationResult {
    /// Prompt that was actually sent
    pub fn raw_prompt(&self) -> &str {
        match self {
            GenerationResult::Generated { raw_prompt, .. } | GenerationResult::Failed { raw_prompt, .. } => raw_prompt,
        }
    }
}

/// Input for auditing one candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRequest {
    pub run_id: String,
    pub frame_index: usize,
    pub attempt_index: u32,
    pub candidate: String,
    pub reference: String,
    pub baseline: String,
}

/// Verdict from the audit collaborator
///
/// Reason codes arrive as raw strings and are classified by
/// [`AuditVerdict::into_outcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub passed: bool,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub composite_score: Option<f64>,
    #[serde(default)]
    pub identity_score: Option<f64>,
}

impl AuditVerdict {
    pub fn pass(composite_score: f64) -> Self {
        Self {
            passed: true,
            reason_codes: Vec::new(),
            composite_score: Some(composite_score),
            identity_score: None,
        }
    }

    pub fn fail(reason_codes: &[&str], composite_score: Option<f64>) -> Self {
        Self {
            passed: false,
            reason_codes: reason_codes.iter().map(|s| s.to_string()).collect(),
            composite_score,
            identity_score: None,
        }
    }

    /// Builder method to set the identity score
    pub fn with_identity_score(mut self, score: f64) -> Self {
        self.identity_score = Some(score);
        self
    }

    /// Classify into the ledger outcome
    pub fn into_outcome(self) -> AttemptOutcome {
        let codes = classify_reason_codes(&self.reason_codes);
        AttemptOutcome::from_verdict(self.passed, codes, self.composite_score, self.identity_score)
    }
}

/// Produces one candidate frame per call
#[async_trait]
pub trait FrameGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult;
}

/// Evaluates one candidate frame per call
#[async_trait]
pub trait FrameAuditor: Send + Sync {
    async fn audit(&self, request: &AuditRequest) -> AuditVerdict;
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptResult, ReasonCode};

    #[test]
    fn test_verdict_into_outcome() {
        let outcome = AuditVerdict::fail(&["HF05_EXTRA_LIMBS", "SF02_PALETTE_DRIFT"], Some(0.4))
            .with_identity_score(0.7)
            .into_outcome();
        assert_eq!(outcome.result, AttemptResult::HardFail);
        assert_eq!(outcome.reason_codes, vec![ReasonCode::ExtraLimbs, ReasonCode::PaletteDrift]);
        assert_eq!(outcome.ladder_score(), Some(0.7));
    }

    #[test]
    fn test_verdict_deserialize_minimal() {
        let verdict: AuditVerdict = serde_json::from_str(r#"{"passed": false}"#).unwrap();
        assert!(!verdict.passed);
        assert!(verdict.reason_codes.is_empty());
        assert_eq!(verdict.into_outcome().reason_codes, vec![ReasonCode::Unclassified]);
    }

    #[test]
    fn test_generation_result_raw_prompt() {
        let failed = GenerationResult::Failed {
            message: "boom".to_string(),
            raw_prompt: "p".to_string(),
        };
        assert_eq!(failed.raw_prompt(), "p");
    }

    #[tokio::test]
    async fn test_scripted_auditor_passes_after_script() {
        use mock::ScriptedAuditor;
        let auditor = ScriptedAuditor::new().with_script(0, vec![AuditVerdict::fail(&["SF03_LINE_DRIFT"], None)]);
        let request = AuditRequest {
            run_id: "r".to_string(),
            frame_index: 0,
            attempt_index: 1,
            candidate: "c.png".to_string(),
            reference: "b.png".to_string(),
            baseline: "b.png".to_string(),
        };
        assert!(!auditor.audit(&request).await.passed);
        assert!(auditor.audit(&request).await.passed);
        assert_eq!(auditor.call_count(), 2);
    }
}
