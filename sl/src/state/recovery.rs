//! Run detection and resumption
//!
//! Decides at startup whether an earlier run of the same sequence can be
//! picked up again, and where.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::RunStatus;

use super::ledger::AttemptLedger;
use super::store::{ConfigSnapshot, RunPaths, StoreError, read_json};

/// A run found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRun {
    pub run_id: String,
    pub identity_key: String,
    pub run_path: PathBuf,
    pub status: RunStatus,
    /// Hash from the config snapshot; None if the snapshot was never written
    pub config_hash: Option<String>,
    pub total_frames: usize,
    pub approved_frames: Vec<usize>,
    /// Frames not approved yet, failed and rejected ones included
    pub pending_frames: Vec<usize>,
    pub total_attempts: u32,
    pub last_updated: i64,
}

impl std::fmt::Display for ExistingRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} [{:?}] approved {}/{}, attempts {}",
            self.run_id,
            self.identity_key,
            self.status,
            self.approved_frames.len(),
            self.total_frames,
            self.total_attempts
        )
    }
}

/// Outcome of the run detector
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResumeDecision {
    pub can_resume: bool,
    pub reason: String,
    pub existing_run: Option<ExistingRun>,
    pub first_pending_frame: Option<usize>,
    /// The stored config hash differs from the current one
    pub config_mismatch: bool,
    /// Approved frames whose artifact is missing or empty
    pub corrupted_frames: Vec<usize>,
}

impl ResumeDecision {
    fn refuse(reason: impl Into<String>, existing_run: Option<ExistingRun>) -> Self {
        Self {
            can_resume: false,
            reason: reason.into(),
            existing_run,
            ..Default::default()
        }
    }
}

/// Rebuild a JSON value with every object's keys in sorted order
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize_json(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

/// SHA-256 (hex) of the canonical JSON form
pub fn config_hash(value: &Value) -> String {
    let canonical = canonicalize_json(value).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hash of the run-shaping part of a config
pub fn current_config_hash(config: &Config) -> String {
    config_hash(&config.run_fingerprint())
}

/// Load the summary of one run folder
///
/// Returns None if the folder has no ledger snapshot.
pub async fn load_existing_run(run_dir: &Path) -> Result<Option<ExistingRun>, StoreError> {
    debug!(?run_dir, "load_existing_run: called");
    let paths = RunPaths::from_dir(run_dir);
    let Some(ledger) = read_json::<AttemptLedger>(&paths.state()).await? else {
        debug!("load_existing_run: no state snapshot");
        return Ok(None);
    };
    let snapshot = read_json::<ConfigSnapshot>(&paths.config_snapshot()).await?;

    let folder = run_dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let identity_key = match RunPaths::parse_folder_name(folder) {
        Some((key, _)) => key.to_string(),
        None => snapshot.as_ref().map(|s| s.identity_key.clone()).unwrap_or_default(),
    };

    Ok(Some(ExistingRun {
        run_id: ledger.run.run_id.clone(),
        identity_key,
        run_path: run_dir.to_path_buf(),
        status: ledger.run.status,
        config_hash: snapshot.map(|s| s.config_hash),
        total_frames: ledger.run.total_frames,
        approved_frames: ledger.run.approved_frames(),
        pending_frames: ledger.run.unaccepted_frames(),
        total_attempts: ledger.total_attempts,
        last_updated: ledger.run.updated_at,
    }))
}

/// List every run under the runs directory, most recently updated first
///
/// Folders that cannot be read are skipped with a warning.
pub async fn list_runs(runs_dir: &Path) -> Result<Vec<ExistingRun>, StoreError> {
    debug!(?runs_dir, "list_runs: called");
    let mut entries = match tokio::fs::read_dir(runs_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("list_runs: runs dir does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(StoreError::io(runs_dir, e)),
    };

    let mut runs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(runs_dir, e))? {
        let path = entry.path();
        let is_run_folder = entry
            .file_name()
            .to_str()
            .and_then(RunPaths::parse_folder_name)
            .is_some();
        if !is_run_folder || !path.is_dir() {
            continue;
        }
        match load_existing_run(&path).await {
            Ok(Some(run)) => runs.push(run),
            Ok(None) => debug!(?path, "list_runs: skipping folder without state"),
            Err(e) => warn!(?path, error = %e, "Skipping unreadable run folder"),
        }
    }

    runs.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    Ok(runs)
}

/// Most recently updated run of a sequence identity
pub async fn find_existing_run(runs_dir: &Path, identity_key: &str) -> Result<Option<ExistingRun>, StoreError> {
    debug!(?runs_dir, %identity_key, "find_existing_run: called");
    let runs = list_runs(runs_dir).await?;
    Ok(runs.into_iter().find(|r| r.identity_key == identity_key))
}

/// Find a run by id regardless of identity
pub async fn find_run_by_id(runs_dir: &Path, run_id: &str) -> Result<Option<ExistingRun>, StoreError> {
    debug!(?runs_dir, %run_id, "find_run_by_id: called");
    let runs = list_runs(runs_dir).await?;
    Ok(runs.into_iter().find(|r| r.run_id == run_id))
}

/// Decide whether the latest run of the configured sequence can be resumed
pub async fn decide_resumption(storage_root: &Path, config: &Config, force: bool) -> Result<ResumeDecision, StoreError> {
    let identity_key = config.identity_key();
    debug!(?storage_root, %identity_key, force, "decide_resumption: called");

    let Some(existing) = find_existing_run(storage_root, &identity_key).await? else {
        return Ok(ResumeDecision::refuse(
            format!("no existing run for {}", identity_key),
            None,
        ));
    };
    decide_for_existing(existing, config, force).await
}

/// Decide whether a specific run can be resumed
pub async fn decide_resumption_for_run(
    storage_root: &Path,
    run_id: &str,
    config: &Config,
    force: bool,
) -> Result<ResumeDecision, StoreError> {
    debug!(?storage_root, %run_id, force, "decide_resumption_for_run: called");
    let Some(existing) = find_run_by_id(storage_root, run_id).await? else {
        return Ok(ResumeDecision::refuse(format!("run {} not found", run_id), None));
    };
    decide_for_existing(existing, config, force).await
}

async fn decide_for_existing(existing: ExistingRun, config: &Config, force: bool) -> Result<ResumeDecision, StoreError> {
    debug!(run_id = %existing.run_id, status = ?existing.status, "decide_for_existing: called");

    if !existing.status.is_resumable() {
        return Ok(ResumeDecision::refuse(
            format!("run {} already completed", existing.run_id),
            Some(existing),
        ));
    }

    let current = current_config_hash(config);
    let config_mismatch = match &existing.config_hash {
        Some(stored) => *stored != current,
        None => {
            warn!(run_id = %existing.run_id, "Run has no config snapshot, skipping config check");
            false
        }
    };
    if config_mismatch && !force {
        info!(run_id = %existing.run_id, "Config changed since run started, refusing resume");
        return Ok(ResumeDecision {
            can_resume: false,
            reason: format!(
                "config changed since run {} started (use --force to resume anyway)",
                existing.run_id
            ),
            existing_run: Some(existing),
            config_mismatch: true,
            ..Default::default()
        });
    }

    let Some(first_pending_frame) = existing.pending_frames.first().copied() else {
        return Ok(ResumeDecision {
            config_mismatch,
            ..ResumeDecision::refuse(
                format!("all frames of run {} already approved", existing.run_id),
                Some(existing),
            )
        });
    };

    let corrupted_frames = check_artifacts(&existing).await?;
    if !corrupted_frames.is_empty() {
        warn!(run_id = %existing.run_id, ?corrupted_frames, "Approved frames have missing or empty artifacts");
    }
    if config_mismatch {
        warn!(run_id = %existing.run_id, "Resuming despite config change (forced)");
    }

    info!(run_id = %existing.run_id, first_pending_frame, "Run can be resumed");
    Ok(ResumeDecision {
        can_resume: true,
        reason: format!("resuming run {} at frame {}", existing.run_id, first_pending_frame),
        existing_run: Some(existing),
        first_pending_frame: Some(first_pending_frame),
        config_mismatch,
        corrupted_frames,
    })
}

/// Approved frames whose artifact is missing or zero bytes
async fn check_artifacts(existing: &ExistingRun) -> Result<Vec<usize>, StoreError> {
    let paths = RunPaths::from_dir(&existing.run_path);
    let ledger = read_json::<AttemptLedger>(&paths.state()).await?;
    let Some(ledger) = ledger else {
        return Ok(Vec::new());
    };

    let mut corrupted = Vec::new();
    for (index, artifact) in ledger.run.accepted_artifacts().into_iter().enumerate() {
        let Some(artifact) = artifact else { continue };
        let ok = match tokio::fs::metadata(&artifact).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        };
        if !ok {
            debug!(index, %artifact, "check_artifacts: artifact missing or empty");
            corrupted.push(index);
        }
    }
    Ok(corrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptOutcome, NewAttempt};
    use crate::state::{StateStore, JsonStateStore, write_json_atomic};
    use serde_json::json;
    use tempfile::tempdir;

    async fn seed_run(runs_dir: &Path, config: &Config, run_id: &str, ledger: &AttemptLedger) -> RunPaths {
        let paths = RunPaths::new(runs_dir, &config.identity_key(), run_id);
        JsonStateStore.save(&paths.dir, ledger).await.unwrap();
        let snapshot = ConfigSnapshot {
            identity_key: config.identity_key(),
            config_hash: current_config_hash(config),
            config: config.run_fingerprint(),
            created_at: 0,
        };
        write_json_atomic(&paths.config_snapshot(), &snapshot).await.unwrap();
        paths
    }

    fn approved_first_frame(run_id: &str, artifact: &str) -> AttemptLedger {
        AttemptLedger::initialize(run_id, 3)
            .record_attempt(0, NewAttempt::new("p"))
            .unwrap()
            .update_attempt_result(0, AttemptOutcome::from_verdict(true, vec![], Some(0.9), None))
            .unwrap()
            .mark_approved(0, artifact)
            .unwrap()
            .with_status(RunStatus::InProgress)
            .unwrap()
    }

    #[test]
    fn test_config_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "v"}});
        let b = json!({"a": {"x": "v", "y": [1, 2]}, "b": 1});
        assert_eq!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a).len(), 64);

        let c = json!({"a": {"x": "v", "y": [2, 1]}, "b": 1});
        assert_ne!(config_hash(&a), config_hash(&c));
    }

    #[tokio::test]
    async fn test_no_existing_run() {
        let temp = tempdir().unwrap();
        let decision = decide_resumption(temp.path(), &Config::default(), false).await.unwrap();
        assert!(!decision.can_resume);
        assert!(decision.existing_run.is_none());
    }

    #[tokio::test]
    async fn test_resume_first_pending_frame() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("f0.png");
        std::fs::write(&artifact, b"png").unwrap();
        let config = Config::default();
        let ledger = approved_first_frame("r1", artifact.to_str().unwrap());
        seed_run(temp.path(), &config, "r1", &ledger).await;

        let decision = decide_resumption(temp.path(), &config, false).await.unwrap();
        assert!(decision.can_resume, "{}", decision.reason);
        assert_eq!(decision.first_pending_frame, Some(1));
        assert!(!decision.config_mismatch);
        assert!(decision.corrupted_frames.is_empty());
        assert_eq!(decision.existing_run.unwrap().approved_frames, vec![0]);
    }

    #[tokio::test]
    async fn test_completed_run_not_resumed() {
        let temp = tempdir().unwrap();
        let config = Config::default();
        let ledger = AttemptLedger::initialize("r1", 1)
            .with_status(RunStatus::InProgress)
            .unwrap()
            .with_status(RunStatus::Completed)
            .unwrap();
        seed_run(temp.path(), &config, "r1", &ledger).await;

        let decision = decide_resumption(temp.path(), &config, false).await.unwrap();
        assert!(!decision.can_resume);
        assert!(decision.reason.contains("already completed"));
    }

    #[tokio::test]
    async fn test_config_mismatch_refused_unless_forced() {
        let temp = tempdir().unwrap();
        let config = Config::default();
        seed_run(temp.path(), &config, "r1", &AttemptLedger::initialize("r1", 3)).await;

        let mut changed = config.clone();
        changed.retry.max_attempts_per_frame += 1;

        let decision = decide_resumption(temp.path(), &changed, false).await.unwrap();
        assert!(!decision.can_resume);
        assert!(decision.config_mismatch);

        let forced = decide_resumption(temp.path(), &changed, true).await.unwrap();
        assert!(forced.can_resume);
        assert!(forced.config_mismatch);
        assert_eq!(forced.first_pending_frame, Some(0));
    }

    #[tokio::test]
    async fn test_log_level_does_not_affect_hash() {
        let config = Config::default();
        let mut other = config.clone();
        other.log_level = Some("debug".to_string());
        assert_eq!(current_config_hash(&config), current_config_hash(&other));
    }

    #[tokio::test]
    async fn test_rejected_frames_are_resumed() {
        let temp = tempdir().unwrap();
        let config = Config::default();
        let ledger = AttemptLedger::initialize("r1", 2)
            .with_status(RunStatus::InProgress)
            .unwrap()
            .mark_rejected(0, "x")
            .mark_rejected(1, "y")
            .with_status(RunStatus::Paused)
            .unwrap();
        seed_run(temp.path(), &config, "r1", &ledger).await;

        let decision = decide_resumption(temp.path(), &config, false).await.unwrap();
        assert!(decision.can_resume, "{}", decision.reason);
        assert_eq!(decision.first_pending_frame, Some(0));
        assert_eq!(decision.existing_run.unwrap().pending_frames, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_stopped_run_resumes_at_first_failed_frame() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("f0.png");
        std::fs::write(&artifact, b"png").unwrap();
        let config = Config::default();
        let ledger = approved_first_frame("r1", artifact.to_str().unwrap())
            .mark_max_attempts_reached(1)
            .mark_max_attempts_reached(2)
            .with_stop_reason("CONSECUTIVE_FAILS")
            .with_status(RunStatus::Paused)
            .unwrap();
        seed_run(temp.path(), &config, "r1", &ledger).await;

        let decision = decide_resumption(temp.path(), &config, false).await.unwrap();
        assert!(decision.can_resume, "{}", decision.reason);
        assert_eq!(decision.first_pending_frame, Some(1));
    }

    #[tokio::test]
    async fn test_all_approved_refused() {
        let temp = tempdir().unwrap();
        let config = Config::default();
        let ledger = AttemptLedger::initialize("r1", 2)
            .mark_approved(0, "f0.png")
            .unwrap()
            .mark_approved(1, "f1.png")
            .unwrap()
            .with_status(RunStatus::InProgress)
            .unwrap();
        seed_run(temp.path(), &config, "r1", &ledger).await;

        let decision = decide_resumption(temp.path(), &config, false).await.unwrap();
        assert!(!decision.can_resume);
        assert!(decision.reason.contains("already approved"));
    }

    #[tokio::test]
    async fn test_decision_is_stable_across_calls() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("f0.png");
        std::fs::write(&artifact, b"png").unwrap();
        let config = Config::default();
        let ledger = approved_first_frame("r1", artifact.to_str().unwrap());
        seed_run(temp.path(), &config, "r1", &ledger).await;

        let first = decide_resumption(temp.path(), &config, false).await.unwrap();
        let second = decide_resumption(temp.path(), &config, false).await.unwrap();
        assert!(first.can_resume);
        assert_eq!(first.first_pending_frame, second.first_pending_frame);
        assert_eq!(first.existing_run, second.existing_run);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_corrupted_artifact_is_warning() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("empty.png");
        std::fs::write(&artifact, b"").unwrap();
        let config = Config::default();
        let ledger = approved_first_frame("r1", artifact.to_str().unwrap());
        seed_run(temp.path(), &config, "r1", &ledger).await;

        let decision = decide_resumption(temp.path(), &config, false).await.unwrap();
        assert!(decision.can_resume);
        assert_eq!(decision.corrupted_frames, vec![0]);
    }

    #[tokio::test]
    async fn test_resume_specific_run() {
        let temp = tempdir().unwrap();
        let config = Config::default();
        seed_run(temp.path(), &config, "r1", &AttemptLedger::initialize("r1", 3)).await;

        let found = decide_resumption_for_run(temp.path(), "r1", &config, false).await.unwrap();
        assert!(found.can_resume);

        let missing = decide_resumption_for_run(temp.path(), "nope", &config, false).await.unwrap();
        assert!(!missing.can_resume);
        assert!(missing.reason.contains("not found"));
    }

    #[tokio::test]
    async fn test_list_runs_skips_foreign_folders() {
        let temp = tempdir().unwrap();
        let config = Config::default();
        seed_run(temp.path(), &config, "r1", &AttemptLedger::initialize("r1", 3)).await;
        std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();
        std::fs::create_dir_all(temp.path().join("x__broken")).unwrap();
        std::fs::write(temp.path().join("x__broken").join("state.json"), b"{oops").unwrap();

        let runs = list_runs(temp.path()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "r1");
        assert_eq!(runs[0].identity_key, config.identity_key());
    }
}
