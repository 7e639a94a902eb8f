//! Durable run storage
//!
//! Every run lives in its own folder `{identity-key}__{run-id}` under the runs
//! directory. Snapshots are replaced atomically: write a temp file in the same
//! directory, fsync it, rename over the target, fsync the directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::ledger::AttemptLedger;

/// Ledger snapshot file
pub const STATE_FILE: &str = "state.json";
/// Immutable configuration snapshot
pub const CONFIG_SNAPSHOT_FILE: &str = "config.json";
/// Diagnostic report written on STOPPED
pub const REPORT_FILE: &str = "report.json";
/// Append-only run event log
pub const EVENTS_FILE: &str = "events.jsonl";
/// Folder for generator output paths
pub const CANDIDATES_DIR: &str = "candidates";

const FOLDER_SEPARATOR: &str = "__";

/// Errors from durable storage
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error at {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Paths of one run folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub dir: PathBuf,
}

impl RunPaths {
    /// Folder for a run under the runs directory
    pub fn new(runs_dir: &Path, identity_key: &str, run_id: &str) -> Self {
        Self {
            dir: runs_dir.join(Self::folder_name(identity_key, run_id)),
        }
    }

    /// Wrap an existing run folder
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn folder_name(identity_key: &str, run_id: &str) -> String {
        format!("{}{}{}", identity_key, FOLDER_SEPARATOR, run_id)
    }

    /// Split a folder name into `(identity_key, run_id)`
    pub fn parse_folder_name(name: &str) -> Option<(&str, &str)> {
        let (key, run_id) = name.rsplit_once(FOLDER_SEPARATOR)?;
        if key.is_empty() || run_id.is_empty() {
            return None;
        }
        Some((key, run_id))
    }

    pub fn state(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn config_snapshot(&self) -> PathBuf {
        self.dir.join(CONFIG_SNAPSHOT_FILE)
    }

    pub fn report(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    pub fn events(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn candidates(&self) -> PathBuf {
        self.dir.join(CANDIDATES_DIR)
    }
}

/// Configuration a run was started with, written once before any generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub identity_key: String,
    pub config_hash: String,
    pub config: serde_json::Value,
    pub created_at: i64,
}

/// Durable ledger storage
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically replace the ledger snapshot of a run
    async fn save(&self, run_dir: &Path, ledger: &AttemptLedger) -> Result<(), StoreError>;

    /// Load the ledger snapshot; `None` if the run has none yet
    async fn load(&self, run_dir: &Path) -> Result<Option<AttemptLedger>, StoreError>;
}

/// JSON file store (`state.json` per run folder)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStateStore;

#[async_trait]
impl StateStore for JsonStateStore {
    async fn save(&self, run_dir: &Path, ledger: &AttemptLedger) -> Result<(), StoreError> {
        debug!(?run_dir, run_id = %ledger.run.run_id, phase = %ledger.run.phase, "JsonStateStore::save: called");
        write_json_atomic(&run_dir.join(STATE_FILE), ledger).await
    }

    async fn load(&self, run_dir: &Path) -> Result<Option<AttemptLedger>, StoreError> {
        debug!(?run_dir, "JsonStateStore::load: called");
        read_json(&run_dir.join(STATE_FILE)).await
    }
}

/// Serialize to pretty JSON and atomically replace `path`
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json(path, e))?;
    atomic_write_file(path, &content).await
}

/// Read and parse JSON; `None` if the file does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "read_json: not found");
            return Ok(None);
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let value = serde_json::from_slice(&content).map_err(|e| StoreError::json(path, e))?;
    Ok(Some(value))
}

/// Write-temp-then-rename with fsync of the file and its directory
pub async fn atomic_write_file(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::io(path, std::io::Error::other("path has no parent")))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("state"),
        std::process::id(),
        uuid::Uuid::now_v7().simple(),
    );
    let tmp_path = parent.join(tmp_name);
    debug!(?path, ?tmp_path, bytes = content.len(), "atomic_write_file: called");

    {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(content)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&tmp_path, e))?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(StoreError::io(path, e));
    }
    sync_parent_dir(parent).await.map_err(|e| StoreError::io(parent, e))?;
    Ok(())
}

#[cfg(unix)]
async fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(parent).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}
