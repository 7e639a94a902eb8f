//! SpriteLoop configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::identity_key;

/// Main SpriteLoop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Where runs are stored
    pub storage: StorageConfig,

    /// The frame sequence to produce
    pub sequence: SequenceConfig,

    /// Per-frame retry behavior
    pub retry: RetryConfig,

    /// Run-level halt thresholds
    #[serde(rename = "stop-conditions")]
    pub stop_conditions: StopConditionsConfig,

    /// Generation collaborator command
    pub generator: CommandConfig,

    /// Audit collaborator command
    pub auditor: CommandConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        debug!("Config::validate: called");
        if self.sequence.character.trim().is_empty() || self.sequence.animation.trim().is_empty() {
            return Err(eyre::eyre!("sequence.character and sequence.animation must be set"));
        }
        if self.identity_key().is_empty() {
            return Err(eyre::eyre!(
                "sequence.character/animation produce an empty identity key: {:?}/{:?}",
                self.sequence.character,
                self.sequence.animation
            ));
        }
        if self.sequence.total_frames == 0 {
            return Err(eyre::eyre!("sequence.total-frames must be at least 1"));
        }
        if self.sequence.baseline.trim().is_empty() {
            return Err(eyre::eyre!("sequence.baseline must reference the baseline image"));
        }
        if self.retry.max_attempts_per_frame == 0 {
            return Err(eyre::eyre!("retry.max-attempts-per-frame must be at least 1"));
        }
        check_unit("retry.collapse-threshold", self.retry.collapse_threshold)?;
        check_unit("stop-conditions.max-retry-rate", self.stop_conditions.max_retry_rate)?;
        check_unit("stop-conditions.max-reject-rate", self.stop_conditions.max_reject_rate)?;
        if self.stop_conditions.max_consecutive_fails == 0 {
            return Err(eyre::eyre!("stop-conditions.max-consecutive-fails must be at least 1"));
        }
        if self.stop_conditions.circuit_breaker_limit == 0 {
            return Err(eyre::eyre!("stop-conditions.circuit-breaker-limit must be at least 1"));
        }
        Ok(())
    }

    /// Identity key of the configured sequence (`{character}-{animation}` slug)
    pub fn identity_key(&self) -> String {
        identity_key(&self.sequence.character, &self.sequence.animation)
    }

    /// The behavior-defining part of the configuration
    ///
    /// This is what a run is fingerprinted on for resumption: the sequence,
    /// retry and stop settings. Log level, storage and collaborator commands
    /// can change between sessions without invalidating a run.
    pub fn run_fingerprint(&self) -> serde_json::Value {
        serde_json::json!({
            "sequence": self.sequence,
            "retry": self.retry,
            "stop-conditions": self.stop_conditions,
        })
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .spriteloop.yml
        let local_config = PathBuf::from(".spriteloop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/spriteloop/spriteloop.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("spriteloop").join("spriteloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Peek at the log level before logging is set up
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(eyre::eyre!("{} must be within [0, 1], got {}", name, value))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one folder per run
    #[serde(rename = "runs-dir")]
    pub runs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from(".spriteloop").join("runs"),
        }
    }
}

/// The frame sequence to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Character name (first half of the run identity)
    pub character: String,

    /// Animation/move name (second half of the run identity)
    pub animation: String,

    /// Number of frames in the sequence
    #[serde(rename = "total-frames")]
    pub total_frames: usize,

    /// Baseline reference artifact (identity anchor)
    pub baseline: String,

    /// Handlebars template for the generation prompt
    ///
    /// Variables: character, animation, frame_index, frame_number,
    /// total_frames, reference, reference_source, hint.
    #[serde(rename = "prompt-template")]
    pub prompt_template: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            character: "hero".to_string(),
            animation: "idle".to_string(),
            total_frames: 8,
            baseline: "baseline.png".to_string(),
            prompt_template: default_prompt_template(),
        }
    }
}

fn default_prompt_template() -> String {
    debug!("default_prompt_template: called");
    "{{character}}, {{animation}} animation, frame {{frame_number}} of {{total_frames}}, \
     pixel art sprite on a transparent background, same character as the reference image\
     {{#if hint}}. Retry: {{hint}}{{/if}}"
        .to_string()
}

/// Per-frame retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts allowed per frame before it is marked failed
    #[serde(rename = "max-attempts-per-frame")]
    pub max_attempts_per_frame: u32,

    /// Scores below this count toward identity collapse
    #[serde(rename = "collapse-threshold")]
    pub collapse_threshold: f64,

    /// Rolling window of recent scores
    #[serde(rename = "score-window")]
    pub score_window: usize,

    /// Rolling window of recent pass/fail outcomes
    #[serde(rename = "outcome-window")]
    pub outcome_window: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_frame: 5,
            collapse_threshold: 0.9,
            score_window: 5,
            outcome_window: 6,
        }
    }
}

/// Run-level halt thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConditionsConfig {
    /// Halt when the share of frames needing retries exceeds this
    #[serde(rename = "max-retry-rate")]
    pub max_retry_rate: f64,

    /// Halt when the share of failed/rejected frames exceeds this
    #[serde(rename = "max-reject-rate")]
    pub max_reject_rate: f64,

    /// Halt after this many failed/rejected frames in a row
    #[serde(rename = "max-consecutive-fails")]
    pub max_consecutive_fails: u32,

    /// Halt once this many attempts were spent across the run
    #[serde(rename = "circuit-breaker-limit")]
    pub circuit_breaker_limit: u32,

    /// Estimated cost of one attempt, for reporting
    #[serde(rename = "cost-per-attempt")]
    pub cost_per_attempt: f64,
}

impl Default for StopConditionsConfig {
    fn default() -> Self {
        Self {
            max_retry_rate: 0.5,
            max_reject_rate: 0.5,
            max_consecutive_fails: 3,
            circuit_breaker_limit: 50,
            cost_per_attempt: 0.04,
        }
    }
}

/// External collaborator command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Shell command (run with `sh -c`); empty means not configured
    pub command: String,

    /// Timeout per invocation in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Working directory (defaults to the current directory)
    #[serde(rename = "working-dir")]
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_ms: 300_000,
            working_dir: None,
        }
    }
}

impl CommandConfig {
    /// Check if a command was configured
    pub fn is_configured(&self) -> bool {
        !self.command.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.sequence.total_frames, 8);
        assert_eq!(config.retry.max_attempts_per_frame, 5);
        assert_eq!(config.stop_conditions.max_consecutive_fails, 3);
        assert_eq!(config.stop_conditions.circuit_breaker_limit, 50);
        assert!(!config.generator.is_configured());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

storage:
  runs-dir: /tmp/sprites/runs

sequence:
  character: Sean
  animation: Idle Stance
  total-frames: 4
  baseline: anchors/sean.png

retry:
  max-attempts-per-frame: 12
  collapse-threshold: 0.85

stop-conditions:
  max-retry-rate: 0.2
  max-consecutive-fails: 5
  circuit-breaker-limit: 100

generator:
  command: "python gen.py"
  timeout-ms: 60000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.storage.runs_dir, PathBuf::from("/tmp/sprites/runs"));
        assert_eq!(config.sequence.total_frames, 4);
        assert_eq!(config.identity_key(), "sean-idle-stance");
        assert_eq!(config.retry.max_attempts_per_frame, 12);
        assert_eq!(config.retry.score_window, 5);
        assert_eq!(config.stop_conditions.max_retry_rate, 0.2);
        assert_eq!(config.stop_conditions.max_reject_rate, 0.5);
        assert_eq!(config.generator.command, "python gen.py");
        assert_eq!(config.generator.timeout_ms, 60000);
        assert!(!config.auditor.is_configured());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.sequence.total_frames = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stop_conditions.max_reject_rate = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max-reject-rate"));

        let mut config = Config::default();
        config.sequence.character = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sequence.character = "!!!".to_string();
        config.sequence.animation = "???".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_commands_and_storage() {
        let a = Config::default();
        let mut b = Config::default();
        b.generator.command = "other".to_string();
        b.storage.runs_dir = PathBuf::from("/elsewhere");
        b.log_level = Some("trace".to_string());
        assert_eq!(a.run_fingerprint(), b.run_fingerprint());

        b.retry.max_attempts_per_frame = 9;
        assert_ne!(a.run_fingerprint(), b.run_fingerprint());
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("sl.yml");
        fs::write(&path, "sequence:\n  character: ryu\n  animation: kick\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.identity_key(), "ryu-kick");

        let missing = temp.path().join("missing.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
