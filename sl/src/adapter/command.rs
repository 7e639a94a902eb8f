//! Shell command collaborators
//!
//! Both adapters run a configured command with `sh -c`, pass their inputs in
//! `SL_*` environment variables and read a JSON object from the last
//! non-empty stdout line. Any spawn error, timeout, non-zero exit or bad output
//! becomes a failure value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CommandConfig;

use super::client::{AuditRequest, AuditVerdict, FrameAuditor, FrameGenerator, GenerationRequest, GenerationResult};

/// Output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// How long the command took
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Last non-empty stdout line
    pub fn last_line(&self) -> Option<&str> {
        self.stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())
    }

    fn stderr_tail(&self) -> String {
        let tail: Vec<&str> = self.stderr.lines().rev().take(5).collect();
        tail.into_iter().rev().collect::<Vec<_>>().join("\n")
    }
}

/// Run a shell command with extra environment variables and a timeout
pub async fn run_command(
    command: &str,
    env: &[(&str, String)],
    working_dir: Option<&Path>,
    timeout: Duration,
) -> eyre::Result<CommandOutput> {
    debug!(%command, ?working_dir, timeout_ms = timeout.as_millis() as u64, "run_command: called");
    let start = std::time::Instant::now();

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    debug!(%command, "run_command: executing command");
    let output = tokio::time::timeout(timeout, cmd.output()).await;

    match output {
        Ok(Ok(output)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let exit_code = output.status.code().unwrap_or(-1);
            debug!(exit_code, duration_ms, "run_command: command completed");
            Ok(CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration_ms,
            })
        }
        Ok(Err(e)) => {
            debug!(error = %e, "run_command: command execution failed");
            Err(e.into())
        }
        Err(_) => {
            debug!("run_command: command timed out");
            Err(eyre::eyre!("Command timed out after {}ms", timeout.as_millis()))
        }
    }
}

/// Optional JSON a generator may print
#[derive(Debug, Deserialize)]
struct GeneratorReport {
    artifact: Option<String>,
    seed: Option<u64>,
    prompt: Option<String>,
}

/// Generator backed by a shell command
///
/// Environment: `SL_RUN_ID`, `SL_FRAME_INDEX`, `SL_ATTEMPT`, `SL_TOTAL_FRAMES`,
/// `SL_REFERENCE`, `SL_REFERENCE_SOURCE`, `SL_PROMPT`, `SL_RETRY_ACTION`,
/// `SL_OUTPUT`. The command either prints `{"artifact": ..., "seed": ...,
/// "prompt": ...}` or writes the candidate to `SL_OUTPUT`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    config: CommandConfig,
}

impl CommandGenerator {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    fn env(request: &GenerationRequest) -> Vec<(&'static str, String)> {
        vec![
            ("SL_RUN_ID", request.run_id.clone()),
            ("SL_FRAME_INDEX", request.frame_index.to_string()),
            ("SL_ATTEMPT", request.attempt_index.to_string()),
            ("SL_TOTAL_FRAMES", request.total_frames.to_string()),
            ("SL_REFERENCE", request.reference.clone()),
            ("SL_REFERENCE_SOURCE", request.reference_source.to_string()),
            ("SL_PROMPT", request.prompt.clone()),
            (
                "SL_RETRY_ACTION",
                request.retry_action.map(|a| a.to_string()).unwrap_or_default(),
            ),
            ("SL_OUTPUT", request.output_path.to_string_lossy().to_string()),
        ]
    }
}

#[async_trait]
impl FrameGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        debug!(frame = request.frame_index, attempt = request.attempt_index, "CommandGenerator::generate: called");
        let failed = |message: String| {
            warn!(frame = request.frame_index, attempt = request.attempt_index, %message, "generation failed");
            GenerationResult::Failed {
                message,
                raw_prompt: request.prompt.clone(),
            }
        };

        if let Some(parent) = request.output_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return failed(format!("cannot create {}: {}", parent.display(), e));
            }
        }

        let output = match run_command(
            &self.config.command,
            &Self::env(request),
            self.config.working_dir.as_deref(),
            Duration::from_millis(self.config.timeout_ms),
        )
        .await
        {
            Ok(output) => output,
            Err(e) => return failed(format!("generator command error: {}", e)),
        };

        if output.exit_code != 0 {
            return failed(format!(
                "generator exited with {}: {}",
                output.exit_code,
                output.stderr_tail()
            ));
        }

        let report = output
            .last_line()
            .and_then(|line| serde_json::from_str::<GeneratorReport>(line).ok());
        let (artifact, seed, raw_prompt) = match report {
            Some(r) => (r.artifact, r.seed, r.prompt),
            None => (None, None, None),
        };

        let artifact = match artifact {
            Some(a) => a,
            None if tokio::fs::try_exists(&request.output_path).await.unwrap_or(false) => {
                request.output_path.to_string_lossy().to_string()
            }
            None => return failed("generator reported no artifact and wrote nothing to SL_OUTPUT".to_string()),
        };

        debug!(%artifact, ?seed, duration_ms = output.duration_ms, "CommandGenerator::generate: produced candidate");
        GenerationResult::Generated {
            artifact,
            raw_prompt: raw_prompt.unwrap_or_else(|| request.prompt.clone()),
            seed,
        }
    }
}

/// Auditor backed by a shell command
///
/// Environment: `SL_RUN_ID`, `SL_FRAME_INDEX`, `SL_ATTEMPT`, `SL_CANDIDATE`,
/// `SL_REFERENCE`, `SL_BASELINE`. The command prints
/// `{"passed": bool, "reason_codes": [...], "composite_score": f, "identity_score": f}`.
#[derive(Debug, Clone)]
pub struct CommandAuditor {
    config: CommandConfig,
}

impl CommandAuditor {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.config.working_dir.clone()
    }
}

#[async_trait]
impl FrameAuditor for CommandAuditor {
    async fn audit(&self, request: &AuditRequest) -> AuditVerdict {
        debug!(frame = request.frame_index, candidate = %request.candidate, "CommandAuditor::audit: called");
        let env = vec![
            ("SL_RUN_ID", request.run_id.clone()),
            ("SL_FRAME_INDEX", request.frame_index.to_string()),
            ("SL_ATTEMPT", request.attempt_index.to_string()),
            ("SL_CANDIDATE", request.candidate.clone()),
            ("SL_REFERENCE", request.reference.clone()),
            ("SL_BASELINE", request.baseline.clone()),
        ];
        let working_dir = self.working_dir();

        let result = run_command(
            &self.config.command,
            &env,
            working_dir.as_deref(),
            Duration::from_millis(self.config.timeout_ms),
        )
        .await;

        let error = match result {
            Ok(output) if output.exit_code == 0 => match output.last_line().map(serde_json::from_str::<AuditVerdict>) {
                Some(Ok(verdict)) => return verdict,
                Some(Err(e)) => format!("auditor printed invalid JSON: {}", e),
                None => "auditor printed nothing".to_string(),
            },
            Ok(output) => format!("auditor exited with {}: {}", output.exit_code, output.stderr_tail()),
            Err(e) => format!("auditor command error: {}", e),
        };

        warn!(frame = request.frame_index, %error, "audit failed, treating as AUDIT_ERROR");
        AuditVerdict::fail(&["AUDIT_ERROR"], None)
    }
}
