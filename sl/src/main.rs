//! SpriteLoop - frame sequence orchestrator
//!
//! CLI entry point for running, resuming and inspecting runs.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use spriteloop::cli::{Cli, Command, OutputFormat, get_log_path};
use spriteloop::config::Config;
use spriteloop::domain::FrameStatus;
use spriteloop::r#loop::{Orchestrator, RunOutcome, StartMode};
use spriteloop::report::load_report;
use spriteloop::state::{
    ExistingRun, JsonStateStore, RunPaths, StateStore, find_existing_run, find_run_by_id, list_runs,
};
use spriteloop::{CommandAuditor, CommandGenerator};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(runs_dir) = cli.runs_dir {
        debug!(?runs_dir, "main: runs dir overridden");
        config.storage.runs_dir = runs_dir;
    }
    info!(identity_key = %config.identity_key(), runs_dir = ?config.storage.runs_dir, "SpriteLoop loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run { fresh, force } => {
            let mode = if fresh {
                StartMode::Fresh
            } else {
                StartMode::Auto { force }
            };
            cmd_run(config, mode).await
        }
        Command::Resume { run_id, force } => cmd_run(config, StartMode::Resume { run_id, force }).await,
        Command::Status { run_id, format } => cmd_status(&config, run_id.as_deref(), format).await,
        Command::Report { run_id } => cmd_report(&config, &run_id).await,
        Command::Runs => cmd_runs(&config).await,
    }
}

async fn cmd_run(config: Config, mode: StartMode) -> Result<()> {
    debug!(?mode, "cmd_run: called");
    config.validate().context("Invalid configuration")?;
    if !config.generator.is_configured() {
        return Err(eyre::eyre!("generator.command is not configured"));
    }
    if !config.auditor.is_configured() {
        return Err(eyre::eyre!("auditor.command is not configured"));
    }

    let generator = Arc::new(CommandGenerator::new(config.generator.clone()));
    let auditor = Arc::new(CommandAuditor::new(config.auditor.clone()));
    let orchestrator = Orchestrator::new(config, Arc::new(JsonStateStore), generator, auditor).with_mode(mode);

    let abort = orchestrator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Abort requested, stopping after the current step...");
            abort.request_abort();
        }
    });

    let outcome = orchestrator.run().await;
    let code = print_outcome(&outcome);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Print a run outcome; returns the process exit code
fn print_outcome(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed {
            run_id,
            approved,
            failed,
            total_attempts,
        } => {
            println!(
                "{} Run {} completed: {} approved, {} failed, {} attempts",
                "✓".green(),
                run_id.cyan(),
                approved,
                failed,
                total_attempts
            );
            0
        }
        RunOutcome::Stopped {
            run_id,
            reason,
            report_path,
        } => {
            println!("{} Run {} stopped: {}", "■".yellow(), run_id.cyan(), reason.to_string().yellow());
            println!("  Report: {}", report_path.display());
            println!("  Inspect with `sl report {}`, then `sl resume {}`", run_id, run_id);
            2
        }
        RunOutcome::Failed {
            run_id,
            phase,
            frame,
            cause,
        } => {
            eprintln!(
                "{} Run {} failed in {} (frame {}): {}",
                "✗".red(),
                run_id.as_deref().unwrap_or("-"),
                phase,
                frame.map(|f| f.to_string()).unwrap_or_else(|| "-".to_string()),
                cause
            );
            1
        }
        RunOutcome::Refused { reason } => {
            eprintln!("{} {}", "✗".red(), reason);
            3
        }
    }
}

async fn resolve_run(config: &Config, run_id: Option<&str>) -> Result<ExistingRun> {
    let runs_dir = &config.storage.runs_dir;
    let found = match run_id {
        Some(id) => find_run_by_id(runs_dir, id).await?,
        None => find_existing_run(runs_dir, &config.identity_key()).await?,
    };
    found.ok_or_else(|| match run_id {
        Some(id) => eyre::eyre!("Run {} not found in {}", id, runs_dir.display()),
        None => eyre::eyre!("No runs for {} in {}", config.identity_key(), runs_dir.display()),
    })
}

async fn cmd_status(config: &Config, run_id: Option<&str>, format: OutputFormat) -> Result<()> {
    debug!(?run_id, ?format, "cmd_status: called");
    let run = resolve_run(config, run_id).await?;
    let ledger = JsonStateStore
        .load(&run.run_path)
        .await?
        .ok_or_else(|| eyre::eyre!("Run {} has no state snapshot", run.run_id))?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&ledger.run)?);
        return Ok(());
    }

    println!("{} {}", "Run".bold(), run);
    println!("  Phase: {}  Status: {}", ledger.run.phase, format!("{:?}", ledger.run.status).cyan());
    if let Some(reason) = &ledger.run.stop_reason {
        println!("  Stopped: {}", reason.yellow());
    }
    if let Some(fatal) = &ledger.run.fatal {
        println!(
            "  Fatal in {} (frame {:?}): {}",
            fatal.phase,
            fatal.frame,
            fatal.cause.red()
        );
    }
    for frame in &ledger.run.frame_states {
        let status = match frame.status {
            FrameStatus::Approved => frame.status.to_string().green(),
            FrameStatus::Failed => frame.status.to_string().red(),
            FrameStatus::InProgress => frame.status.to_string().yellow(),
            FrameStatus::Pending => frame.status.to_string().dimmed(),
        };
        let detail = ledger
            .frame_attempts(frame.index)
            .and_then(|f| f.final_reason.clone())
            .or_else(|| frame.approved_artifact.clone())
            .unwrap_or_default();
        println!("  {:>3}  {:<11} attempts {:<3} {}", frame.index, status, frame.attempts, detail);
    }
    Ok(())
}

async fn cmd_report(config: &Config, run_id: &str) -> Result<()> {
    debug!(%run_id, "cmd_report: called");
    let run = resolve_run(config, Some(run_id)).await?;
    let paths = RunPaths::from_dir(&run.run_path);
    match load_report(&paths.report()).await? {
        Some(report) => print!("{}", report),
        None => {
            warn!(%run_id, "no report for run");
            println!("Run {} has no stop report (status {:?})", run_id, run.status);
        }
    }
    Ok(())
}

async fn cmd_runs(config: &Config) -> Result<()> {
    let runs_dir: &PathBuf = &config.storage.runs_dir;
    debug!(?runs_dir, "cmd_runs: called");
    let runs = list_runs(runs_dir).await?;
    if runs.is_empty() {
        println!("No runs in {}", runs_dir.display());
        return Ok(());
    }
    for run in runs {
        println!("{}", run);
    }
    Ok(())
}
