//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// SpriteLoop - frame sequence orchestrator
#[derive(Parser)]
#[command(
    name = "sl",
    about = "Resumable generate/audit/retry orchestrator for animation frame sequences",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Override storage.runs-dir
    #[arg(long = "runs-dir", global = true, help = "Directory holding run folders")]
    pub runs_dir: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the configured sequence, resuming its latest run when possible
    Run {
        /// Always start a new run
        #[arg(long, conflicts_with = "force")]
        fresh: bool,

        /// Resume even if the configuration changed since the run started
        #[arg(long)]
        force: bool,
    },

    /// Resume a specific run
    Resume {
        /// Run id (see `sl runs`)
        run_id: String,

        /// Resume even if the configuration changed since the run started
        #[arg(long)]
        force: bool,
    },

    /// Show run status (latest run of the configured sequence by default)
    Status {
        /// Run id
        run_id: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the diagnostic report of a stopped run
    Report {
        /// Run id
        run_id: String,
    },

    /// List runs
    Runs,
}

/// Output format for status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text, json", s)),
        }
    }
}

/// Path of the log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spriteloop")
        .join("logs")
        .join("spriteloop.log")
}
