//! Event Logger - persists run events to JSONL
//!
//! One logger per run, writing to `{run-dir}/events.jsonl`. Write failures are
//! logged and swallowed: the event log is history, not state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use super::types::{EventLogEntry, RunEvent};

/// Appends run events to a JSONL file
pub struct EventLogger {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl EventLogger {
    /// Create a logger for a log file; the file is opened on first write
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::new: creating logger");
        Self { path, writer: None }
    }

    /// Append an event; errors are logged, never returned
    pub fn emit(&mut self, event: RunEvent) {
        if let Err(e) = self.write_event(&event) {
            error!(path = ?self.path, event_type = event.event_type(), error = %e, "EventLogger: failed to write event");
            self.writer = None;
        }
    }

    /// Write an event to the log file
    pub fn write_event(&mut self, event: &RunEvent) -> eyre::Result<()> {
        debug!(event_type = event.event_type(), "EventLogger::write_event");

        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!(path = ?self.path, "EventLogger: opening log file");
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }

        let entry = EventLogEntry::new(event.clone());
        let json = serde_json::to_string(&entry)?;
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", json)?;
            writer.flush()?;
        }

        Ok(())
    }
}

/// Read events from a run's log file
pub fn read_run_events(path: impl AsRef<Path>) -> eyre::Result<Vec<EventLogEntry>> {
    let path = path.as_ref();
    debug!(?path, "read_run_events: reading log file");

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let mut entries = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(line, error = %e, "read_run_events: failed to parse line");
            }
        }
    }

    Ok(entries)
}
