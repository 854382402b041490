//! Monitoring log for operational events.
//!
//! Lock timeouts, restarts, validation failures, rollback failures and other
//! events that operators (and the error-rate check) care about are appended
//! to `logs/monitoring.jsonl` under the data root, one JSON object per line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// Severity of a monitoring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Whether the event counts toward the daily error rate.
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }
}

/// A single monitoring log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    pub severity: Severity,

    /// Event name, e.g. "lock_timeout", "agent_restarted"
    pub event: String,

    pub message: String,

    /// Structured context
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,

    /// Process that logged the event
    pub pid: u32,
}

/// Path of the monitoring log for a data root.
pub fn log_path(root: &Path) -> PathBuf {
    root.join("logs").join("monitoring.jsonl")
}

/// Append an event to the monitoring log.
///
/// This function never fails - write errors are reported through tracing so
/// that logging problems never break the calling operation.
pub fn record(
    root: &Path,
    severity: Severity,
    event: &str,
    message: &str,
    details: serde_json::Value,
) {
    let entry = Event {
        timestamp: Utc::now(),
        severity,
        event: event.to_string(),
        message: message.to_string(),
        details,
        pid: std::process::id(),
    };

    match severity {
        Severity::Critical | Severity::Error => tracing::error!(event, "{}", message),
        Severity::Warning => tracing::warn!(event, "{}", message),
        Severity::Info => tracing::info!(event, "{}", message),
    }

    if let Err(e) = write_entry(&log_path(root), &entry) {
        tracing::warn!("Failed to write monitoring log: {}", e);
    }
}

fn write_entry(path: &Path, entry: &Event) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // One write per line keeps concurrent O_APPEND writers from interleaving.
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Read every parseable event from the monitoring log.
///
/// Malformed lines are skipped.
pub fn read_events(root: &Path) -> Result<Vec<Event>> {
    let path = log_path(root);
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::debug!("Skipping malformed monitoring log line: {}", e),
        }
    }
    Ok(events)
}

/// Events at or after `since`.
pub fn events_since(root: &Path, since: DateTime<Utc>) -> Result<Vec<Event>> {
    Ok(read_events(root)?
        .into_iter()
        .filter(|e| e.timestamp >= since)
        .collect())
}
