//! Structured logging for harness workflows.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL log record for workload events.
//! - [`LogEmitter`]: writes JSONL lines to a file or stdout.
//! - [`validate_log_line`]: checks a line parses back into the schema.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::Path;

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Workload outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// One JSONL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    /// Event name, e.g. "stress.done", "churn.compact".
    pub event: String,
    /// Wall-clock milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Event-specific payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

impl LogEntry {
    pub fn new(level: LogLevel, event: &str, elapsed_ms: u64) -> Self {
        Self {
            level,
            event: event.to_string(),
            elapsed_ms,
            outcome: None,
            fields: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = fields;
        self
    }
}

/// Writes JSONL lines to a file or stdout.
pub struct LogEmitter {
    sink: Box<dyn Write + Send>,
}

impl LogEmitter {
    /// Emitter appending to `path`.
    pub fn to_file(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            sink: Box::new(file),
        })
    }

    /// Emitter writing to stdout.
    pub fn to_stdout() -> Self {
        Self {
            sink: Box::new(io::stdout()),
        }
    }

    /// Serializes one entry as a JSONL line.
    pub fn emit(&mut self, entry: &LogEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.sink, "{line}")
    }
}

/// Validates that a single JSONL line round-trips through the schema.
pub fn validate_log_line(line: &str) -> Result<LogEntry, serde_json::Error> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_serializes_to_single_line() {
        let entry = LogEntry::new(LogLevel::Info, "stress.done", 123)
            .with_outcome(Outcome::Pass)
            .with_fields(json!({"threads": 4, "steps": 1000}));
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"level\":\"info\""));
        assert!(line.contains("\"outcome\":\"pass\""));
    }

    #[test]
    fn test_validate_round_trip() {
        let entry = LogEntry::new(LogLevel::Warn, "churn.compact", 5)
            .with_fields(json!({"released": 65536}));
        let line = serde_json::to_string(&entry).unwrap();
        let back = validate_log_line(&line).unwrap();
        assert_eq!(back.event, "churn.compact");
        assert_eq!(back.level, LogLevel::Warn);
        assert_eq!(back.fields["released"], 65536);
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(validate_log_line("not json").is_err());
        assert!(validate_log_line("{\"event\":\"x\"}").is_err()); // missing fields
    }

    #[test]
    fn test_null_fields_elided() {
        let entry = LogEntry::new(LogLevel::Debug, "tick", 0);
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains("fields"));
        assert!(!line.contains("outcome"));
    }
}
