//! Typed contract between the supervisor and a worker.
//!
//! A process worker reports one JSON object per stdout line:
//!
//! ```text
//! {"event":"stats","data":{"totalScanned":12,"success":9}}
//! {"event":"log","data":{"message":"page 2 loaded","level":"info"}}
//! ```
//!
//! Any other line (stderr, or stdout that is not an event) is a plain log line.

use serde::{Deserialize, Serialize};

use super::process::{OutputLine, OutputStream};
use crate::run::stats::StatsUpdate;

/// Line written to the worker's stdin to ask for a cooperative stop.
pub const STOP_COMMAND: &str = r#"{"command":"stop"}"#;

/// Severity of a worker log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// A free-text log line from the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
        }
    }
}

/// Everything a worker can tell the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// Partial stats, shallow-merged into the run's snapshot.
    Stats(StatsUpdate),
    /// Free-text progress output.
    Log(LogEntry),
}

/// Interpret one line of worker output.
pub fn parse_line(line: &OutputLine) -> Option<WorkerEvent> {
    let text = line.text.trim();
    if text.is_empty() {
        return None;
    }

    if line.stream == OutputStream::Stdout && text.starts_with('{') {
        if let Ok(event) = serde_json::from_str::<WorkerEvent>(text) {
            return Some(event);
        }
    }

    let level = match line.stream {
        OutputStream::Stdout => LogLevel::Info,
        OutputStream::Stderr => LogLevel::Warn,
    };
    Some(WorkerEvent::Log(LogEntry::new(level, text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::stats::RunStatus;

    fn stdout(text: &str) -> OutputLine {
        OutputLine {
            stream: OutputStream::Stdout,
            text: text.to_string(),
        }
    }

    #[test]
    fn stats_event() {
        let event = parse_line(&stdout(r#"{"event":"stats","data":{"totalScanned":12,"status":"completed"}}"#));
        assert_eq!(
            event,
            Some(WorkerEvent::Stats(StatsUpdate {
                total_scanned: Some(12),
                status: Some(RunStatus::Completed),
                ..Default::default()
            }))
        );
    }

    #[test]
    fn log_event_defaults_level() {
        let event = parse_line(&stdout(r#"{"event":"log","data":{"message":"hi"}}"#));
        assert_eq!(event, Some(WorkerEvent::Log(LogEntry::new(LogLevel::Info, "hi"))));
    }

    #[test]
    fn plain_and_stderr_lines_become_logs() {
        assert_eq!(
            parse_line(&stdout("navigating to page 3")),
            Some(WorkerEvent::Log(LogEntry::new(LogLevel::Info, "navigating to page 3")))
        );
        assert_eq!(
            parse_line(&OutputLine {
                stream: OutputStream::Stderr,
                text: r#"{"event":"stats","data":{}}"#.into(),
            }),
            Some(WorkerEvent::Log(LogEntry::new(
                LogLevel::Warn,
                r#"{"event":"stats","data":{}}"#
            )))
        );
        assert_eq!(parse_line(&stdout("   ")), None);
    }

    #[test]
    fn unknown_event_is_a_log_line() {
        let line = r#"{"event":"progress","data":{"percentage":40}}"#;
        assert_eq!(
            parse_line(&stdout(line)),
            Some(WorkerEvent::Log(LogEntry::new(LogLevel::Info, line)))
        );
    }
}
