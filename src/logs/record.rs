use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout of a rendered record, e.g. `2024-01-01 12:00:00,123`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Component tags used as `source` for records the supervisor emits itself
pub const SUPERVISOR_TAG: &str = "supervisor";
pub const ROUTER_TAG: &str = "log-router";
pub const SHUTDOWN_TAG: &str = "shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Which pipe of a child a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line handed to the sink.
///
/// `observed_at` is when the supervisor read the line, not when the child
/// wrote it. `stream` is `None` for records the supervisor emits itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source: String,
    pub stream: Option<StreamKind>,
    pub severity: Severity,
    pub text: String,
    pub observed_at: DateTime<Local>,
}

impl LogRecord {
    /// Record for a line read from a child's pipe
    pub fn from_child(
        source: impl Into<String>,
        stream: StreamKind,
        severity: Severity,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            stream: Some(stream),
            severity,
            text: text.into(),
            observed_at: Local::now(),
        }
    }

    /// Record emitted by a supervisor component
    pub fn component(tag: &str, severity: Severity, text: impl Into<String>) -> Self {
        Self {
            source: tag.to_string(),
            stream: None,
            severity,
            text: text.into(),
            observed_at: Local::now(),
        }
    }

    /// Single-line rendering: `{timestamp} - {severity} - {source}: {text}`
    pub fn render(&self) -> String {
        format!(
            "{} - {} - {}: {}",
            self.observed_at.format(TIMESTAMP_FORMAT),
            self.severity,
            self.source,
            self.text
        )
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
