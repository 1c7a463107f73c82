use crate::logs::StreamKind;
use crate::process::ExitOutcome;
use thiserror::Error;

/// Main error type for the stagehand supervisor
///
/// Every runtime variant carries the name of the stage it concerns, there is
/// no group-wide error state.
#[derive(Debug, Error)]
pub enum StagehandError {
    // Process-related errors
    #[error("Failed to launch {name}: {cause}")]
    Launch { name: String, cause: String },

    #[error("Process already registered: {0}")]
    DuplicateName(String),

    #[error("{name} exited unexpectedly ({status})")]
    UnexpectedExit { name: String, status: ExitOutcome },

    #[error("Failed to signal {name} (PID: {pid}): {cause}")]
    Signal {
        name: String,
        pid: u32,
        cause: String,
    },

    #[error("Failed reading {stream} of {name}: {cause}")]
    StreamRead {
        name: String,
        stream: StreamKind,
        cause: String,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    // Log sink errors
    #[error("Failed to open log file: {0}")]
    LogFile(String),

    #[error("Log rotation failed: {0}")]
    LogRotation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StagehandError {
    /// Name of the stage this error is attributed to, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            StagehandError::Launch { name, .. }
            | StagehandError::UnexpectedExit { name, .. }
            | StagehandError::Signal { name, .. }
            | StagehandError::StreamRead { name, .. } => Some(name),
            StagehandError::DuplicateName(name) => Some(name),
            _ => None,
        }
    }
}

/// Result type alias for stagehand operations
pub type Result<T> = std::result::Result<T, StagehandError>;
