//! Error types for the agent harness

use std::fmt;

use thiserror::Error;

use crate::parser::ParserError;
use harness_core::ConfigError;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Which watchdog timeout aborted a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Wall-clock budget for the whole run was exhausted
    Total,
    /// No output arrived on either stream for too long
    Silence,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Total => f.write_str("total"),
            TimeoutKind::Silence => f.write_str("silence"),
        }
    }
}

/// Terminal failure of one agent run
///
/// Every variant that observed the process carries the streams captured up to
/// the failure. None of these are retried by the engine.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid backend configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to spawn the agent process
    #[error("Failed to spawn agent process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// One of the two watchdog timeouts fired
    #[error("Agent run aborted by {kind} timeout after {elapsed_ms}ms")]
    Timeout {
        kind: TimeoutKind,
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },

    /// The caller's cancellation token was set
    #[error("Agent run cancelled after {elapsed_ms}ms")]
    Cancelled {
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },

    /// Agent exited non-zero and no recovery applied
    #[error("Agent exited with code {exit_code}")]
    ExitFailure {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Agent exited zero but its output could not be parsed
    #[error("Agent exited with code {exit_code} but produced no usable output: {source}")]
    UnusableOutput {
        exit_code: i32,
        #[source]
        source: ParserError,
        stdout: String,
        stderr: String,
    },

    /// IO error while communicating with the agent
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Exit code of the failed process, when one was observed
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExitFailure { exit_code, .. } | Self::UnusableOutput { exit_code, .. } => {
                Some(*exit_code)
            }
            _ => None,
        }
    }

    /// Stdout captured up to the failure, when available
    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::Timeout { stdout, .. }
            | Self::Cancelled { stdout, .. }
            | Self::ExitFailure { stdout, .. }
            | Self::UnusableOutput { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    /// Stderr captured up to the failure, when available
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Timeout { stderr, .. }
            | Self::Cancelled { stderr, .. }
            | Self::ExitFailure { stderr, .. }
            | Self::UnusableOutput { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Whether this failure is a re-surfaced external cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Which timeout fired, when this is a timeout failure
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            Self::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
