//! Error taxonomy for harness operations.

use std::path::PathBuf;
use std::time::Duration;

use crate::settings::EnvError;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Daemon failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("Startup marker '{marker}' not observed within {timeout:?}")]
    StartupTimeout {
        marker: &'static str,
        timeout: Duration,
    },

    #[error(
        "Observed {observed} of {expected} '{marker}' markers before the {timeout:?} timeout"
    )]
    OperationTimeout {
        marker: &'static str,
        observed: usize,
        expected: usize,
        timeout: Duration,
    },

    #[error("Daemon output closed after {observed} of {expected} '{marker}' markers")]
    OutputClosed {
        marker: &'static str,
        observed: usize,
        expected: usize,
    },

    #[error("Daemon did not exit within {0:?} after the quit command")]
    ShutdownTimeout(Duration),

    #[error("Daemon exited with {}, expected 0{}", describe_code(.code), describe_stderr(.stderr))]
    UnexpectedExitCode { code: Option<i32>, stderr: String },

    #[error("Operation '{operation}' is not permitted while the daemon is {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::process::DaemonState,
    },

    #[error("Fixture IO error during {operation} on {}: {source}", .path.display())]
    FixtureIo {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path '{0}' escapes the sandbox root")]
    PathEscape(String),

    #[error("Invalid action config: {0}")]
    ConfigInvalid(String),

    #[error("Invalid name template: {0}")]
    Template(#[from] crate::template::TemplateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Invalid harness settings: {}", join_env_errors(.0))]
    Settings(Vec<EnvError>),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Wrap an IO error raised while touching the sandbox.
    pub fn fixture_io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::FixtureIo {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Short stable code for reports and JSONL events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProcessStartFailed(_) => "PROCESS_START_FAILED",
            Self::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            Self::OperationTimeout { .. } => "OPERATION_TIMEOUT",
            Self::OutputClosed { .. } => "OUTPUT_CLOSED",
            Self::ShutdownTimeout(_) => "SHUTDOWN_TIMEOUT",
            Self::UnexpectedExitCode { .. } => "UNEXPECTED_EXIT_CODE",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::FixtureIo { .. } => "FIXTURE_IO",
            Self::PathEscape(_) => "PATH_ESCAPE",
            Self::ConfigInvalid(_) => "CONFIG_INVALID",
            Self::Template(_) => "TEMPLATE_INVALID",
            Self::Serialization(_) => "SERIALIZATION",
            Self::AssertionFailed(_) => "ASSERTION_FAILED",
            Self::Settings(_) => "SETTINGS",
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
