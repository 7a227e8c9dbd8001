//! Error handling for tomopipe
//!
//! This module defines the crate error type, the per-request execution
//! failure taxonomy, and a Result alias used throughout the library.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tomopipe operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// An operator could not be applied
    #[error("Operator '{label}' error: {message}")]
    Operator { label: String, message: String },

    /// Errors related to rhai script compilation or execution
    #[error("Script error: {0}")]
    Script(String),

    /// Errors related to settings loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to state documents and transfer files
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An external process or container could not be started
    #[error("Launch error: {0}")]
    Launch(String),

    /// A single execution request failed
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    /// Errors on the out-of-process progress channel
    #[error("Progress channel error: {0}")]
    Progress(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// A data source or operator id that is not (or no longer) in the tree
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        PipelineError::Script(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Why a single execution request did not produce a result.
///
/// These are fatal to the request only. The pipeline stays usable and the
/// user may retry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionFailure {
    #[error("Operator '{label}' (index {index}) failed: {message}")]
    Operator {
        index: usize,
        label: String,
        message: String,
    },

    #[error("Failed to launch {what}: {message}")]
    Launch { what: String, message: String },

    #[error(
        "The external pipeline process crashed: {command} (exit code {}, signal {})\n\nstderr:\n{stderr}\n\nstdout:\n{stdout}",
        fmt_opt(.code),
        fmt_opt(.signal)
    )]
    Crash {
        command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
        stdout: String,
    },

    #[error(
        "The external pipeline process returned a non-zero exit code: {code}\n\ncommand: {command}\n\nstderr:\n{stderr}\n\nstdout:\n{stdout}"
    )]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
        stdout: String,
    },

    #[error("Pipeline Error: container {container} exited with non-zero exit code: {code}\n\n{logs}")]
    ContainerExit {
        container: String,
        code: i64,
        logs: String,
    },

    #[error("Unable to load transformed data at {}: {message}", .path.display())]
    Output { path: PathBuf, message: String },

    #[error("Unable to prepare execution: {message}")]
    Setup { message: String },
}

fn fmt_opt(value: &Option<i32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

impl ExecutionFailure {
    /// Short dialog-style title for the failure.
    pub fn title(&self) -> &'static str {
        match self {
            ExecutionFailure::Operator { .. } => "Operator Error",
            ExecutionFailure::Launch { .. } => "Execution Error",
            ExecutionFailure::Crash { .. } | ExecutionFailure::NonZeroExit { .. } => {
                "External Pipeline Error"
            }
            ExecutionFailure::ContainerExit { .. } => "Pipeline Error",
            ExecutionFailure::Output { .. } => "Read Error",
            ExecutionFailure::Setup { .. } => "Directory Error",
        }
    }

    /// True when the external side terminated abnormally.
    pub fn is_crash(&self) -> bool {
        matches!(self, ExecutionFailure::Crash { .. })
    }
}

/// Result type alias for tomopipe operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| PipelineError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::from_rhai_error(e).with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| PipelineError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::Io(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Config("Invalid execution mode".to_string());
        assert_eq!(err.to_string(), "Configuration error: Invalid execution mode");
    }

    #[test]
    fn test_error_with_context() {
        let err = PipelineError::Serialization("bad header".to_string());
        let with_ctx = err.with_context("Failed to read transfer file");
        assert!(with_ctx.to_string().contains("Failed to read transfer file"));
        assert!(with_ctx.to_string().contains("bad header"));
    }

    #[test]
    fn test_crash_and_non_zero_exit_are_distinguished() {
        let crash = ExecutionFailure::Crash {
            command: "runner -s state.json".to_string(),
            code: Some(137),
            signal: None,
            stderr: "Killed".to_string(),
            stdout: String::new(),
        };
        let exit = ExecutionFailure::NonZeroExit {
            command: "runner -s state.json".to_string(),
            code: 2,
            stderr: "bad args".to_string(),
            stdout: String::new(),
        };

        assert!(crash.is_crash());
        assert!(crash.to_string().contains("crashed"));
        assert!(crash.to_string().contains("137"));
        assert!(crash.to_string().contains("Killed"));
        assert!(!exit.is_crash());
        assert!(exit.to_string().contains("non-zero exit code: 2"));
    }

    #[test]
    fn test_container_exit_message() {
        let err = ExecutionFailure::ContainerExit {
            container: "abc123".to_string(),
            code: 2,
            logs: "Traceback: boom".to_string(),
        };
        assert_eq!(err.title(), "Pipeline Error");
        assert!(err.to_string().contains("exit code: 2"));
        assert!(err.to_string().contains("Traceback: boom"));
    }
}
