//! Out-of-process progress channel
//!
//! An external runner reports what it is doing as one JSON object per line:
//!
//! ```json
//! {"type": "progress.step", "operator": 1, "value": 5}
//! ```
//!
//! Messages with an `operator` index are routed to that operator, the rest
//! are pipeline-level (`started` / `finished`). Readers only deliver the raw
//! lines; [`ProgressMessage::parse`] and the executor do the dispatch.
//!
//! # Transports
//!
//! - [`LocalSocketProgressReader`] - Unix domain socket, newline-delimited
//! - [`FilesProgressReader`] - One small file per message in a watched directory

mod files;
mod socket;
mod writer;

pub use files::FilesProgressReader;
pub use socket::{socket_supported, LocalSocketProgressReader};
pub use writer::ProgressWriter;

use crate::config::ProgressChannelKind;
use crate::error::{PipelineError, Result};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Message type of a progress line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "finished")]
    Finished,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "progress.maximum")]
    ProgressMaximum,
    #[serde(rename = "progress.step")]
    ProgressStep,
    #[serde(rename = "progress.message")]
    ProgressMessage,
    /// `value` is a buffer path relative to the progress location
    #[serde(rename = "progress.data")]
    ProgressData,
}

/// One parsed progress line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressMessage {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| PipelineError::Progress(format!("invalid progress message '{}': {}", line.trim(), e)))
    }

    pub fn pipeline(kind: MessageKind) -> Self {
        Self {
            kind,
            operator: None,
            value: None,
            error: None,
        }
    }

    pub fn operator(kind: MessageKind, index: usize) -> Self {
        Self {
            operator: Some(index),
            ..Self::pipeline(kind)
        }
    }

    pub fn with_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Numeric value, accepting integers, floats and numeric strings
    pub fn value_u64(&self) -> Option<u64> {
        match self.value.as_ref()? {
            serde_json::Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn value_str(&self) -> Option<String> {
        match self.value.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A transport delivering raw progress lines from a runner
pub trait ProgressReader: Send {
    /// Begin listening. Lines arrive on [`ProgressReader::messages`].
    fn start(&mut self) -> Result<()>;

    /// Stop listening and release the socket or watcher
    fn stop(&mut self);

    fn messages(&self) -> &Receiver<String>;

    /// The socket path or directory the runner writes to
    fn path(&self) -> &Path;

    fn kind(&self) -> ProgressChannelKind;

    /// Resolve a `progress.data` path against the progress location
    fn resolve_data_path(&self, relative: &str) -> PathBuf {
        let base = self.path().parent().unwrap_or_else(|| self.path());
        base.join(relative)
    }
}

/// Pick the concrete transport for `requested`
///
/// `Auto` probes once for local socket support and falls back to files.
pub fn resolve_channel(requested: ProgressChannelKind) -> ProgressChannelKind {
    match requested {
        ProgressChannelKind::Auto => {
            if socket_supported() {
                ProgressChannelKind::Socket
            } else {
                ProgressChannelKind::Files
            }
        }
        other => other,
    }
}

/// Build a reader for `kind` at `path`
pub fn create_reader(kind: ProgressChannelKind, path: &Path) -> Box<dyn ProgressReader> {
    match resolve_channel(kind) {
        ProgressChannelKind::Socket => Box::new(LocalSocketProgressReader::new(path)),
        _ => Box::new(FilesProgressReader::new(path)),
    }
}
