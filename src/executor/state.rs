//! Serialized pipeline state handed to external runners
//!
//! ```json
//! {
//!   "dataSources": [{
//!     "reader": { "fileNames": ["/tomviz/original.tvb"] },
//!     "spacing": [1.0, 1.0, 1.0],
//!     "operators": [{ "type": "invert" }],
//!     "keepCOrdering": true
//!   }]
//! }
//! ```

use crate::error::{PipelineError, Result, ResultExt};
use crate::operator::Operator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the state document inside a working directory
pub const STATE_FILENAME: &str = "state.tvsm";
/// Base name of the input buffer
pub const ORIGINAL_FILENAME: &str = "original";
/// Base name of the result buffer
pub const TRANSFORM_FILENAME: &str = "transformed";
/// Progress socket or directory inside a working directory
pub const PROGRESS_PATH: &str = "progress";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderState {
    pub file_names: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceState {
    pub reader: ReaderState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacing: Option<[f64; 3]>,
    #[serde(default)]
    pub operators: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keep_c_ordering: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub data_sources: Vec<DataSourceState>,
}

impl PipelineState {
    /// State for a single data source read from `input`
    pub fn new(input: impl Into<PathBuf>, operators: &[Arc<Operator>]) -> Self {
        let keep_c_ordering =
            !operators.is_empty() && operators.iter().all(|op| op.prefers_c_ordering());
        Self {
            data_sources: vec![DataSourceState {
                reader: ReaderState {
                    file_names: vec![input.into()],
                },
                spacing: None,
                operators: operators.iter().map(|op| op.serialize()).collect(),
                keep_c_ordering,
            }],
        }
    }

    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        if let Some(ds) = self.data_sources.first_mut() {
            ds.spacing = Some(spacing);
        }
        self
    }

    /// The data source the runner executes
    pub fn primary(&self) -> Result<&DataSourceState> {
        self.data_sources
            .first()
            .ok_or_else(|| PipelineError::Serialization("state has no data sources".to_string()))
    }

    /// Rewrite reader paths under `from` to live under `to`
    pub fn relocate(&mut self, from: &Path, to: &Path) {
        for ds in &mut self.data_sources {
            for name in &mut ds.reader.file_names {
                if let Ok(rest) = name.strip_prefix(from) {
                    *name = to.join(rest);
                }
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("writing state file {}", path.display()))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading state file {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}
