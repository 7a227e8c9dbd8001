//! # tomopipe: operator pipelines for tomographic volumes
//!
//! A pipeline starts from a volume, applies an ordered chain of operators
//! to it and publishes the result as a new data source. Operators may fork
//! child data sources that carry their own chains.
//!
//! ## Architecture
//!
//! - **Pipeline**: Owns the data source tree and decides what to (re)run
//! - **Executors**: Run a slice of a chain in-process, in a runner process or
//!   in a container
//! - **Progress**: Socket or file channels carry runner progress back
//! - **Scripting**: Rhai-based voxel operators
//! - **Communication**: Crossbeam channels for events and notifications
//!
//! ## Configuration
//!
//! Execution settings are read from `$TOMOPIPE_CONFIG` or the platform config
//! directory under `dev.tomviz.tomopipe`:
//!
//! - **Linux**: `~/.config/dev.tomviz.tomopipe/settings.toml`
//! - **macOS**: `~/Library/Application Support/dev.tomviz.tomopipe/settings.toml`
//! - **Windows**: `%APPDATA%\dev.tomviz.tomopipe\settings.toml`
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tomopipe::{
//!     buffer::{ScalarType, VolumeBuffer},
//!     config::PipelineSettings,
//!     operator::{Invert, Operator},
//!     pipeline::Pipeline,
//! };
//!
//! fn main() -> tomopipe::Result<()> {
//!     let volume = VolumeBuffer::filled([64, 64, 64], ScalarType::U8, 10.0);
//!     let mut pipeline = Pipeline::new("tilt.tvb", volume, PipelineSettings::load_or_default())?;
//!
//!     let root = pipeline.root();
//!     pipeline.add_operator(root, Operator::new(Invert))?;
//!     pipeline.wait_for_idle(Duration::from_secs(60));
//!
//!     let output = pipeline.last_result();
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod executor;
pub mod operator;
pub mod pipeline;
pub mod progress;
pub mod runner;
pub mod scripting;

// Re-export commonly used types
pub use buffer::{ScalarType, VolumeBuffer};
pub use config::{ExecutionMode, PipelineSettings};
pub use error::{PipelineError, Result};
pub use executor::{create_executor, PipelineExecutor, PipelineWorker, WorkerPool};
pub use operator::{Operator, OperatorFactory, Transform};
pub use pipeline::{DataSourceId, Execution, OperatorId, Pipeline, PipelineNotification};
pub use runner::{execute_state, RunnerArgs};
pub use scripting::ScriptEngine;
