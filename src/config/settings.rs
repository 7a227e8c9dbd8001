//! Execution settings for a pipeline
//!
//! These settings choose where operators run and tune the behaviour of the
//! out-of-process executors. They are plain data: the caller loads them once
//! and passes them to [`crate::pipeline::Pipeline`] and the executors.
//!
//! # Main Types
//!
//! - [`PipelineSettings`] - Top-level settings document
//! - [`ExecutionMode`] - Threaded, docker or external process
//! - [`DockerSettings`] - Image, pull and remove policy, timeouts
//! - [`ExternalSettings`] - Runner executable and kill grace period
//! - [`ProgressChannelKind`] - Socket or file based progress reporting

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where a pipeline's operators are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In-process on the shared worker pool
    #[default]
    Threaded,
    /// Inside a container started from `docker.image`
    Docker,
    /// In a separate process started from `external.executable`
    External,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Threaded => "threaded",
            ExecutionMode::Docker => "docker",
            ExecutionMode::External => "external",
        }
    }

    /// True for the modes that serialize state and run in another process.
    pub fn is_out_of_process(&self) -> bool {
        !matches!(self, ExecutionMode::Threaded)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" | "thread" => Ok(ExecutionMode::Threaded),
            "docker" => Ok(ExecutionMode::Docker),
            "external" | "process" => Ok(ExecutionMode::External),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

/// Transport used by external runs to report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProgressChannelKind {
    /// Socket where the platform supports it, files otherwise
    #[default]
    Auto,
    Socket,
    Files,
}

impl ProgressChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressChannelKind::Auto => "auto",
            ProgressChannelKind::Socket => "socket",
            ProgressChannelKind::Files => "files",
        }
    }
}

impl FromStr for ProgressChannelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProgressChannelKind::Auto),
            "socket" => Ok(ProgressChannelKind::Socket),
            "files" => Ok(ProgressChannelKind::Files),
            other => Err(format!("unknown progress channel '{}'", other)),
        }
    }
}

/// Container execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Image the pipeline runner is started from
    pub image: String,

    /// Pull the image once per session before the first run
    pub pull: bool,

    /// Remove the container once it has finished or been stopped
    pub remove: bool,

    /// Seconds `docker stop` waits before killing the container
    pub stop_timeout_secs: u64,

    /// Interval between container status checks
    pub inspect_interval_ms: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            image: String::new(),
            pull: true,
            remove: true,
            stop_timeout_secs: 5,
            inspect_interval_ms: 5000,
        }
    }
}

impl DockerSettings {
    pub fn inspect_interval(&self) -> Duration {
        Duration::from_millis(self.inspect_interval_ms.max(1))
    }
}

/// External process execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalSettings {
    /// Runner executable; must exist before a run is launched
    pub executable: Option<PathBuf>,

    /// Arguments placed before the runner arguments. Without an executable
    /// this binary is used with `execute-state`.
    pub runner_args: Vec<String>,

    /// Grace period between SIGTERM and a forced kill on cancel
    pub kill_grace_ms: u64,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            executable: None,
            runner_args: Vec::new(),
            kill_grace_ms: 3000,
        }
    }
}

impl ExternalSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProgressSettings {
    pub channel: ProgressChannelKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker pool size; 0 selects half the hardware threads
    pub threads: usize,
}

/// Settings document for pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineSettings {
    pub execution_mode: ExecutionMode,
    pub docker: DockerSettings,
    pub external: ExternalSettings,
    pub progress: ProgressSettings,
    pub worker: WorkerSettings,

    /// Directory for daily rolling log files
    pub log_dir: Option<PathBuf>,
}

impl PipelineSettings {
    /// Create settings with every value at its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single value by dotted key, as used by `tomopipe settings set`.
    pub fn set_value(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        fn parse<T: FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
            value
                .parse()
                .map_err(|_| format!("invalid value '{}' for {}", value, key))
        }

        match key {
            "execution_mode" => self.execution_mode = value.parse()?,
            "docker.image" => self.docker.image = value.to_string(),
            "docker.pull" => self.docker.pull = parse(key, value)?,
            "docker.remove" => self.docker.remove = parse(key, value)?,
            "docker.stop_timeout_secs" => self.docker.stop_timeout_secs = parse(key, value)?,
            "docker.inspect_interval_ms" => self.docker.inspect_interval_ms = parse(key, value)?,
            "external.executable" => {
                self.external.executable = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "external.runner_args" => {
                self.external.runner_args = value.split_whitespace().map(str::to_string).collect()
            }
            "external.kill_grace_ms" => self.external.kill_grace_ms = parse(key, value)?,
            "progress.channel" => self.progress.channel = value.parse()?,
            "worker.threads" => self.worker.threads = parse(key, value)?,
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            other => return Err(format!("unknown setting '{}'", other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.execution_mode, ExecutionMode::Threaded);
        assert!(settings.docker.pull);
        assert!(settings.docker.remove);
        assert_eq!(settings.docker.inspect_interval(), Duration::from_secs(5));
        assert_eq!(settings.external.kill_grace(), Duration::from_secs(3));
        assert_eq!(settings.progress.channel, ProgressChannelKind::Auto);
        assert_eq!(settings.worker.threads, 0);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: PipelineSettings = toml::from_str(
            r#"
            execution_mode = "docker"

            [docker]
            image = "tomviz/pipeline:latest"
            remove = false
            "#,
        )
        .unwrap();

        assert_eq!(settings.execution_mode, ExecutionMode::Docker);
        assert_eq!(settings.docker.image, "tomviz/pipeline:latest");
        assert!(!settings.docker.remove);
        assert!(settings.docker.pull);
        assert_eq!(settings.docker.stop_timeout_secs, 5);
    }

    #[test]
    fn test_set_value() {
        let mut settings = PipelineSettings::new();
        settings.set_value("execution_mode", "external").unwrap();
        settings.set_value("external.executable", "/opt/runner").unwrap();
        settings.set_value("progress.channel", "files").unwrap();
        settings.set_value("worker.threads", "3").unwrap();
        settings.set_value("external.runner_args", "execute-state --quiet").unwrap();

        assert_eq!(settings.execution_mode, ExecutionMode::External);
        assert_eq!(
            settings.external.executable.as_deref(),
            Some(std::path::Path::new("/opt/runner"))
        );
        assert_eq!(settings.progress.channel, ProgressChannelKind::Files);
        assert_eq!(settings.worker.threads, 3);
        assert_eq!(settings.external.runner_args, vec!["execute-state", "--quiet"]);

        assert!(settings.set_value("docker.pull", "maybe").is_err());
        assert!(settings.set_value("no.such.key", "1").is_err());
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("Docker".parse::<ExecutionMode>(), Ok(ExecutionMode::Docker));
        assert!(ExecutionMode::External.is_out_of_process());
        assert!(!ExecutionMode::Threaded.is_out_of_process());
        assert!("cloud".parse::<ExecutionMode>().is_err());
    }
}
