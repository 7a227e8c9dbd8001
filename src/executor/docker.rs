//! Runner inside a container
//!
//! The container lifecycle goes through [`ContainerRuntime`]; [`DockerCli`]
//! implements it by shelling out to the `docker` command. The working
//! directory is bind-mounted at [`CONTAINER_MOUNT`]. A container has no
//! stdio hook into this process, so its status is inspected on a fixed
//! interval and progress arrives over the progress channel.

use super::external::{ExternalBackend, ExternalStatus, LaunchSpec};
use crate::config::{DockerSettings, ExecutionMode};
use crate::error::{ExecutionFailure, PipelineError, Result};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Where the working directory appears inside the container
pub const CONTAINER_MOUNT: &str = "/tomviz";

/// Arguments of a container run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub image: String,
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
    /// Host path to container path
    pub mounts: Vec<(PathBuf, String)>,
}

/// Result of inspecting a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    /// `created`, `running`, `exited`, `dead`, ...
    pub status: String,
    pub exit_code: i64,
}

impl ContainerStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self.status.as_str(), "exited" | "dead")
    }
}

/// Container lifecycle primitives
pub trait ContainerRuntime: Send + Sync {
    fn pull(&self, image: &str) -> Result<()>;

    /// Start a detached container and return its id
    fn run(&self, spec: &RunSpec) -> Result<String>;

    fn inspect(&self, container: &str) -> Result<ContainerStatus>;

    fn stop(&self, container: &str, timeout: Duration) -> Result<()>;

    fn remove(&self, container: &str, force: bool) -> Result<()>;

    fn logs(&self, container: &str) -> Result<String>;
}

/// [`ContainerRuntime`] backed by the `docker` command line
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run a docker command; stdout on success
    fn invoke(&self, args: &[String]) -> Result<String> {
        tracing::debug!(args = ?args, "docker");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| {
                PipelineError::Launch(format!("cannot run {}: {}", self.program.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PipelineError::Launch(format!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }

    /// Arguments of `docker run` for `spec`
    pub fn run_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        for (host, container) in &spec.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host.display(), container));
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerCli {
    fn pull(&self, image: &str) -> Result<()> {
        self.invoke(&["pull".to_string(), image.to_string()])
            .map(|_| ())
    }

    fn run(&self, spec: &RunSpec) -> Result<String> {
        let id = self.invoke(&Self::run_args(spec))?.trim().to_string();
        if id.is_empty() {
            return Err(PipelineError::Launch("docker run returned no container id".to_string()));
        }
        Ok(id)
    }

    fn inspect(&self, container: &str) -> Result<ContainerStatus> {
        let out = self.invoke(&[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            container.to_string(),
        ])?;
        parse_inspect(&out)
    }

    fn stop(&self, container: &str, timeout: Duration) -> Result<()> {
        self.invoke(&[
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            container.to_string(),
        ])
        .map(|_| ())
    }

    fn remove(&self, container: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container.to_string());
        self.invoke(&args).map(|_| ())
    }

    fn logs(&self, container: &str) -> Result<String> {
        let output = Command::new(&self.program)
            .args(["logs", container])
            .output()
            .map_err(|e| PipelineError::Launch(format!("cannot run docker logs: {}", e)))?;
        // The container's stdout and stderr come back on ours
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }
}

/// Parse `<status> <exit code>` from `docker inspect --format`
pub fn parse_inspect(output: &str) -> Result<ContainerStatus> {
    let mut parts = output.split_whitespace();
    let (Some(status), Some(code)) = (parts.next(), parts.next()) else {
        return Err(PipelineError::Launch(format!(
            "unexpected docker inspect output '{}'",
            output.trim()
        )));
    };
    let exit_code = code.parse().map_err(|_| {
        PipelineError::Launch(format!("invalid exit code '{}' from docker inspect", code))
    })?;
    Ok(ContainerStatus {
        status: status.to_string(),
        exit_code,
    })
}

/// Runs the runner in a container from `settings.image`
pub struct DockerBackend {
    runtime: Arc<dyn ContainerRuntime>,
    settings: DockerSettings,
    pulled: bool,
    container: Option<String>,
    stopped: bool,
}

impl DockerBackend {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: DockerSettings) -> Self {
        Self {
            runtime,
            settings,
            pulled: false,
            container: None,
            stopped: false,
        }
    }

    /// Pull again before the next run
    pub fn reset_pull(&mut self) {
        self.pulled = false;
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    fn launch_failure(&self, message: impl ToString) -> ExecutionFailure {
        ExecutionFailure::Launch {
            what: format!("container from {}", self.settings.image),
            message: message.to_string(),
        }
    }
}

impl ExternalBackend for DockerBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Docker
    }

    fn runner_mount(&self) -> Option<PathBuf> {
        Some(PathBuf::from(CONTAINER_MOUNT))
    }

    fn status_interval(&self) -> Duration {
        self.settings.inspect_interval()
    }

    fn launch(&mut self, spec: &LaunchSpec) -> std::result::Result<(), ExecutionFailure> {
        if self.settings.image.is_empty() {
            return Err(self.launch_failure("no docker image configured"));
        }

        if self.settings.pull && !self.pulled {
            tracing::info!(image = %self.settings.image, "pulling image");
            self.runtime
                .pull(&self.settings.image)
                .map_err(|e| self.launch_failure(format!("pull failed: {}", e)))?;
            self.pulled = true;
        }

        let run = RunSpec {
            image: self.settings.image.clone(),
            entrypoint: None,
            args: spec.args.clone(),
            mounts: vec![(spec.working_dir.clone(), CONTAINER_MOUNT.to_string())],
        };
        let id = self
            .runtime
            .run(&run)
            .map_err(|e| self.launch_failure(e))?;
        tracing::info!(container = %id, image = %self.settings.image, "container started");
        self.container = Some(id);
        self.stopped = false;
        Ok(())
    }

    fn status(&mut self) -> ExternalStatus {
        let Some(id) = self.container.clone() else {
            return ExternalStatus::Failed(ExecutionFailure::Setup {
                message: "no container".to_string(),
            });
        };

        let status = match self.runtime.inspect(&id) {
            Ok(status) => status,
            Err(e) => {
                return ExternalStatus::Failed(ExecutionFailure::Launch {
                    what: format!("docker inspect {}", id),
                    message: e.to_string(),
                })
            }
        };
        if !status.is_finished() {
            return ExternalStatus::Running;
        }
        if status.exit_code == 0 && status.status == "exited" {
            tracing::debug!(container = %id, "container exited cleanly");
            return ExternalStatus::Exited;
        }

        let logs = self.runtime.logs(&id).unwrap_or_else(|e| {
            tracing::warn!(container = %id, "unable to fetch logs: {}", e);
            String::new()
        });
        ExternalStatus::Failed(ExecutionFailure::ContainerExit {
            container: id,
            code: status.exit_code,
            logs,
        })
    }

    fn terminate(&mut self) {
        if let Some(id) = &self.container {
            let timeout = Duration::from_secs(self.settings.stop_timeout_secs);
            if let Err(e) = self.runtime.stop(id, timeout) {
                tracing::error!(container = %id, "failed to stop container: {}", e);
            }
            self.stopped = true;
        }
    }

    fn cleanup(&mut self) {
        if let Some(id) = self.container.take() {
            if self.settings.remove {
                if let Err(e) = self.runtime.remove(&id, self.stopped) {
                    tracing::warn!(container = %id, "failed to remove container: {}", e);
                }
            }
        }
    }
}
