//! Runner as a plain subprocess

use super::external::{ExternalBackend, ExternalStatus, LaunchSpec};
use crate::config::{ExecutionMode, ExternalSettings};
use crate::error::ExecutionFailure;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Environment variable prefixes that belong to the host application or to
/// an embedded scripting runtime and must not leak into the runner
const STRIPPED_ENV_PREFIXES: &[&str] = &["TOMVIZ", "TOMOPIPE", "PYTHON"];

/// Subcommand used when this binary is its own runner
pub const RUNNER_SUBCOMMAND: &str = "execute-state";

const KILL_POLL: Duration = Duration::from_millis(20);

/// Host environment minus application and scripting runtime variables,
/// with unbuffered output forced
pub fn sanitized_env() -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| {
            let upper = key.to_ascii_uppercase();
            !STRIPPED_ENV_PREFIXES.iter().any(|p| upper.starts_with(p))
        })
        .collect();
    env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
    env
}

/// Exit codes above 128 are the shell's way of reporting death by signal
fn crash_signal(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(signal);
        }
    }
    match status.code() {
        Some(code) if (129..=192).contains(&code) => Some(code - 128),
        _ => None,
    }
}

type Captured = Arc<Mutex<String>>;

fn capture<R: Read + Send + 'static>(source: R, sink: Captured, stream: &'static str) -> Option<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("runner-{}", stream))
        .spawn(move || {
            let reader = BufReader::new(source);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                tracing::debug!(stream, "{}", line);
                let mut sink = sink.lock().unwrap_or_else(|p| p.into_inner());
                sink.push_str(&line);
                sink.push('\n');
            }
        })
        .ok()
}

struct RunningProcess {
    child: Child,
    command: String,
    stdout: Captured,
    stderr: Captured,
    capture_threads: Vec<JoinHandle<()>>,
}

impl RunningProcess {
    fn join_capture(&mut self) -> (String, String) {
        for thread in self.capture_threads.drain(..) {
            let _ = thread.join();
        }
        let read = |c: &Captured| c.lock().unwrap_or_else(|p| p.into_inner()).clone();
        (read(&self.stdout), read(&self.stderr))
    }
}

/// Launches the runner executable as a child process
pub struct ProcessBackend {
    settings: ExternalSettings,
    process: Option<RunningProcess>,
}

impl ProcessBackend {
    pub fn new(settings: ExternalSettings) -> Self {
        Self {
            settings,
            process: None,
        }
    }

    /// Executable and leading arguments
    fn command(&self) -> Result<(PathBuf, Vec<String>), ExecutionFailure> {
        match &self.settings.executable {
            Some(path) => {
                if !path.exists() {
                    return Err(ExecutionFailure::Launch {
                        what: path.display().to_string(),
                        message: "executable not found".to_string(),
                    });
                }
                Ok((path.clone(), self.settings.runner_args.clone()))
            }
            None => {
                let exe = std::env::current_exe().map_err(|e| ExecutionFailure::Launch {
                    what: RUNNER_SUBCOMMAND.to_string(),
                    message: format!("cannot locate own executable: {}", e),
                })?;
                let mut args = vec![RUNNER_SUBCOMMAND.to_string()];
                args.extend(self.settings.runner_args.iter().cloned());
                Ok((exe, args))
            }
        }
    }

    /// Captured output of the last process so far
    pub fn captured(&self) -> Option<(String, String)> {
        self.process.as_ref().map(|p| {
            let read = |c: &Captured| c.lock().unwrap_or_else(|p| p.into_inner()).clone();
            (read(&p.stdout), read(&p.stderr))
        })
    }

    #[cfg(unix)]
    fn request_stop(child: &Child) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
            tracing::debug!("SIGTERM failed: {}", e);
        }
    }

    #[cfg(not(unix))]
    fn request_stop(_child: &Child) {}
}

impl ExternalBackend for ProcessBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::External
    }

    fn launch(&mut self, spec: &LaunchSpec) -> Result<(), ExecutionFailure> {
        let (exe, mut args) = self.command()?;
        args.extend(spec.args.iter().cloned());
        let command_line = format!("{} {}", exe.display(), args.join(" "));
        tracing::info!(command = %command_line, "starting runner process");

        let mut child = Command::new(&exe)
            .args(&args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(sanitized_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutionFailure::Launch {
                what: exe.display().to_string(),
                message: e.to_string(),
            })?;

        let stdout = Captured::default();
        let stderr = Captured::default();
        let mut capture_threads = Vec::new();
        if let Some(out) = child.stdout.take() {
            capture_threads.extend(capture(out, stdout.clone(), "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            capture_threads.extend(capture(err, stderr.clone(), "stderr"));
        }

        self.process = Some(RunningProcess {
            child,
            command: command_line,
            stdout,
            stderr,
            capture_threads,
        });
        Ok(())
    }

    fn status(&mut self) -> ExternalStatus {
        let Some(process) = self.process.as_mut() else {
            return ExternalStatus::Failed(ExecutionFailure::Setup {
                message: "no runner process".to_string(),
            });
        };

        let status = match process.child.try_wait() {
            Ok(None) => return ExternalStatus::Running,
            Ok(Some(status)) => status,
            Err(e) => {
                return ExternalStatus::Failed(ExecutionFailure::Setup {
                    message: format!("cannot query runner process: {}", e),
                })
            }
        };

        let (stdout, stderr) = process.join_capture();
        if status.success() {
            tracing::debug!(command = %process.command, "runner exited cleanly");
            return ExternalStatus::Exited;
        }

        let command = process.command.clone();
        let failure = match crash_signal(&status) {
            Some(signal) => ExecutionFailure::Crash {
                command,
                code: status.code(),
                signal: Some(signal),
                stderr,
                stdout,
            },
            None => ExecutionFailure::NonZeroExit {
                command,
                code: status.code().unwrap_or(-1),
                stderr,
                stdout,
            },
        };
        ExternalStatus::Failed(failure)
    }

    fn terminate(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if let Ok(Some(_)) = process.child.try_wait() {
            return;
        }

        Self::request_stop(&process.child);
        let deadline = Instant::now() + self.settings.kill_grace();
        while Instant::now() < deadline {
            if let Ok(Some(_)) = process.child.try_wait() {
                tracing::debug!(command = %process.command, "runner stopped");
                return;
            }
            std::thread::sleep(KILL_POLL);
        }

        tracing::warn!(command = %process.command, "runner ignored SIGTERM, killing");
        if let Err(e) = process.child.kill() {
            tracing::error!("failed to kill runner: {}", e);
        }
        let _ = process.child.wait();
    }

    fn cleanup(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Ok(None) = process.child.try_wait() {
                let _ = process.child.kill();
                let _ = process.child.wait();
            }
            let (_, stderr) = process.join_capture();
            if !stderr.is_empty() {
                tracing::debug!(command = %process.command, "runner stderr:\n{}", stderr);
            }
        }
    }
}
