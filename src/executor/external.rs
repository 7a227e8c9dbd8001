//! Executors that run the pipeline outside this process
//!
//! [`ExternalPipelineExecutor`] owns everything a run needs on the host side:
//! a temporary working directory, the state document, the input buffer file,
//! the progress reader and the read-back of results. An [`ExternalBackend`]
//! only knows how to start, watch and stop the runner (a subprocess or a
//! container). Backend calls may block for a long time (an image pull, a stop
//! grace period), so each request gets a monitor thread that drives the
//! backend and reports back over a channel.
//!
//! Working directory layout:
//!
//! ```text
//! <work>/state.tvsm        pipeline state
//! <work>/original.tvb      input buffer
//! <work>/transformed.tvb   result, written by the runner
//! <work>/progress          progress socket or directory
//! <work>/<k>/*.tvb         child outputs of operator k
//! ```

use super::state::{PipelineState, ORIGINAL_FILENAME, PROGRESS_PATH, STATE_FILENAME, TRANSFORM_FILENAME};
use super::{
    slice_range, ExecutionFuture, ExecutionOutcome, ExecutionState, ExecutorEvent,
    PipelineExecutor,
};
use crate::buffer::{VolumeBuffer, TRANSFER_EXTENSION};
use crate::config::{ExecutionMode, ProgressChannelKind};
use crate::error::ExecutionFailure;
use crate::operator::{Operator, OperatorEvent, OperatorState, TransformResult};
use crate::pipeline::id::RequestId;
use crate::progress::{self, MessageKind, ProgressMessage, ProgressReader};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;

/// What a backend needs to start the runner
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Host working directory
    pub working_dir: PathBuf,
    /// Runner arguments, with paths as the runner sees them
    pub args: Vec<String>,
}

/// Result of checking on a launched runner
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalStatus {
    Running,
    /// Exited cleanly
    Exited,
    Failed(ExecutionFailure),
}

/// Starts, watches and stops an external runner. Everything but `mode` and
/// `runner_mount` is called from a monitor thread.
pub trait ExternalBackend: Send + 'static {
    fn mode(&self) -> ExecutionMode;

    /// Fixed path the runner sees the working directory at, if it does not
    /// see the host path
    fn runner_mount(&self) -> Option<PathBuf> {
        None
    }

    /// Minimum time between two status checks
    fn status_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// May block until the runner is up, including any image pull
    fn launch(&mut self, spec: &LaunchSpec) -> Result<(), ExecutionFailure>;

    fn status(&mut self) -> ExternalStatus;

    /// Stop the runner, escalating to a forced kill after the grace period
    fn terminate(&mut self);

    /// Release whatever is left of a finished or terminated runner
    fn cleanup(&mut self);
}

/// Build the runner argument list
pub fn runner_args(runner_dir: &Path, start: usize, channel: ProgressChannelKind) -> Vec<String> {
    vec![
        "-s".to_string(),
        runner_dir.join(STATE_FILENAME).display().to_string(),
        "-i".to_string(),
        start.to_string(),
        "-o".to_string(),
        runner_dir
            .join(format!("{}.{}", TRANSFORM_FILENAME, TRANSFER_EXTENSION))
            .display()
            .to_string(),
        "-p".to_string(),
        channel.as_str().to_string(),
        "-u".to_string(),
        runner_dir.join(PROGRESS_PATH).display().to_string(),
    ]
}

/// Floor on the monitor's status polling
const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(10);

/// What the monitor thread of one request reports
#[derive(Debug)]
enum MonitorEvent {
    Launched,
    /// The runner ended without being asked to
    Exited(ExternalStatus),
    /// The runner was stopped on request
    Terminated,
}

/// Executor side of a monitor thread
struct Monitor {
    stop: Sender<()>,
    events: Receiver<MonitorEvent>,
}

impl Monitor {
    fn request_stop(&self) {
        let _ = self.stop.try_send(());
    }

    /// True once the runner is gone
    fn stopped(&self) -> bool {
        loop {
            match self.events.try_recv() {
                Ok(MonitorEvent::Launched) => continue,
                Ok(_) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }
}

fn lock<B>(backend: &Mutex<B>) -> MutexGuard<'_, B> {
    backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Start the thread that drives `backend` for one request. It joins
/// `previous` before launching, so two runners never share the backend.
fn spawn_monitor<B: ExternalBackend>(
    backend: Arc<Mutex<B>>,
    spec: LaunchSpec,
    previous: Option<JoinHandle<()>>,
    request: RequestId,
) -> std::io::Result<(Monitor, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let handle = std::thread::Builder::new()
        .name(format!("tomopipe-monitor-{}", request.0))
        .spawn(move || monitor(backend, spec, previous, stop_rx, event_tx))?;
    let monitor = Monitor {
        stop: stop_tx,
        events: event_rx,
    };
    Ok((monitor, handle))
}

fn monitor<B: ExternalBackend>(
    backend: Arc<Mutex<B>>,
    spec: LaunchSpec,
    previous: Option<JoinHandle<()>>,
    stop: Receiver<()>,
    events: Sender<MonitorEvent>,
) {
    if let Some(previous) = previous {
        if previous.join().is_err() {
            tracing::error!("previous runner monitor panicked");
        }
    }
    // Canceled while the previous runner was stopping
    if stop.try_recv().is_ok() {
        let _ = events.send(MonitorEvent::Terminated);
        return;
    }

    let (launched, interval) = {
        let mut backend = lock(&backend);
        let launched = backend.launch(&spec);
        if launched.is_err() {
            backend.cleanup();
        }
        (launched, backend.status_interval().max(MIN_STATUS_INTERVAL))
    };
    if let Err(failure) = launched {
        let _ = events.send(MonitorEvent::Exited(ExternalStatus::Failed(failure)));
        return;
    }
    let _ = events.send(MonitorEvent::Launched);

    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            // Stop requested, or the executor is gone
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let mut backend = lock(&backend);
                backend.terminate();
                backend.cleanup();
                let _ = events.send(MonitorEvent::Terminated);
                return;
            }
        }

        let mut backend = lock(&backend);
        let status = backend.status();
        if !matches!(status, ExternalStatus::Running) {
            backend.cleanup();
            let _ = events.send(MonitorEvent::Exited(status));
            return;
        }
    }
}

struct ActiveRun {
    request: RequestId,
    workdir: TempDir,
    /// Operators in the state document; progress indices point in here
    operators: Vec<Arc<Operator>>,
    start: usize,
    reader: Box<dyn ProgressReader>,
    cancel_watch: Vec<Receiver<OperatorEvent>>,
    monitor: Monitor,
}

impl ActiveRun {
    fn output_path(&self) -> PathBuf {
        self.workdir
            .path()
            .join(format!("{}.{}", TRANSFORM_FILENAME, TRANSFER_EXTENSION))
    }
}

/// A canceled run whose runner is still being stopped
struct StoppingRun {
    request: RequestId,
    /// Removed once the runner is gone
    workdir: TempDir,
    monitor: Monitor,
}

pub struct ExternalPipelineExecutor<B: ExternalBackend> {
    backend: Arc<Mutex<B>>,
    mode: ExecutionMode,
    runner_mount: Option<PathBuf>,
    channel: ProgressChannelKind,
    active: Option<ActiveRun>,
    stopping: Vec<StoppingRun>,
    /// Monitor of the latest request
    last_monitor: Option<JoinHandle<()>>,
    pending: VecDeque<ExecutorEvent>,
    last_request: RequestId,
    state: ExecutionState,
}

impl<B: ExternalBackend> ExternalPipelineExecutor<B> {
    pub fn new(backend: B, channel: ProgressChannelKind) -> Self {
        Self {
            mode: backend.mode(),
            runner_mount: backend.runner_mount(),
            backend: Arc::new(Mutex::new(backend)),
            channel,
            active: None,
            stopping: Vec::new(),
            last_monitor: None,
            pending: VecDeque::new(),
            last_request: RequestId(0),
            state: ExecutionState::Idle,
        }
    }

    /// Host working directory of the run in flight
    pub fn working_dir(&self) -> Option<&Path> {
        self.active.as_ref().map(|run| run.workdir.path())
    }

    fn prepare(
        &self,
        buffer: &VolumeBuffer,
        operators: &[Arc<Operator>],
        start: usize,
    ) -> Result<(TempDir, Box<dyn ProgressReader>, LaunchSpec), ExecutionFailure> {
        let setup = |message: String| ExecutionFailure::Setup { message };

        let workdir = tempfile::Builder::new()
            .prefix("tomopipe-")
            .tempdir()
            .map_err(|e| setup(format!("unable to create temporary directory: {}", e)))?;
        let host_dir = workdir.path().to_path_buf();
        let runner_dir = self.runner_mount.clone().unwrap_or_else(|| host_dir.clone());

        let input = format!("{}.{}", ORIGINAL_FILENAME, TRANSFER_EXTENSION);
        buffer
            .write_to(&host_dir.join(&input))
            .map_err(|e| setup(format!("unable to write data: {}", e)))?;

        let mut state =
            PipelineState::new(host_dir.join(&input), operators).with_spacing(buffer.spacing());
        state.relocate(&host_dir, &runner_dir);
        state
            .write_to(&host_dir.join(STATE_FILENAME))
            .map_err(|e| setup(format!("unable to write state file: {}", e)))?;

        let progress_path = host_dir.join(PROGRESS_PATH);
        let mut reader = progress::create_reader(self.channel, &progress_path);
        if let Err(e) = reader.start() {
            tracing::warn!("progress {} unavailable ({}), using files", reader.kind().as_str(), e);
            reader = Box::new(progress::FilesProgressReader::new(&progress_path));
            reader
                .start()
                .map_err(|e| setup(format!("unable to start progress reader: {}", e)))?;
        }

        let spec = LaunchSpec {
            working_dir: host_dir,
            args: runner_args(&runner_dir, start, reader.kind()),
        };
        Ok((workdir, reader, spec))
    }

    fn fail_setup(&mut self, request: RequestId, failure: ExecutionFailure) {
        tracing::error!(%request, "external run setup failed: {}", failure);
        self.pending.push_back(ExecutorEvent::Finished {
            request,
            outcome: ExecutionOutcome::Failed(failure),
        });
        self.state = ExecutionState::Failed;
    }

    /// Stop the reader and dispatch messages that raced the exit
    fn stop_reader(run: &mut ActiveRun, out: &mut Vec<ExecutorEvent>) {
        run.reader.stop();
        let lines: Vec<String> = run.reader.messages().try_iter().collect();
        for line in lines {
            Self::dispatch(run, &line, out);
        }
    }

    /// Report canceled runs whose runner is gone
    fn reap_stopped(&mut self, out: &mut Vec<ExecutorEvent>) {
        let (stopped, stopping): (Vec<StoppingRun>, Vec<StoppingRun>) =
            std::mem::take(&mut self.stopping)
                .into_iter()
                .partition(|run| run.monitor.stopped());
        self.stopping = stopping;
        for run in stopped {
            tracing::debug!(request = %run.request, "external run stopped");
            out.push(ExecutorEvent::Finished {
                request: run.request,
                outcome: ExecutionOutcome::Canceled,
            });
        }
    }

    fn dispatch(run: &ActiveRun, line: &str, out: &mut Vec<ExecutorEvent>) {
        let message = match ProgressMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("{}", e);
                return;
            }
        };
        let request = run.request;

        let Some(k) = message.operator else {
            match message.kind {
                MessageKind::Started => tracing::debug!(%request, "runner started"),
                MessageKind::Finished => tracing::debug!(%request, "runner finished"),
                other => tracing::error!(%request, "unrecognized pipeline message {:?}", other),
            }
            return;
        };

        let (Some(op), Some(index)) = (run.operators.get(k), k.checked_sub(run.start)) else {
            tracing::warn!(%request, operator = k, "progress for unknown operator");
            return;
        };

        match message.kind {
            MessageKind::Started => {
                op.transforming_started();
                out.push(ExecutorEvent::OperatorStarted { request, index });
            }
            MessageKind::Finished => {
                for (label, buffer) in read_child_outputs(&run.workdir.path().join(k.to_string())) {
                    out.push(ExecutorEvent::ChildDataSource {
                        request,
                        index,
                        label,
                        buffer,
                    });
                }
                op.set_state(OperatorState::Complete);
                op.transforming_done(TransformResult::Complete);
                out.push(ExecutorEvent::OperatorFinished {
                    request,
                    index,
                    result: TransformResult::Complete,
                });
            }
            MessageKind::Error => {
                let error = message.error.unwrap_or_else(|| "operator failed".to_string());
                tracing::error!(%request, operator = %op.label(), "{}", error);
                op.set_last_error(error);
                op.set_state(OperatorState::Error);
                op.transforming_done(TransformResult::Error);
                out.push(ExecutorEvent::OperatorFinished {
                    request,
                    index,
                    result: TransformResult::Error,
                });
            }
            MessageKind::ProgressMaximum => match message.value_u64() {
                Some(max) => op.set_total_progress_steps(max),
                None => tracing::warn!("progress.maximum without a numeric value"),
            },
            MessageKind::ProgressStep => match message.value_u64() {
                Some(step) => op.set_progress_step(step),
                None => tracing::warn!("progress.step without a numeric value"),
            },
            MessageKind::ProgressMessage => {
                op.set_progress_message(message.value_str().unwrap_or_default())
            }
            MessageKind::ProgressData => {
                let Some(relative) = message.value_str() else {
                    tracing::warn!("progress.data without a path");
                    return;
                };
                let path = run.reader.resolve_data_path(&relative);
                match VolumeBuffer::read_from(&path) {
                    Ok(buffer) => out.push(ExecutorEvent::ChildDataSource {
                        request,
                        index,
                        label: op.label(),
                        buffer,
                    }),
                    Err(e) => {
                        tracing::error!(path = %path.display(), "unable to load progress data: {}", e)
                    }
                }
            }
        }
    }

    fn canceled_by_operator(run: &ActiveRun) -> bool {
        run.cancel_watch.iter().any(|rx| {
            rx.try_iter()
                .any(|event| matches!(event, OperatorEvent::TransformCanceled))
        })
    }

    fn finish(&mut self, mut run: ActiveRun, status: ExternalStatus, out: &mut Vec<ExecutorEvent>) {
        Self::stop_reader(&mut run, out);
        let outcome = match status {
            ExternalStatus::Exited => {
                let path = run.output_path();
                match VolumeBuffer::read_from(&path) {
                    Ok(buffer) => ExecutionOutcome::Succeeded(buffer),
                    Err(e) => ExecutionOutcome::Failed(ExecutionFailure::Output {
                        path,
                        message: format!("unable to load transformed data: {}", e),
                    }),
                }
            }
            ExternalStatus::Failed(failure) => ExecutionOutcome::Failed(failure),
            ExternalStatus::Running => return,
        };

        if let ExecutionOutcome::Failed(failure) = &outcome {
            tracing::error!(request = %run.request, "external run failed: {}", failure);
            for op in &run.operators[run.start..] {
                if op.state() == OperatorState::Running {
                    op.set_last_error(failure.to_string());
                    op.set_state(OperatorState::Error);
                    op.transforming_done(TransformResult::Error);
                }
            }
        }

        self.state = outcome.state();
        out.push(ExecutorEvent::Finished {
            request: run.request,
            outcome,
        });
    }
}

/// Buffers an operator wrote as child outputs, keyed by file stem
fn read_child_outputs(dir: &Path) -> Vec<(String, VolumeBuffer)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|e| e == TRANSFER_EXTENSION).unwrap_or(false))
        .collect();
    files.sort();

    let mut children = Vec::new();
    for path in files {
        match VolumeBuffer::read_from(&path) {
            Ok(buffer) => {
                let label = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                children.push((label, buffer));
            }
            Err(e) => {
                tracing::error!(path = %path.display(), "unable to load child data: {}", e);
                break;
            }
        }
    }
    children
}

impl<B: ExternalBackend> PipelineExecutor for ExternalPipelineExecutor<B> {
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn execute(
        &mut self,
        buffer: &VolumeBuffer,
        operators: &[Arc<Operator>],
        start: usize,
        end: Option<usize>,
    ) -> ExecutionFuture {
        if self.active.is_some() {
            self.cancel();
        }

        let (start, end) = slice_range(operators.len(), start, end);
        let listed = operators[..end].to_vec();
        let future_ops = operators[start..end].to_vec();

        self.last_request = self.last_request.next();
        let request = self.last_request;
        let future = ExecutionFuture {
            request,
            operators: future_ops,
        };

        if future.operators.is_empty() {
            self.pending.push_back(ExecutorEvent::Finished {
                request,
                outcome: ExecutionOutcome::Succeeded(buffer.clone()),
            });
            self.state = ExecutionState::Succeeded;
            return future;
        }

        self.state = ExecutionState::Launching;
        let (workdir, mut reader, spec) = match self.prepare(buffer, &listed, start) {
            Ok(prepared) => prepared,
            Err(failure) => {
                self.fail_setup(request, failure);
                return future;
            }
        };

        tracing::info!(
            %request,
            mode = %self.mode,
            dir = %spec.working_dir.display(),
            "launching external pipeline"
        );
        let previous = self.last_monitor.take();
        let spawned = spawn_monitor(Arc::clone(&self.backend), spec, previous, request);
        let (monitor, handle) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                reader.stop();
                let message = format!("unable to start runner monitor: {}", e);
                self.fail_setup(request, ExecutionFailure::Setup { message });
                return future;
            }
        };
        self.last_monitor = Some(handle);

        let cancel_watch = future.operators.iter().map(|op| op.subscribe()).collect();
        self.active = Some(ActiveRun {
            request,
            workdir,
            operators: listed,
            start,
            reader,
            cancel_watch,
            monitor,
        });
        future
    }

    fn cancel(&mut self) {
        let Some(run) = self.active.take() else {
            return;
        };
        tracing::info!(request = %run.request, "canceling external pipeline");
        run.monitor.request_stop();

        let ActiveRun {
            request,
            workdir,
            operators,
            start,
            mut reader,
            monitor,
            ..
        } = run;
        // Progress from a canceled run is dropped, only its end is reported
        reader.stop();
        for op in &operators[start..] {
            if matches!(op.state(), OperatorState::Running | OperatorState::Canceled) {
                op.set_state(OperatorState::Canceled);
                op.transforming_done(TransformResult::Canceled);
            }
        }
        self.stopping.push(StoppingRun {
            request,
            workdir,
            monitor,
        });
        self.state = ExecutionState::Canceled;
    }

    fn is_running(&self) -> bool {
        self.active.is_some()
    }

    fn state(&self) -> ExecutionState {
        self.state
    }

    fn poll(&mut self, timeout: Duration) -> Vec<ExecutorEvent> {
        let mut out: Vec<ExecutorEvent> = self.pending.drain(..).collect();
        self.reap_stopped(&mut out);

        if self.active.as_ref().map(Self::canceled_by_operator).unwrap_or(false) {
            self.cancel();
        }

        if self.active.is_none() {
            if out.is_empty() {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                self.reap_stopped(&mut out);
            }
            return out;
        }
        let Some(run) = self.active.as_ref() else {
            return out;
        };
        let request = run.request;

        let mut lines = Vec::new();
        let mut reports = Vec::new();
        if out.is_empty() {
            crossbeam_channel::select! {
                recv(run.reader.messages()) -> line => lines.extend(line.ok()),
                recv(run.monitor.events) -> report => reports.extend(report.ok()),
                default(timeout) => {}
            }
        }
        lines.extend(run.reader.messages().try_iter());
        for line in &lines {
            Self::dispatch(run, line, &mut out);
        }

        let mut lost = false;
        loop {
            match run.monitor.events.try_recv() {
                Ok(report) => reports.push(report),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    lost = true;
                    break;
                }
            }
        }

        let mut ended = None;
        for report in reports {
            match report {
                MonitorEvent::Launched => {
                    tracing::debug!(%request, "runner launched");
                    self.state = ExecutionState::Running;
                }
                MonitorEvent::Exited(status) => ended = Some(status),
                MonitorEvent::Terminated => {
                    ended = Some(ExternalStatus::Failed(ExecutionFailure::Setup {
                        message: "runner stopped without a cancel".to_string(),
                    }))
                }
            }
        }
        if ended.is_none() && lost {
            ended = Some(ExternalStatus::Failed(ExecutionFailure::Setup {
                message: "runner monitor ended without reporting".to_string(),
            }));
        }

        if let Some(status) = ended {
            if let Some(run) = self.active.take() {
                self.finish(run, status, &mut out);
            }
        }
        out
    }
}

impl<B: ExternalBackend> Drop for ExternalPipelineExecutor<B> {
    fn drop(&mut self) {
        self.cancel();
        let workdirs: Vec<TempDir> = self.stopping.drain(..).map(|run| run.workdir).collect();
        let Some(monitor) = self.last_monitor.take() else {
            return;
        };
        // Working directories go once the last runner is stopped
        let detached = std::thread::Builder::new()
            .name("tomopipe-monitor-reaper".to_string())
            .spawn(move || {
                if monitor.join().is_err() {
                    tracing::error!("runner monitor panicked");
                }
                drop(workdirs);
            });
        if let Err(e) = detached {
            tracing::warn!("unable to wait for runner shutdown: {}", e);
        }
    }
}
