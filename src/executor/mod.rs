//! Where operator chains run
//!
//! Every executor implements [`PipelineExecutor`]: `execute` starts a
//! request and returns at once, `poll` delivers what happened since the last
//! call. The orchestrating side (the [`crate::pipeline::Pipeline`]) never
//! blocks on a worker; it reacts to [`ExecutorEvent`]s.
//!
//! # Executors
//!
//! - [`ThreadPipelineExecutor`] - In-process, on the shared worker pool
//! - [`ExternalPipelineExecutor`] with [`ProcessBackend`] - A runner process
//! - [`ExternalPipelineExecutor`] with [`DockerBackend`] - A container
//!
//! Each executor tracks at most one request. Starting a new one cancels the
//! previous one; its `Finished { outcome: Canceled }` is still delivered so
//! cancel confirmations are never lost.

pub mod docker;
pub mod external;
pub mod process;
pub mod state;
pub mod threaded;
pub mod worker;

pub use docker::{ContainerRuntime, ContainerStatus, DockerBackend, DockerCli, RunSpec};
pub use external::{ExternalBackend, ExternalPipelineExecutor, ExternalStatus, LaunchSpec};
pub use process::ProcessBackend;
pub use state::PipelineState;
pub use threaded::ThreadPipelineExecutor;
pub use worker::{PipelineWorker, WorkerEvent, WorkerFuture, WorkerPool};

use crate::buffer::VolumeBuffer;
use crate::config::{ExecutionMode, PipelineSettings};
use crate::error::ExecutionFailure;
use crate::operator::{Operator, TransformResult};
use crate::pipeline::id::RequestId;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    /// Image pull, container start or process spawn
    Launching,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ExecutionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionState::Launching | ExecutionState::Running)
    }
}

/// Terminal outcome of a request
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Succeeded(VolumeBuffer),
    Failed(ExecutionFailure),
    Canceled,
}

impl ExecutionOutcome {
    pub fn state(&self) -> ExecutionState {
        match self {
            ExecutionOutcome::Succeeded(_) => ExecutionState::Succeeded,
            ExecutionOutcome::Failed(_) => ExecutionState::Failed,
            ExecutionOutcome::Canceled => ExecutionState::Canceled,
        }
    }
}

/// What an executor reports back. `index` is the position in the
/// request's operator list.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    OperatorStarted {
        request: RequestId,
        index: usize,
    },
    OperatorFinished {
        request: RequestId,
        index: usize,
        result: TransformResult,
    },
    /// An operator produced (or updated) its explicit child data
    ChildDataSource {
        request: RequestId,
        index: usize,
        label: String,
        buffer: VolumeBuffer,
    },
    Finished {
        request: RequestId,
        outcome: ExecutionOutcome,
    },
}

impl ExecutorEvent {
    pub fn request(&self) -> RequestId {
        match self {
            ExecutorEvent::OperatorStarted { request, .. }
            | ExecutorEvent::OperatorFinished { request, .. }
            | ExecutorEvent::ChildDataSource { request, .. }
            | ExecutorEvent::Finished { request, .. } => *request,
        }
    }
}

/// Handle to a request that was just started
#[derive(Debug, Clone)]
pub struct ExecutionFuture {
    pub request: RequestId,
    /// The operators the request runs, after slicing to `start..end`
    pub operators: Vec<Arc<Operator>>,
}

/// Common contract of all executors
pub trait PipelineExecutor: Send {
    fn mode(&self) -> ExecutionMode;

    /// Run `operators[start..end]` (to the end when `end` is `None`) on a
    /// copy of `buffer`. Supersedes any request in flight.
    fn execute(
        &mut self,
        buffer: &VolumeBuffer,
        operators: &[Arc<Operator>],
        start: usize,
        end: Option<usize>,
    ) -> ExecutionFuture;

    /// Begin canceling the request in flight. Confirmation arrives as a
    /// `Finished { outcome: Canceled }` event.
    fn cancel(&mut self);

    /// Remove one operator from the request in flight without disturbing
    /// the rest. False means the caller has to re-run instead.
    fn cancel_operator(&mut self, _op: &Arc<Operator>) -> bool {
        false
    }

    fn is_running(&self) -> bool;

    fn state(&self) -> ExecutionState;

    /// Collect events, waiting up to `timeout` when none are ready.
    fn poll(&mut self, timeout: Duration) -> Vec<ExecutorEvent>;
}

/// Clamp a `start..end` request against the operator list
pub(crate) fn slice_range(len: usize, start: usize, end: Option<usize>) -> (usize, usize) {
    let end = end.unwrap_or(len).min(len);
    (start.min(end), end)
}

/// Build the executor for `mode`
pub fn create_executor(
    mode: ExecutionMode,
    settings: &PipelineSettings,
    pool: Arc<WorkerPool>,
) -> Box<dyn PipelineExecutor> {
    match mode {
        ExecutionMode::Threaded => Box::new(ThreadPipelineExecutor::new(PipelineWorker::new(pool))),
        ExecutionMode::External => Box::new(ExternalPipelineExecutor::new(
            ProcessBackend::new(settings.external.clone()),
            settings.progress.channel,
        )),
        ExecutionMode::Docker => Box::new(ExternalPipelineExecutor::new(
            DockerBackend::new(Arc::new(DockerCli::new()), settings.docker.clone()),
            settings.progress.channel,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_range() {
        assert_eq!(slice_range(4, 0, None), (0, 4));
        assert_eq!(slice_range(4, 1, Some(3)), (1, 3));
        assert_eq!(slice_range(4, 2, Some(10)), (2, 4));
        assert_eq!(slice_range(4, 5, None), (4, 4));
    }

    #[test]
    fn test_create_executor_modes() {
        let pool = WorkerPool::new(1).unwrap();
        let settings = PipelineSettings::default();
        for mode in [ExecutionMode::Threaded, ExecutionMode::External, ExecutionMode::Docker] {
            let executor = create_executor(mode, &settings, pool.clone());
            assert_eq!(executor.mode(), mode);
            assert_eq!(executor.state(), ExecutionState::Idle);
            assert!(!executor.is_running());
        }
    }
}
