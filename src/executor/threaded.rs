//! In-process executor over [`PipelineWorker`]

use super::worker::{PipelineWorker, WorkerEvent, WorkerFuture};
use super::{
    slice_range, ExecutionFuture, ExecutionOutcome, ExecutionState, ExecutorEvent,
    PipelineExecutor,
};
use crate::buffer::VolumeBuffer;
use crate::config::ExecutionMode;
use crate::error::ExecutionFailure;
use crate::operator::Operator;
use crate::pipeline::id::RequestId;
use crossbeam_channel::RecvTimeoutError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A request waiting for superseded runs to let go of its operators
struct Deferred {
    request: RequestId,
    buffer: VolumeBuffer,
    operators: Vec<Arc<Operator>>,
}

/// Runs operators on the shared worker pool.
///
/// A new request never overlaps a canceled one: it is held back until
/// every superseded run has delivered its terminal event, so the same
/// operator is never transformed by two runs at once.
pub struct ThreadPipelineExecutor {
    worker: PipelineWorker,
    current: Option<(RequestId, WorkerFuture)>,
    /// Canceled requests whose confirmation has not arrived yet
    superseded: Vec<(RequestId, WorkerFuture)>,
    deferred: Option<Deferred>,
    pending: VecDeque<ExecutorEvent>,
    last_request: RequestId,
    state: ExecutionState,
}

impl ThreadPipelineExecutor {
    pub fn new(worker: PipelineWorker) -> Self {
        Self {
            worker,
            current: None,
            superseded: Vec::new(),
            deferred: None,
            pending: VecDeque::new(),
            last_request: RequestId(0),
            state: ExecutionState::Idle,
        }
    }

    /// Translate one worker event; returns true for terminal events
    fn translate(
        request: RequestId,
        future: &WorkerFuture,
        event: WorkerEvent,
        out: &mut Vec<ExecutorEvent>,
    ) -> bool {
        match event {
            WorkerEvent::OperatorStarted { index } => {
                out.push(ExecutorEvent::OperatorStarted { request, index });
                false
            }
            WorkerEvent::OperatorDone { index, result } => {
                out.push(ExecutorEvent::OperatorFinished {
                    request,
                    index,
                    result,
                });
                false
            }
            WorkerEvent::ChildRequested {
                index,
                label,
                buffer,
            } => {
                out.push(ExecutorEvent::ChildDataSource {
                    request,
                    index,
                    label,
                    buffer,
                });
                false
            }
            WorkerEvent::Finished(true) => {
                let outcome = match future.take_result() {
                    Some(buffer) => ExecutionOutcome::Succeeded(buffer),
                    None => ExecutionOutcome::Failed(ExecutionFailure::Setup {
                        message: "worker finished without a result".to_string(),
                    }),
                };
                out.push(ExecutorEvent::Finished { request, outcome });
                true
            }
            WorkerEvent::Finished(false) => {
                let failure = future.failure().unwrap_or(ExecutionFailure::Setup {
                    message: "operator failed".to_string(),
                });
                out.push(ExecutorEvent::Finished {
                    request,
                    outcome: ExecutionOutcome::Failed(failure),
                });
                true
            }
            WorkerEvent::Canceled => {
                out.push(ExecutorEvent::Finished {
                    request,
                    outcome: ExecutionOutcome::Canceled,
                });
                true
            }
        }
    }

    fn drain_superseded(&mut self, out: &mut Vec<ExecutorEvent>) {
        self.superseded.retain(|(request, future)| {
            while let Ok(event) = future.events().try_recv() {
                if event.is_terminal() {
                    let mut terminal = Vec::new();
                    Self::translate(*request, future, event, &mut terminal);
                    // Superseded requests only ever report cancellation
                    out.extend(terminal.into_iter().map(|e| match e {
                        ExecutorEvent::Finished { request, .. } => ExecutorEvent::Finished {
                            request,
                            outcome: ExecutionOutcome::Canceled,
                        },
                        other => other,
                    }));
                    return false;
                }
            }
            true
        });
    }

    /// Start the held back request once nothing superseded is left
    fn start_deferred(&mut self) {
        if !self.superseded.is_empty() {
            return;
        }
        let Some(deferred) = self.deferred.take() else {
            return;
        };
        tracing::debug!(request = %deferred.request, "superseded runs settled, starting request");
        let future = self.worker.run(deferred.buffer, deferred.operators);
        self.current = Some((deferred.request, future));
        self.state = ExecutionState::Running;
    }

    fn settle(&mut self, out: &[ExecutorEvent]) {
        if let Some((request, _)) = &self.current {
            let request = *request;
            for event in out {
                if let ExecutorEvent::Finished {
                    request: finished,
                    outcome,
                } = event
                {
                    if *finished == request {
                        self.state = outcome.state();
                        self.current = None;
                        break;
                    }
                }
            }
        }
    }
}

impl PipelineExecutor for ThreadPipelineExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Threaded
    }

    fn execute(
        &mut self,
        buffer: &VolumeBuffer,
        operators: &[Arc<Operator>],
        start: usize,
        end: Option<usize>,
    ) -> ExecutionFuture {
        let (start, end) = slice_range(operators.len(), start, end);
        let operators = operators[start..end].to_vec();

        // Its terminal event is still undelivered, even when it already
        // finished or was canceled
        if let Some((request, future)) = self.current.take() {
            tracing::debug!(%request, "superseding request");
            future.cancel();
            self.superseded.push((request, future));
        }
        if let Some(deferred) = self.deferred.take() {
            tracing::debug!(request = %deferred.request, "superseding held back request");
            self.pending.push_back(ExecutorEvent::Finished {
                request: deferred.request,
                outcome: ExecutionOutcome::Canceled,
            });
        }

        self.last_request = self.last_request.next();
        let request = self.last_request;

        if operators.is_empty() {
            self.pending.push_back(ExecutorEvent::Finished {
                request,
                outcome: ExecutionOutcome::Succeeded(buffer.clone()),
            });
            self.state = ExecutionState::Succeeded;
            return ExecutionFuture {
                request,
                operators,
            };
        }

        tracing::debug!(%request, operators = operators.len(), "starting threaded run");
        self.deferred = Some(Deferred {
            request,
            buffer: buffer.clone(),
            operators: operators.clone(),
        });
        self.state = ExecutionState::Running;
        self.start_deferred();

        ExecutionFuture {
            request,
            operators,
        }
    }

    fn cancel(&mut self) {
        if let Some((request, future)) = &self.current {
            tracing::debug!(%request, "canceling threaded run");
            future.cancel();
        }
        if let Some(deferred) = self.deferred.take() {
            tracing::debug!(request = %deferred.request, "canceling held back request");
            self.pending.push_back(ExecutorEvent::Finished {
                request: deferred.request,
                outcome: ExecutionOutcome::Canceled,
            });
            self.state = ExecutionState::Canceled;
        }
    }

    fn cancel_operator(&mut self, op: &Arc<Operator>) -> bool {
        match &self.current {
            Some((_, future)) if future.is_running() => future.cancel_operator(op),
            _ => false,
        }
    }

    fn is_running(&self) -> bool {
        self.deferred.is_some()
            || self
                .current
                .as_ref()
                .map(|(_, future)| future.is_running())
                .unwrap_or(false)
    }

    fn state(&self) -> ExecutionState {
        self.state
    }

    fn poll(&mut self, timeout: Duration) -> Vec<ExecutorEvent> {
        let mut out: Vec<ExecutorEvent> = self.pending.drain(..).collect();
        self.drain_superseded(&mut out);
        self.start_deferred();

        if let Some((request, future)) = &self.current {
            let request = *request;
            if out.is_empty() {
                match future.events().recv_timeout(timeout) {
                    Ok(event) => {
                        Self::translate(request, future, event, &mut out);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        tracing::warn!(%request, "worker channel closed");
                    }
                }
            }
            while let Ok(event) = future.events().try_recv() {
                if Self::translate(request, future, event, &mut out) {
                    break;
                }
            }
        } else if out.is_empty() && !self.superseded.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            self.drain_superseded(&mut out);
            self.start_deferred();
        }

        self.settle(&out);
        out
    }
}
