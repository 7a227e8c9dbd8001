//! Sequential operator runs on a shared thread pool
//!
//! A [`PipelineWorker`] takes a buffer and an ordered list of operators and
//! runs them one at a time on the [`WorkerPool`]. Each operator is its own
//! pool task; when a task completes it schedules the next one, so a long
//! chain never stacks calls.
//!
//! The caller gets a [`WorkerFuture`]. Its event channel carries per
//! operator notifications and exactly one terminal event: `Finished(bool)`
//! or `Canceled`.

use crate::buffer::VolumeBuffer;
use crate::error::{ExecutionFailure, PipelineError, Result};
use crate::operator::{ChildRequest, Operator, TransformResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Shared pool that operator tasks run on
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl WorkerPool {
    /// Half the hardware threads, at least one
    pub fn default_thread_count() -> usize {
        (num_cpus::get() / 2).max(1)
    }

    /// Build a pool; `threads == 0` selects [`Self::default_thread_count`]
    pub fn new(threads: usize) -> Result<Arc<Self>> {
        let threads = if threads == 0 {
            Self::default_thread_count()
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tomopipe-worker-{}", i))
            .build()
            .map_err(|e| PipelineError::Launch(format!("failed to build worker pool: {}", e)))?;
        tracing::debug!("Worker pool started with {} threads", threads);
        Ok(Arc::new(Self { pool, threads }))
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(task);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .finish()
    }
}

/// Notifications from a run. `index` is the position in the run's
/// operator list.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    OperatorStarted {
        index: usize,
    },
    OperatorDone {
        index: usize,
        result: TransformResult,
    },
    ChildRequested {
        index: usize,
        label: String,
        buffer: VolumeBuffer,
    },
    /// Terminal: the run completed (`true`) or an operator failed (`false`)
    Finished(bool),
    /// Terminal: the run was canceled
    Canceled,
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Finished(_) | WorkerEvent::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Canceled,
    Complete,
}

/// A queued or running operator task
struct RunnableOperator {
    index: usize,
    op: Arc<Operator>,
    /// Set when the task is pulled from the pool before it gets to run
    dropped: Arc<AtomicBool>,
}

struct RunInner {
    state: RunState,
    queue: VecDeque<RunnableOperator>,
    running: Option<RunnableOperator>,
    /// Held here between tasks, moved into the running task otherwise
    buffer: Option<VolumeBuffer>,
    terminal_sent: bool,
    failure: Option<ExecutionFailure>,
    next_index: usize,
}

struct Run {
    operators: Vec<Arc<Operator>>,
    /// Seen by every transform of this run, independent of operator state
    canceled: AtomicBool,
    inner: Mutex<RunInner>,
    events: Sender<WorkerEvent>,
    pool: Arc<WorkerPool>,
}

impl Run {
    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: WorkerEvent) {
        // A dropped future just means nobody is listening any more
        let _ = self.events.send(event);
    }

    /// Send the terminal event unless one was already sent
    fn emit_terminal(&self, inner: &mut RunInner, event: WorkerEvent) {
        if !inner.terminal_sent {
            inner.terminal_sent = true;
            self.emit(event);
        }
    }

    fn start_next_operator(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.state != RunState::Running || inner.running.is_some() {
            return;
        }
        let Some(next) = inner.queue.pop_front() else {
            return;
        };
        let Some(mut buffer) = inner.buffer.take() else {
            tracing::error!("worker run lost its buffer");
            inner.state = RunState::Complete;
            self.emit_terminal(&mut inner, WorkerEvent::Finished(false));
            return;
        };

        let index = next.index;
        let op = next.op.clone();
        let dropped = next.dropped.clone();
        inner.running = Some(next);
        drop(inner);

        let run = Arc::clone(self);
        self.pool.spawn(move || {
            if dropped.load(Ordering::SeqCst) {
                run.operator_complete(index, TransformResult::Canceled, buffer);
                return;
            }
            run.emit(WorkerEvent::OperatorStarted { index });
            let events = run.events.clone();
            let sink = move |request: ChildRequest| {
                let _ = events.send(WorkerEvent::ChildRequested {
                    index,
                    label: request.label,
                    buffer: request.buffer,
                });
            };
            let result = op.transform_in_run(&mut buffer, Some(&sink), Some(&run.canceled));
            run.emit(WorkerEvent::OperatorDone { index, result });
            run.operator_complete(index, result, buffer);
        });
    }

    fn operator_complete(self: &Arc<Self>, index: usize, result: TransformResult, buffer: VolumeBuffer) {
        let mut inner = self.lock();
        let finished = inner.running.take();
        let op_canceled = finished
            .as_ref()
            .map(|r| r.op.is_canceled())
            .unwrap_or(false);
        inner.buffer = Some(buffer);

        if inner.state == RunState::Canceled || op_canceled || result == TransformResult::Canceled {
            inner.state = RunState::Canceled;
            tracing::debug!(index, "worker run canceled");
            self.emit_terminal(&mut inner, WorkerEvent::Canceled);
        } else if result == TransformResult::Error {
            inner.state = RunState::Complete;
            let (label, message) = finished
                .map(|r| (r.op.label(), r.op.last_error()))
                .unwrap_or_default();
            let failure = ExecutionFailure::Operator {
                index,
                label,
                message: message.unwrap_or_else(|| "operator failed".to_string()),
            };
            tracing::warn!(index, "worker run failed: {}", failure);
            inner.failure = Some(failure);
            self.emit_terminal(&mut inner, WorkerEvent::Finished(false));
        } else if !inner.queue.is_empty() {
            drop(inner);
            self.start_next_operator();
        } else {
            inner.state = RunState::Complete;
            self.emit_terminal(&mut inner, WorkerEvent::Finished(true));
        }
    }

    fn cancel(&self) {
        let mut inner = self.lock();
        match inner.state {
            RunState::Canceled | RunState::Complete => return,
            RunState::Created | RunState::Running => {}
        }
        inner.state = RunState::Canceled;
        self.canceled.store(true, Ordering::SeqCst);
        inner.queue.clear();
        match &inner.running {
            Some(running) => {
                running.dropped.store(true, Ordering::SeqCst);
                running.op.cancel_transform();
            }
            None => self.emit_terminal(&mut inner, WorkerEvent::Canceled),
        }
    }

    fn cancel_operator(&self, op: &Arc<Operator>) -> bool {
        let mut inner = self.lock();
        let is_running = inner
            .running
            .as_ref()
            .map(|r| Arc::ptr_eq(&r.op, op))
            .unwrap_or(false);
        if is_running {
            drop(inner);
            self.cancel();
            return false;
        }

        let before = inner.queue.len();
        inner.queue.retain(|r| !Arc::ptr_eq(&r.op, op));
        inner.queue.len() != before
    }

    fn add_operator(&self, op: Arc<Operator>) -> bool {
        let mut inner = self.lock();
        if inner.state != RunState::Running {
            return false;
        }
        op.reset_state();
        let index = inner.next_index;
        inner.next_index += 1;
        inner.queue.push_back(RunnableOperator {
            index,
            op,
            dropped: Arc::new(AtomicBool::new(false)),
        });
        true
    }
}

/// Runs operator chains on a [`WorkerPool`]
#[derive(Clone, Debug)]
pub struct PipelineWorker {
    pool: Arc<WorkerPool>,
}

impl PipelineWorker {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run `operators` against `buffer`, in order.
    ///
    /// Every operator is reset to `Queued` first. A cancel of an earlier run
    /// still reaches that run's transforms through the run's own flag. Two
    /// runs sharing operators should not overlap; the threaded executor
    /// waits for a superseded run to settle before starting the next one.
    /// An empty list finishes
    /// successfully right away with the buffer unchanged.
    pub fn run(&self, buffer: VolumeBuffer, operators: Vec<Arc<Operator>>) -> WorkerFuture {
        for op in &operators {
            op.reset_state();
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = operators
            .iter()
            .enumerate()
            .map(|(index, op)| RunnableOperator {
                index,
                op: op.clone(),
                dropped: Arc::new(AtomicBool::new(false)),
            })
            .collect();

        let next_index = operators.len();
        let run = Arc::new(Run {
            operators,
            canceled: AtomicBool::new(false),
            inner: Mutex::new(RunInner {
                state: RunState::Created,
                queue,
                running: None,
                buffer: Some(buffer),
                terminal_sent: false,
                failure: None,
                next_index,
            }),
            events: tx,
            pool: self.pool.clone(),
        });

        {
            let mut inner = run.lock();
            if inner.queue.is_empty() {
                inner.state = RunState::Complete;
                run.emit_terminal(&mut inner, WorkerEvent::Finished(true));
            } else {
                inner.state = RunState::Running;
            }
        }

        let starter = Arc::clone(&run);
        self.pool.spawn(move || starter.start_next_operator());

        WorkerFuture { run, events: rx }
    }
}

/// Caller side of a worker run
pub struct WorkerFuture {
    run: Arc<Run>,
    events: Receiver<WorkerEvent>,
}

impl WorkerFuture {
    /// Event stream of this run
    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Cancel the whole run
    pub fn cancel(&self) {
        self.run.cancel();
    }

    /// Cancel a single operator.
    ///
    /// Removing a queued operator returns true and leaves the rest of the
    /// run alone. Canceling the running operator cancels the whole run and
    /// returns false.
    pub fn cancel_operator(&self, op: &Arc<Operator>) -> bool {
        self.run.cancel_operator(op)
    }

    /// Append an operator to a run that is still in progress
    pub fn add_operator(&self, op: Arc<Operator>) -> bool {
        self.run.add_operator(op)
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().state == RunState::Running
    }

    /// The operators the run was started with
    pub fn operators(&self) -> &[Arc<Operator>] {
        &self.run.operators
    }

    /// The transformed buffer, once the run completed successfully
    pub fn take_result(&self) -> Option<VolumeBuffer> {
        let mut inner = self.run.lock();
        match inner.state {
            RunState::Complete if inner.failure.is_none() => inner.buffer.take(),
            _ => None,
        }
    }

    /// Why the run failed, if it did
    pub fn failure(&self) -> Option<ExecutionFailure> {
        self.run.lock().failure.clone()
    }

    /// Block until the terminal event arrives, discarding the others.
    ///
    /// Returns `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<WorkerEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if event.is_terminal() => return Some(event),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkerFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerFuture")
            .field("operators", &self.run.operators.len())
            .field("running", &self.is_running())
            .finish()
    }
}
