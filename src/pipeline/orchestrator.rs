//! The pipeline orchestrator.
//!
//! [`Pipeline`] owns the data source tree and one executor. Structural
//! changes and execution requests are made on the owner's thread; only the
//! executor does work elsewhere. Results come back through
//! [`Pipeline::process_events`], which the owner calls from its event loop.
//!
//! # Execution
//!
//! At most one request is in flight per pipeline, whichever branch it runs.
//! Starting another one supersedes it. A branch that completes commits its
//! buffer to the staging "Output" data source of its tail operator, then
//! continues into the tail's child branch when that branch has operators.
//!
//! ```text
//! execute() ─► find first modified ─► executor.execute ─► process_events
//!                                                           │
//!                 commit Output ◄── Finished(Succeeded) ◄───┘
//!                       │
//!                       └─► child branch has operators? ─► executor.execute
//! ```

use crate::buffer::VolumeBuffer;
use crate::config::{ExecutionMode, PipelineSettings};
use crate::error::{PipelineError, Result};
use crate::executor::{
    create_executor, slice_range, ExecutionOutcome, ExecutorEvent, PipelineExecutor,
    PipelineWorker, WorkerPool,
};
use crate::operator::{Operator, OperatorEvent, OperatorState, TransformResult};
use crate::pipeline::data_source::{ChildEdge, DataSource, DataSourceTree, Persistence};
use crate::pipeline::future::ImageFuture;
use crate::pipeline::id::{DataSourceId, OperatorId, RequestId};
use crate::pipeline::notification::{Notifier, PipelineNotification};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll slice used by [`Pipeline::wait_for_idle`]
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Invoked once a cancel has been confirmed
pub type CancelCallback = Box<dyn FnOnce() + Send>;

/// What an execution request turned into
#[derive(Debug)]
pub enum Execution {
    /// Nothing to run: paused, being edited, or nothing modified
    Skipped,
    /// The result was available without running anything
    Ready(VolumeBuffer),
    /// Handed to the executor; results arrive through `process_events`
    Started(RequestId),
}

impl Execution {
    pub fn is_started(&self) -> bool {
        matches!(self, Execution::Started(_))
    }

    pub fn request(&self) -> Option<RequestId> {
        match self {
            Execution::Started(request) => Some(*request),
            _ => None,
        }
    }
}

/// The request in flight
#[derive(Debug)]
struct ActiveBranch {
    request: RequestId,
    data_source: DataSourceId,
    /// Operators the executor runs, in run order
    operators: Vec<OperatorId>,
    /// Full-tail run: commit the output and continue into the child branch
    commit: bool,
}

/// Owns a data source tree and runs its operator chains
pub struct Pipeline {
    tree: DataSourceTree,
    executor: Box<dyn PipelineExecutor>,
    settings: PipelineSettings,
    pool: Arc<WorkerPool>,
    paused: bool,
    /// Set when an operator that had run was removed; forces the next run
    operators_deleted: bool,
    editing: usize,
    active: Option<ActiveBranch>,
    cancel_callbacks: Vec<(RequestId, CancelCallback)>,
    watchers: Vec<(OperatorId, Receiver<OperatorEvent>)>,
    notifier: Notifier,
    notifications: Receiver<PipelineNotification>,
    last_result: Option<VolumeBuffer>,
}

impl Pipeline {
    /// Pipeline over `buffer`, with a worker pool sized from `settings`
    pub fn new(
        label: impl Into<String>,
        buffer: VolumeBuffer,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let pool = WorkerPool::new(settings.worker.threads)?;
        Ok(Self::with_pool(label, buffer, settings, pool))
    }

    /// Pipeline sharing an existing worker pool
    pub fn with_pool(
        label: impl Into<String>,
        buffer: VolumeBuffer,
        settings: PipelineSettings,
        pool: Arc<WorkerPool>,
    ) -> Self {
        let executor = create_executor(settings.execution_mode, &settings, pool.clone());
        let (notifier, notifications) = Notifier::new();
        Self {
            tree: DataSourceTree::new(label, buffer),
            executor,
            settings,
            pool,
            paused: false,
            operators_deleted: false,
            editing: 0,
            active: None,
            cancel_callbacks: Vec::new(),
            watchers: Vec::new(),
            notifier,
            notifications,
            last_result: None,
        }
    }

    // ==================== Accessors ====================

    /// A receiver for this pipeline's notifications
    pub fn notifications(&self) -> Receiver<PipelineNotification> {
        self.notifications.clone()
    }

    pub fn tree(&self) -> &DataSourceTree {
        &self.tree
    }

    pub fn root(&self) -> DataSourceId {
        self.tree.root()
    }

    pub fn data_source(&self, id: DataSourceId) -> Option<&DataSource> {
        self.tree.data_source(id)
    }

    pub fn operator(&self, id: OperatorId) -> Option<Arc<Operator>> {
        self.tree.operator(id).map(|node| node.op.clone())
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Buffer of the most recent completed execution
    pub fn last_result(&self) -> Option<&VolumeBuffer> {
        self.last_result.as_ref()
    }

    fn require(&self, ds: DataSourceId) -> Result<&DataSource> {
        self.tree
            .data_source(ds)
            .ok_or_else(|| PipelineError::NotFound(ds.to_string()))
    }

    fn handle(&self, id: OperatorId) -> Result<Arc<Operator>> {
        self.operator(id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    // ==================== Structure ====================

    /// Append `op` to `ds` and run what changed.
    ///
    /// The staging output of the previous tail moves onto the new operator,
    /// unless the new operator creates its own child, in which case the
    /// staging output is deleted.
    pub fn add_operator(&mut self, ds: DataSourceId, op: Arc<Operator>) -> Result<OperatorId> {
        let previous_tail = self.tree.last_operator(ds);
        let id = self.tree.push_operator(ds, op.clone())?;
        self.watchers.push((id, op.subscribe()));
        tracing::debug!(operator = %op.label(), data_source = %ds, "operator added");

        let mut output = None;
        if let Some(prev) = previous_tail {
            if let Some(ChildEdge::Staging(out)) = self.tree.child(prev) {
                self.tree.set_child(prev, None)?;
                if op.has_child_data_source() {
                    let removed = self.tree.remove_data_source(out);
                    self.data_sources_removed(removed);
                } else {
                    self.tree.set_child(id, Some(ChildEdge::Staging(out)))?;
                    self.notifier.send(PipelineNotification::DataSourceMoved {
                        data_source: out,
                        from: prev,
                        to: id,
                    });
                    output = Some(out);
                }
            }
        }
        self.notifier.send(PipelineNotification::OperatorAdded {
            operator: id,
            output,
        });

        self.execute_data_source(ds)?;
        Ok(id)
    }

    /// Remove an operator from its chain and re-run or trim the run in
    /// flight.
    pub fn remove_operator(&mut self, id: OperatorId) -> Result<Arc<Operator>> {
        let node = self.tree.remove_operator(id)?;
        let owner = node.owner;
        tracing::debug!(operator = %node.op.label(), data_source = %owner, "operator removed");

        if !node.op.is_new() {
            self.operators_deleted = true;
        }

        match node.child {
            Some(ChildEdge::Staging(out)) => {
                let new_tail = self.tree.last_operator(owner).filter(|tail| {
                    self.tree.child(*tail).is_none()
                        && self
                            .tree
                            .operator(*tail)
                            .map(|n| !n.op.has_child_data_source())
                            .unwrap_or(false)
                });
                match new_tail {
                    Some(tail) => {
                        self.tree.set_child(tail, Some(ChildEdge::Staging(out)))?;
                        self.notifier.send(PipelineNotification::DataSourceMoved {
                            data_source: out,
                            from: id,
                            to: tail,
                        });
                    }
                    None => {
                        let removed = self.tree.remove_data_source(out);
                        self.data_sources_removed(removed);
                    }
                }
            }
            Some(ChildEdge::Explicit(child)) => {
                let removed = self.tree.remove_data_source(child);
                self.data_sources_removed(removed);
            }
            None => {}
        }

        let tree = &self.tree;
        self.watchers.retain(|(w, _)| tree.operator(*w).is_some());
        self.notifier
            .send(PipelineNotification::OperatorRemoved { operator: id });

        if self.is_running() {
            if !self.executor.cancel_operator(&node.op) {
                tracing::debug!("run in flight cannot drop the operator, re-running");
                self.operators_deleted = true;
                self.execute_data_source(owner)?;
            }
        } else {
            self.execute_data_source(owner)?;
        }
        Ok(node.op)
    }

    fn data_sources_removed(&mut self, removed: Vec<DataSourceId>) {
        for ds in removed {
            self.notifier.send(PipelineNotification::DataSourceRemoved(ds));
        }
        let tree = &self.tree;
        self.watchers.retain(|(w, _)| tree.operator(*w).is_some());
    }

    // ==================== Execution ====================

    /// Run whatever is modified, searching from the root
    pub fn execute(&mut self) -> Result<Execution> {
        // The search below covers any modification already queued
        self.drain_watchers();
        self.execute_data_source(self.tree.root())
    }

    /// Run `ds`'s branch from its first modified operator.
    ///
    /// A modification found only in a child branch runs that child branch.
    pub fn execute_data_source(&mut self, ds: DataSourceId) -> Result<Execution> {
        self.require(ds)?;
        if self.being_edited(ds) {
            tracing::debug!(data_source = %ds, "branch is being edited, not executing");
            return Ok(Execution::Skipped);
        }
        if self.tree.operator_ids(ds).is_empty() {
            return Ok(Execution::Skipped);
        }
        match self.find_modified(ds) {
            Some((target, index)) => self.execute_range(target, index, None),
            None => {
                tracing::trace!(data_source = %ds, "nothing modified");
                Ok(Execution::Skipped)
            }
        }
    }

    /// Run the branch of `op`'s data source starting at `op`
    pub fn execute_from(&mut self, op: OperatorId) -> Result<Execution> {
        let owner = self
            .tree
            .operator(op)
            .map(|node| node.owner)
            .ok_or_else(|| PipelineError::NotFound(op.to_string()))?;
        let index = self.tree.index_of(op).unwrap_or(0);
        self.execute_range(owner, index, None)
    }

    /// Run only the last operator of `ds`, if its input is available
    pub fn execute_last(&mut self, ds: DataSourceId) -> Result<Execution> {
        let len = self.require(ds)?.operators.len();
        self.execute_range(ds, len.saturating_sub(1), None)
    }

    /// Run `ds`'s operators `[start, end)`; `None` runs to the tail and
    /// commits the result.
    ///
    /// Only a new tail operator resumes from the staging output; any other
    /// start re-runs the chain from its first operator. A new operator at
    /// `end` returns its input right away.
    pub fn execute_range(
        &mut self,
        ds: DataSourceId,
        start: usize,
        end: Option<usize>,
    ) -> Result<Execution> {
        self.require(ds)?;
        if self.paused {
            tracing::debug!(data_source = %ds, "pipeline paused, not executing");
            return Ok(Execution::Skipped);
        }
        self.operators_deleted = false;
        self.notifier
            .send(PipelineNotification::Started { data_source: ds });
        self.start_branch(ds, start, end)
    }

    fn start_branch(
        &mut self,
        ds: DataSourceId,
        start: usize,
        end: Option<usize>,
    ) -> Result<Execution> {
        let ids = self.tree.operator_ids(ds);
        if ids.is_empty() {
            let buffer = self.require(ds)?.buffer.clone();
            self.finish(ds, buffer.clone());
            return Ok(Execution::Ready(buffer));
        }

        if let Some(input) = end.and_then(|e| self.staged_input(&ids, e)) {
            let buffer = self.require(input)?.buffer.clone();
            tracing::debug!(data_source = %ds, "end operator is new, returning its input");
            self.finish(ds, buffer.clone());
            return Ok(Execution::Ready(buffer));
        }

        let (source, start) = self.resume_point(ds, &ids, start);
        let operators = self.tree.operators_of(ds);
        let buffer = &self
            .tree
            .data_source(source)
            .ok_or_else(|| PipelineError::NotFound(source.to_string()))?
            .buffer;
        let future = self.executor.execute(buffer, &operators, start, end);

        let (lo, hi) = slice_range(ids.len(), start, end);
        tracing::info!(
            request = %future.request,
            data_source = %ds,
            start = lo,
            operators = hi - lo,
            mode = %self.executor.mode(),
            "executing branch"
        );
        self.active = Some(ActiveBranch {
            request: future.request,
            data_source: ds,
            operators: ids[lo..hi].to_vec(),
            commit: end.is_none(),
        });
        Ok(Execution::Started(future.request))
    }

    /// Where a run starting at `start` takes its input from
    fn resume_point(&self, ds: DataSourceId, ids: &[OperatorId], start: usize) -> (DataSourceId, usize) {
        let last = ids.len() - 1;
        if start == 0 || start != last {
            return (ds, 0);
        }
        let is_new = self
            .tree
            .operator(ids[last])
            .map(|node| node.op.is_new())
            .unwrap_or(false);
        if !is_new {
            return (ds, 0);
        }

        for id in &ids[..last] {
            if let Some(node) = self.tree.operator(*id) {
                if node.op.is_canceled() {
                    // Its effect on the staging output is unknown
                    tracing::debug!(operator = %node.op.label(), "earlier operator was canceled, restarting chain");
                    node.op.reset_state();
                    return (ds, 0);
                }
            }
        }

        match self.staged_input(ids, last) {
            Some(out) => (out, last),
            None => (ds, 0),
        }
    }

    /// Staging output holding the input of `ids[index]`, when that operator
    /// has never run and everything before it is settled
    fn staged_input(&self, ids: &[OperatorId], index: usize) -> Option<DataSourceId> {
        let node = self.tree.operator(*ids.get(index)?)?;
        if !node.op.is_new() {
            return None;
        }
        let settled = ids[..index].iter().all(|id| {
            self.tree
                .operator(*id)
                .map(|n| n.op.state() == OperatorState::Complete && !n.op.is_modified())
                .unwrap_or(false)
        });
        match node.child {
            Some(ChildEdge::Staging(out)) if settled => Some(out),
            _ => None,
        }
    }

    fn being_edited(&self, ds: DataSourceId) -> bool {
        self.tree.operator_ids(ds).into_iter().any(|id| {
            let Some(node) = self.tree.operator(id) else {
                return false;
            };
            node.op.is_editing()
                || node
                    .child
                    .map(|edge| self.being_edited(edge.data_source()))
                    .unwrap_or(false)
        })
    }

    /// First modified operator at or below `ds`
    fn find_modified(&self, ds: DataSourceId) -> Option<(DataSourceId, usize)> {
        let ids = self.tree.operator_ids(ds);
        if self.operators_deleted && !ids.is_empty() {
            return Some((ds, 0));
        }
        for (index, id) in ids.iter().enumerate() {
            let node = self.tree.operator(*id)?;
            if node.op.is_modified() {
                return Some((ds, index));
            }
            if let Some(found) = node
                .child
                .and_then(|edge| self.find_modified(edge.data_source()))
            {
                return Some(found);
            }
        }
        None
    }

    fn finish(&mut self, ds: DataSourceId, buffer: VolumeBuffer) {
        self.last_result = Some(buffer);
        self.notifier
            .send(PipelineNotification::Finished { data_source: ds });
    }

    /// True while a request is in flight
    pub fn is_running(&self) -> bool {
        self.active.is_some() || self.executor.is_running()
    }

    /// Cancel the request in flight. `on_canceled` runs once the executor
    /// confirms the cancel. Returns false when nothing was running.
    pub fn cancel(&mut self, on_canceled: Option<CancelCallback>) -> bool {
        let Some(branch) = &self.active else {
            return false;
        };
        let request = branch.request;
        tracing::info!(%request, "canceling pipeline execution");
        if let Some(callback) = on_canceled {
            self.cancel_callbacks.push((request, callback));
        }
        self.executor.cancel();
        true
    }

    fn run_cancel_callbacks(&mut self, request: RequestId) {
        let (confirmed, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.cancel_callbacks)
            .into_iter()
            .partition(|(r, _)| *r == request);
        self.cancel_callbacks = waiting;
        for (_, callback) in confirmed {
            callback();
        }
    }

    fn drop_cancel_callbacks(&mut self, request: RequestId) {
        self.cancel_callbacks.retain(|(r, _)| *r != request);
    }

    // ==================== Pause / edit ====================

    /// Hold back execution; changes are still recorded
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Allow execution again and run whatever changed while paused
    pub fn resume(&mut self) -> Result<Execution> {
        self.paused = false;
        if self.is_running() {
            return Ok(Execution::Skipped);
        }
        self.execute()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// An operator's parameters are being edited; its branch is held back
    pub fn started_editing(&mut self, op: OperatorId) -> Result<()> {
        self.handle(op)?.set_editing();
        self.editing += 1;
        Ok(())
    }

    /// Editing ended. Once no edit is left and nothing is running, the
    /// operator's branch runs.
    pub fn finished_editing(&mut self, op: OperatorId) -> Result<Execution> {
        let handle = self.handle(op)?;
        if handle.is_modified() {
            handle.reset_state();
        } else {
            handle.set_complete();
        }

        if self.editing == 0 {
            return Ok(Execution::Skipped);
        }
        self.editing -= 1;
        if self.editing > 0 || self.is_running() {
            return Ok(Execution::Skipped);
        }

        // Modifications made during the edit are covered by this run
        self.drain_watchers();
        let owner = self
            .tree
            .operator(op)
            .map(|node| node.owner)
            .ok_or_else(|| PipelineError::NotFound(op.to_string()))?;
        self.execute_data_source(owner)
    }

    // ==================== Data ====================

    /// Data source holding the transformed data of `ds`'s branch
    pub fn transformed_data_source(&self, ds: DataSourceId) -> DataSourceId {
        self.tree.transformed_data_source(ds)
    }

    /// A copy of the data as it is just before `op` runs.
    ///
    /// The first operator gets its data source's data. Otherwise the
    /// operators before `op` are replayed on copies, unless `op` has never
    /// run and its input is already staged.
    pub fn copy_of_image_prior_to(&self, op: OperatorId) -> Result<ImageFuture> {
        let owner = self
            .tree
            .operator(op)
            .map(|node| node.owner)
            .ok_or_else(|| PipelineError::NotFound(op.to_string()))?;
        let index = self.tree.index_of(op).unwrap_or(0);
        let input = &self.require(owner)?.buffer;
        if index == 0 {
            return Ok(ImageFuture::ready(input.clone()));
        }

        let ids = self.tree.operator_ids(owner);
        if let Some(staged) = self.staged_input(&ids, index) {
            return Ok(ImageFuture::ready(self.require(staged)?.buffer.clone()));
        }

        let copies: Vec<Arc<Operator>> = ids[..index]
            .iter()
            .filter_map(|id| self.tree.operator(*id))
            .map(|node| node.op.clone_operator())
            .collect();
        let worker = PipelineWorker::new(self.pool.clone());
        Ok(ImageFuture::pending(worker.run(input.clone(), copies)))
    }

    /// Set the voxel spacing of `ds`.
    ///
    /// Root spacing flows into transient outputs the user has not set a
    /// spacing on.
    pub fn set_spacing(&mut self, ds: DataSourceId, spacing: [f64; 3]) -> Result<()> {
        let root = self.tree.root();
        let target = self
            .tree
            .data_source_mut(ds)
            .ok_or_else(|| PipelineError::NotFound(ds.to_string()))?;
        target.buffer.set_spacing(spacing);
        if ds != root {
            target.spacing_modified = true;
        }
        self.notifier.send(PipelineNotification::DataSourceUpdated(ds));

        if ds == root {
            for id in self.tree.data_source_ids() {
                if id == root {
                    continue;
                }
                if let Some(output) = self.tree.data_source_mut(id) {
                    if output.persistence == Persistence::Transient && !output.spacing_modified {
                        output.buffer.set_spacing(spacing);
                        self.notifier
                            .send(PipelineNotification::DataSourceUpdated(id));
                    }
                }
            }
        }
        Ok(())
    }

    // ==================== Executor ====================

    pub fn execution_mode(&self) -> ExecutionMode {
        self.executor.mode()
    }

    /// Switch executors, abandoning the request in flight
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.settings.execution_mode = mode;
        let executor = create_executor(mode, &self.settings, self.pool.clone());
        self.set_executor(executor);
    }

    /// Replace the settings and rebuild the executor from them
    pub fn set_settings(&mut self, settings: PipelineSettings) {
        self.settings = settings;
        let executor = create_executor(self.settings.execution_mode, &self.settings, self.pool.clone());
        self.set_executor(executor);
    }

    /// Install a specific executor, abandoning the request in flight
    pub fn set_executor(&mut self, executor: Box<dyn PipelineExecutor>) {
        if let Some(branch) = self.active.take() {
            tracing::info!(request = %branch.request, "executor replaced, canceling request in flight");
            self.executor.cancel();
            self.notifier.send(PipelineNotification::Canceled {
                data_source: branch.data_source,
            });
        }
        // The old executor tears its request down when dropped
        for (_, callback) in std::mem::take(&mut self.cancel_callbacks) {
            callback();
        }
        tracing::debug!(mode = %executor.mode(), "executor installed");
        self.executor = executor;
    }

    // ==================== Events ====================

    /// Handle operator modifications and executor events. Waits up to
    /// `timeout` for the executor. Returns true when anything happened.
    pub fn process_events(&mut self, timeout: Duration) -> bool {
        let modified = self.drain_watchers();
        if modified {
            tracing::debug!("operator modified, re-executing from the root");
            if let Err(e) = self.execute_data_source(self.tree.root()) {
                tracing::error!("failed to re-execute pipeline: {}", e);
            }
        }

        let events = self
            .executor
            .poll(if modified { Duration::ZERO } else { timeout });
        let any = modified || !events.is_empty();
        for event in events {
            self.handle_event(event);
        }
        any
    }

    /// Process events until nothing is in flight. False on timeout.
    pub fn wait_for_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events(IDLE_POLL);
            if !self.is_running() && self.cancel_callbacks.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// True when a watched operator reported a configuration change
    fn drain_watchers(&mut self) -> bool {
        let mut modified = false;
        for (_, rx) in &self.watchers {
            for event in rx.try_iter() {
                if event == OperatorEvent::TransformModified {
                    modified = true;
                }
            }
        }
        modified
    }

    fn active_operator(&self, index: usize) -> Option<OperatorId> {
        self.active.as_ref()?.operators.get(index).copied()
    }

    fn handle_event(&mut self, event: ExecutorEvent) {
        let request = event.request();
        let current = self
            .active
            .as_ref()
            .map(|branch| branch.request == request)
            .unwrap_or(false);

        if !current {
            if let ExecutorEvent::Finished { outcome, .. } = &event {
                match outcome {
                    ExecutionOutcome::Canceled => self.run_cancel_callbacks(request),
                    _ => self.drop_cancel_callbacks(request),
                }
            }
            tracing::trace!(%request, "event of a superseded request");
            return;
        }

        match event {
            ExecutorEvent::OperatorStarted { index, .. } => {
                if let Some(operator) = self.active_operator(index) {
                    self.notifier
                        .send(PipelineNotification::OperatorStarted { operator });
                }
            }
            ExecutorEvent::OperatorFinished { index, result, .. } => {
                if let Some(operator) = self.active_operator(index) {
                    if result == TransformResult::Error {
                        if let Some(op) = self.operator(operator) {
                            tracing::warn!(
                                operator = %op.label(),
                                error = ?op.last_error(),
                                "operator failed"
                            );
                        }
                    }
                    self.notifier
                        .send(PipelineNotification::OperatorFinished { operator, result });
                }
            }
            ExecutorEvent::ChildDataSource {
                index,
                label,
                buffer,
                ..
            } => {
                if let Some(operator) = self.active_operator(index) {
                    self.explicit_child(operator, label, buffer);
                }
            }
            ExecutorEvent::Finished { outcome, .. } => {
                let Some(branch) = self.active.take() else {
                    return;
                };
                match outcome {
                    ExecutionOutcome::Succeeded(buffer) => {
                        self.drop_cancel_callbacks(request);
                        self.branch_finished(branch, buffer);
                    }
                    ExecutionOutcome::Failed(failure) => {
                        self.drop_cancel_callbacks(request);
                        self.notifier.error(failure.title(), failure.to_string());
                    }
                    ExecutionOutcome::Canceled => {
                        tracing::info!(%request, "pipeline execution canceled");
                        self.run_cancel_callbacks(request);
                        self.notifier.send(PipelineNotification::Canceled {
                            data_source: branch.data_source,
                        });
                    }
                }
            }
        }
    }

    /// Create or update the explicit child of `operator`
    fn explicit_child(&mut self, operator: OperatorId, label: String, buffer: VolumeBuffer) {
        match self.tree.child(operator) {
            Some(ChildEdge::Explicit(child)) => {
                if let Some(ds) = self.tree.data_source_mut(child) {
                    ds.set_data(buffer);
                }
                self.notifier
                    .send(PipelineNotification::DataSourceUpdated(child));
            }
            other => {
                if let Some(ChildEdge::Staging(out)) = other {
                    let removed = self.tree.remove_data_source(out);
                    self.data_sources_removed(removed);
                }
                let child = self.tree.add_data_source(label, buffer, Some(operator));
                if let Err(e) = self.tree.set_child(operator, Some(ChildEdge::Explicit(child))) {
                    tracing::error!("failed to attach child data source: {}", e);
                    return;
                }
                tracing::debug!(operator = %operator, data_source = %child, "child data source created");
                self.notifier
                    .send(PipelineNotification::ChildDataSourceCreated {
                        operator,
                        data_source: child,
                    });
            }
        }
    }

    /// Commit a completed branch and continue into its child branch
    fn branch_finished(&mut self, branch: ActiveBranch, buffer: VolumeBuffer) {
        let ds = branch.data_source;
        if !branch.commit {
            self.finish(ds, buffer);
            return;
        }
        let Some(tail) = self.tree.last_operator(ds) else {
            self.finish(ds, buffer);
            return;
        };
        let Some(node) = self.tree.operator(tail).cloned() else {
            self.finish(ds, buffer);
            return;
        };

        // An operator with its own child already published its data
        if !node.op.has_child_data_source() {
            let existing = match node.child {
                Some(ChildEdge::Staging(out)) => Some(out),
                _ => None,
            };
            self.commit_output(tail, existing, buffer.clone());
        }

        let next = self
            .tree
            .child(tail)
            .map(|edge| edge.data_source())
            .filter(|child| !self.tree.operator_ids(*child).is_empty());
        match next {
            Some(child) => {
                tracing::debug!(data_source = %child, "continuing into child branch");
                if let Err(e) = self.start_branch(child, 0, None) {
                    tracing::error!("failed to execute child branch: {}", e);
                }
            }
            None => {
                tracing::info!(data_source = %ds, "pipeline execution finished");
                self.finish(ds, buffer);
            }
        }
    }

    fn commit_output(&mut self, tail: OperatorId, existing: Option<DataSourceId>, mut buffer: VolumeBuffer) {
        match existing {
            Some(out) => {
                if let Some(ds) = self.tree.data_source_mut(out) {
                    if ds.spacing_modified {
                        buffer.set_spacing(ds.buffer.spacing());
                    }
                    ds.set_data(buffer);
                }
                self.notifier
                    .send(PipelineNotification::DataSourceUpdated(out));
            }
            None => {
                if let Some(root) = self.tree.data_source(self.tree.root()) {
                    buffer.set_spacing(root.buffer.spacing());
                }
                let out = self.tree.add_data_source("Output", buffer, Some(tail));
                if let Some(ds) = self.tree.data_source_mut(out) {
                    ds.persistence = Persistence::Transient;
                    ds.forkable = false;
                }
                if let Err(e) = self.tree.set_child(tail, Some(ChildEdge::Staging(out))) {
                    tracing::error!("failed to attach output data source: {}", e);
                    return;
                }
                tracing::debug!(operator = %tail, data_source = %out, "output data source created");
                self.notifier
                    .send(PipelineNotification::ChildDataSourceCreated {
                        operator: tail,
                        data_source: out,
                    });
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("data_sources", &self.tree.len())
            .field("mode", &self.executor.mode())
            .field("paused", &self.paused)
            .field("active", &self.active)
            .finish()
    }
}
