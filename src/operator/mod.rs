//! Operators: units of work applied to a volume
//!
//! An [`Operator`] wraps a [`Transform`] (the `apply` hook that does the
//! actual work) with everything the engine tracks around it: lifecycle
//! state, progress counters, result slots, and the modified/new flags used
//! to decide what needs re-running.
//!
//! Operators are shared as `Arc<Operator>` between the pipeline that owns
//! them and the worker thread that runs them. All mutable state is behind
//! atomics or short-lived locks so the UI side can read progress while a
//! transform is running.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. [`Operator::cancel_transform`] only flips the
//! state to `Canceled`; a transform observes it through
//! [`TransformContext::is_canceled`]. A transform that never polls the flag
//! runs to completion, its result is then reported as `Canceled`.

pub mod builtin;
pub mod factory;
pub mod script;

pub use builtin::{Fork, Invert, Linear, Threshold};
pub use factory::{OperatorConfig, OperatorFactory};
pub use script::ScriptTransform;

use crate::buffer::VolumeBuffer;
use crate::error::Result;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Lifecycle state of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperatorState {
    Queued = 0,
    Running = 1,
    Complete = 2,
    Canceled = 3,
    Error = 4,
    /// Parameters are being edited; execution of the branch is held back
    Edit = 5,
}

impl OperatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => OperatorState::Running,
            2 => OperatorState::Complete,
            3 => OperatorState::Canceled,
            4 => OperatorState::Error,
            5 => OperatorState::Edit,
            _ => OperatorState::Queued,
        }
    }
}

/// Outcome of a single transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformResult {
    Complete,
    Canceled,
    Error,
}

impl From<TransformResult> for OperatorState {
    fn from(result: TransformResult) -> Self {
        match result {
            TransformResult::Complete => OperatorState::Complete,
            TransformResult::Canceled => OperatorState::Canceled,
            TransformResult::Error => OperatorState::Error,
        }
    }
}

/// Notifications published by an operator to its subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorEvent {
    TransformingStarted,
    TransformingDone(TransformResult),
    TransformCanceled,
    TransformModified,
    TotalProgressStepsChanged(u64),
    ProgressStepChanged(u64),
    ProgressMessageChanged(String),
}

/// A request, made from inside a running transform, for a new child data
/// source. The worker forwards it to the orchestrating side, which is the
/// only place data sources are created.
#[derive(Debug, Clone)]
pub struct ChildRequest {
    pub label: String,
    pub buffer: VolumeBuffer,
}

/// The work an operator performs.
///
/// `apply` mutates the buffer in place and returns `Ok(true)` on success.
/// `Ok(false)` and `Err(_)` both mark the operator as failed.
pub trait Transform: Send + Sync {
    /// Display label
    fn label(&self) -> String;

    /// Icon resource name, used by front ends
    fn icon(&self) -> &str {
        ""
    }

    fn apply(&self, buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool>;

    /// True when the operator produces an explicit child data source
    fn has_child_data_source(&self) -> bool {
        false
    }

    /// True when `apply` polls the cancellation flag
    fn supports_cancel(&self) -> bool {
        false
    }

    /// True when the operator is happiest with C ordered arrays
    fn prefers_c_ordering(&self) -> bool {
        false
    }

    /// Names of the result slots this operator fills
    fn result_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Serialized configuration, as understood by [`OperatorFactory`]
    fn config(&self) -> serde_json::Value;
}

/// Progress counters of an operator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub total_steps: u64,
    pub step: u64,
    pub message: String,
}

/// A result slot
#[derive(Debug, Clone, Default)]
pub struct OperatorResult {
    pub name: String,
    pub data: Option<VolumeBuffer>,
}

static NEXT_OPERATOR_UID: AtomicU64 = AtomicU64::new(1);

/// Runtime handle around a [`Transform`]
pub struct Operator {
    uid: u64,
    transform: RwLock<Arc<dyn Transform>>,
    state: AtomicU8,
    modified: AtomicBool,
    new: AtomicBool,
    progress: Mutex<Progress>,
    results: Mutex<Vec<OperatorResult>>,
    last_error: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<OperatorEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Operator {
    /// Wrap a transform. New operators are both new and modified.
    pub fn new(transform: impl Transform + 'static) -> Arc<Self> {
        Self::from_shared(Arc::new(transform))
    }

    pub fn from_shared(transform: Arc<dyn Transform>) -> Arc<Self> {
        let results = transform
            .result_names()
            .into_iter()
            .map(|name| OperatorResult { name, data: None })
            .collect();
        Arc::new(Self {
            uid: NEXT_OPERATOR_UID.fetch_add(1, Ordering::Relaxed),
            transform: RwLock::new(transform),
            state: AtomicU8::new(OperatorState::Queued as u8),
            modified: AtomicBool::new(true),
            new: AtomicBool::new(true),
            progress: Mutex::new(Progress::default()),
            results: Mutex::new(results),
            last_error: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Process-unique identifier, used in logs
    pub fn uid(&self) -> u64 {
        self.uid
    }

    fn current_transform(&self) -> Arc<dyn Transform> {
        match self.transform.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn label(&self) -> String {
        self.current_transform().label()
    }

    pub fn icon(&self) -> String {
        self.current_transform().icon().to_string()
    }

    pub fn has_child_data_source(&self) -> bool {
        self.current_transform().has_child_data_source()
    }

    pub fn supports_cancel(&self) -> bool {
        self.current_transform().supports_cancel()
    }

    pub fn prefers_c_ordering(&self) -> bool {
        self.current_transform().prefers_c_ordering()
    }

    /// Serialized configuration of the wrapped transform
    pub fn serialize(&self) -> serde_json::Value {
        self.current_transform().config()
    }

    /// Independent copy with the same configuration and a reset state
    pub fn clone_operator(&self) -> Arc<Operator> {
        Operator::from_shared(self.current_transform())
    }

    /// Replace the configuration, as after a parameter edit
    pub fn reconfigure(&self, transform: impl Transform + 'static) {
        match self.transform.write() {
            Ok(mut guard) => *guard = Arc::new(transform),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(transform),
        }
        self.transform_modified();
    }

    /// Mark the configuration as changed
    pub fn transform_modified(&self) {
        self.modified.store(true, Ordering::SeqCst);
        self.notify(OperatorEvent::TransformModified);
    }

    // ==================== State ====================

    pub fn state(&self) -> OperatorState {
        OperatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: OperatorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn reset_state(&self) {
        self.set_state(OperatorState::Queued);
    }

    pub fn set_editing(&self) {
        self.set_state(OperatorState::Edit);
    }

    pub fn set_complete(&self) {
        self.set_state(OperatorState::Complete);
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == OperatorState::Canceled
    }

    pub fn is_editing(&self) -> bool {
        self.state() == OperatorState::Edit
    }

    /// Complete or Error
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), OperatorState::Complete | OperatorState::Error)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    pub fn set_modified(&self) {
        self.modified.store(true, Ordering::SeqCst);
    }

    /// True until the operator has completed once
    pub fn is_new(&self) -> bool {
        self.new.load(Ordering::SeqCst)
    }

    /// Message of the most recent failure
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        *lock(&self.last_error) = Some(message.into());
    }

    // ==================== Execution ====================

    /// Run the transform on `buffer`.
    ///
    /// Publishes `TransformingStarted` before the work and
    /// `TransformingDone` after it. Errors and panics inside the transform
    /// are contained and reported as [`TransformResult::Error`].
    pub fn transform(
        &self,
        buffer: &mut VolumeBuffer,
        children: Option<&dyn Fn(ChildRequest)>,
    ) -> TransformResult {
        self.transform_in_run(buffer, children, None)
    }

    /// Like [`Self::transform`], also stopping when `run_canceled` is set.
    ///
    /// The flag belongs to one run, so a later run resetting this operator
    /// cannot hide a cancel that was meant for an earlier one.
    pub fn transform_in_run(
        &self,
        buffer: &mut VolumeBuffer,
        children: Option<&dyn Fn(ChildRequest)>,
        run_canceled: Option<&AtomicBool>,
    ) -> TransformResult {
        let transform = self.current_transform();
        let label = transform.label();

        self.set_state(OperatorState::Running);
        *lock(&self.last_error) = None;
        self.notify(OperatorEvent::TransformingStarted);
        self.set_progress_step(0);

        let ctx = TransformContext {
            operator: self,
            children,
            run_canceled,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| transform.apply(buffer, &ctx)));

        let mut result = match outcome {
            Ok(Ok(true)) => TransformResult::Complete,
            Ok(Ok(false)) => {
                tracing::warn!(operator = %label, "transform reported failure");
                if self.last_error().is_none() {
                    self.set_last_error("transform reported failure");
                }
                TransformResult::Error
            }
            Ok(Err(e)) => {
                tracing::error!(operator = %label, "transform failed: {}", e);
                self.set_last_error(e.to_string());
                TransformResult::Error
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "transform panicked".to_string());
                tracing::error!(operator = %label, "transform panicked: {}", message);
                self.set_last_error(message);
                TransformResult::Error
            }
        };

        if ctx.is_canceled() {
            self.set_state(OperatorState::Canceled);
            result = TransformResult::Canceled;
        } else {
            self.set_state(result.into());
        }
        self.transforming_done(result);
        result
    }

    /// Ask a running transform to stop
    pub fn cancel_transform(&self) {
        self.set_state(OperatorState::Canceled);
        self.notify(OperatorEvent::TransformCanceled);
    }

    /// Publish the start of a transform that runs elsewhere (out of process)
    pub fn transforming_started(&self) {
        self.set_state(OperatorState::Running);
        self.notify(OperatorEvent::TransformingStarted);
    }

    /// Publish the end of a transform and settle the modified/new flags
    pub fn transforming_done(&self, result: TransformResult) {
        if self.state() == OperatorState::Complete {
            self.modified.store(false, Ordering::SeqCst);
            self.new.store(false, Ordering::SeqCst);
        }
        self.notify(OperatorEvent::TransformingDone(result));
    }

    // ==================== Progress ====================

    pub fn progress(&self) -> Progress {
        lock(&self.progress).clone()
    }

    pub fn total_progress_steps(&self) -> u64 {
        lock(&self.progress).total_steps
    }

    pub fn set_total_progress_steps(&self, steps: u64) {
        lock(&self.progress).total_steps = steps;
        self.notify(OperatorEvent::TotalProgressStepsChanged(steps));
    }

    pub fn progress_step(&self) -> u64 {
        lock(&self.progress).step
    }

    pub fn set_progress_step(&self, step: u64) {
        lock(&self.progress).step = step;
        self.notify(OperatorEvent::ProgressStepChanged(step));
    }

    pub fn progress_message(&self) -> String {
        lock(&self.progress).message.clone()
    }

    pub fn set_progress_message(&self, message: impl Into<String>) {
        let message = message.into();
        lock(&self.progress).message = message.clone();
        self.notify(OperatorEvent::ProgressMessageChanged(message));
    }

    // ==================== Results ====================

    pub fn number_of_results(&self) -> usize {
        lock(&self.results).len()
    }

    /// Grow or shrink the result slots, keeping existing ones
    pub fn set_number_of_results(&self, n: usize) {
        lock(&self.results).resize_with(n, OperatorResult::default);
    }

    pub fn set_result_name(&self, index: usize, name: impl Into<String>) -> bool {
        match lock(&self.results).get_mut(index) {
            Some(slot) => {
                slot.name = name.into();
                true
            }
            None => false,
        }
    }

    /// Store a result by index; false when the slot does not exist
    pub fn set_result(&self, index: usize, data: VolumeBuffer) -> bool {
        match lock(&self.results).get_mut(index) {
            Some(slot) => {
                slot.data = Some(data);
                true
            }
            None => false,
        }
    }

    /// Store a result by name; false when no slot has that name
    pub fn set_named_result(&self, name: &str, data: VolumeBuffer) -> bool {
        match lock(&self.results).iter_mut().find(|slot| slot.name == name) {
            Some(slot) => {
                slot.data = Some(data);
                true
            }
            None => false,
        }
    }

    pub fn result_at(&self, index: usize) -> Option<OperatorResult> {
        lock(&self.results).get(index).cloned()
    }

    // ==================== Subscribers ====================

    /// Subscribe to this operator's notifications
    pub fn subscribe(&self) -> Receiver<OperatorEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn notify(&self, event: OperatorEvent) {
        let mut subscribers = lock(&self.subscribers);
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("uid", &self.uid)
            .field("label", &self.label())
            .field("state", &self.state())
            .field("modified", &self.is_modified())
            .field("new", &self.is_new())
            .finish()
    }
}

/// What a running transform can see and do besides touching the buffer
pub struct TransformContext<'a> {
    operator: &'a Operator,
    children: Option<&'a dyn Fn(ChildRequest)>,
    run_canceled: Option<&'a AtomicBool>,
}

impl<'a> TransformContext<'a> {
    /// Context for running a transform outside the worker, e.g. in the
    /// external runner
    pub fn new(operator: &'a Operator, children: Option<&'a dyn Fn(ChildRequest)>) -> Self {
        Self {
            operator,
            children,
            run_canceled: None,
        }
    }

    /// True once the operator or the run it belongs to was canceled
    pub fn is_canceled(&self) -> bool {
        self.operator.is_canceled()
            || self
                .run_canceled
                .map(|flag| flag.load(Ordering::SeqCst))
                .unwrap_or(false)
    }

    pub fn set_total_progress_steps(&self, steps: u64) {
        self.operator.set_total_progress_steps(steps);
    }

    pub fn set_progress_step(&self, step: u64) {
        self.operator.set_progress_step(step);
    }

    pub fn set_progress_message(&self, message: impl Into<String>) {
        self.operator.set_progress_message(message);
    }

    pub fn set_result(&self, index: usize, data: VolumeBuffer) -> bool {
        self.operator.set_result(index, data)
    }

    pub fn set_named_result(&self, name: &str, data: VolumeBuffer) -> bool {
        self.operator.set_named_result(name, data)
    }

    /// Ask for a child data source holding `buffer`.
    ///
    /// Returns false when nobody is listening (e.g. a preview run).
    pub fn request_child_data_source(&self, label: impl Into<String>, buffer: VolumeBuffer) -> bool {
        match self.children {
            Some(sink) => {
                sink(ChildRequest {
                    label: label.into(),
                    buffer,
                });
                true
            }
            None => false,
        }
    }
}

/// Apply `f` to every z slice of `buffer`, reporting one progress step per
/// slice and stopping early once the operator is canceled.
///
/// Returns false when stopped by cancellation.
pub fn for_each_slice<F>(buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>, mut f: F) -> bool
where
    F: FnMut(&mut [f64]),
{
    let [nx, ny, nz] = buffer.dims();
    let slice_len = nx * ny;
    ctx.set_total_progress_steps(nz as u64);
    if slice_len == 0 {
        return true;
    }
    for (z, slice) in buffer.voxels_mut().chunks_mut(slice_len).enumerate() {
        if ctx.is_canceled() {
            return false;
        }
        f(slice);
        ctx.set_progress_step(z as u64 + 1);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ScalarType;
    use crate::error::PipelineError;

    struct AddOne;

    impl Transform for AddOne {
        fn label(&self) -> String {
            "Add One".to_string()
        }

        fn apply(&self, buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
            Ok(for_each_slice(buffer, ctx, |slice| {
                slice.iter_mut().for_each(|v| *v += 1.0)
            }))
        }

        fn config(&self) -> serde_json::Value {
            serde_json::json!({ "type": "add_one" })
        }
    }

    struct Broken(bool);

    impl Transform for Broken {
        fn label(&self) -> String {
            "Broken".to_string()
        }

        fn apply(&self, _buffer: &mut VolumeBuffer, _ctx: &TransformContext<'_>) -> Result<bool> {
            if self.0 {
                panic!("exploded");
            }
            Err(PipelineError::Script("division by zero".to_string()))
        }

        fn config(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    #[test]
    fn test_transform_complete_clears_flags() {
        let op = Operator::new(AddOne);
        let events = op.subscribe();
        let mut buffer = VolumeBuffer::filled([2, 2, 3], ScalarType::F32, 1.0);

        assert!(op.is_new());
        assert!(op.is_modified());

        let result = op.transform(&mut buffer, None);

        assert_eq!(result, TransformResult::Complete);
        assert_eq!(op.state(), OperatorState::Complete);
        assert!(op.is_finished());
        assert!(!op.is_new());
        assert!(!op.is_modified());
        assert!(buffer.voxels().iter().all(|&v| v == 2.0));
        assert_eq!(op.progress_step(), 3);
        assert_eq!(op.total_progress_steps(), 3);

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.first(), Some(&OperatorEvent::TransformingStarted));
        assert_eq!(
            received.last(),
            Some(&OperatorEvent::TransformingDone(TransformResult::Complete))
        );
    }

    #[test]
    fn test_error_and_panic_map_to_error() {
        let mut buffer = VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 0.0);

        let failing = Operator::new(Broken(false));
        assert_eq!(failing.transform(&mut buffer, None), TransformResult::Error);
        assert!(failing.is_finished());
        assert!(failing.is_new());
        assert!(failing.last_error().unwrap().contains("division by zero"));

        let panicking = Operator::new(Broken(true));
        assert_eq!(panicking.transform(&mut buffer, None), TransformResult::Error);
        assert_eq!(panicking.last_error().as_deref(), Some("exploded"));
    }

    #[test]
    fn test_canceled_before_completion_reports_canceled() {
        struct CancelsItself;
        impl Transform for CancelsItself {
            fn label(&self) -> String {
                "Self cancel".to_string()
            }
            fn apply(&self, _b: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
                ctx.operator.cancel_transform();
                Ok(true)
            }
            fn config(&self) -> serde_json::Value {
                serde_json::Value::Null
            }
        }

        let op = Operator::new(CancelsItself);
        let mut buffer = VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 0.0);
        assert_eq!(op.transform(&mut buffer, None), TransformResult::Canceled);
        assert!(op.is_canceled());
        assert!(!op.is_finished());
        assert!(op.is_new());
    }

    #[test]
    fn test_run_cancel_flag_outlives_state_reset() {
        struct Resets;
        impl Transform for Resets {
            fn label(&self) -> String {
                "Resets".to_string()
            }
            fn apply(&self, _b: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
                // Another run takes the operator over mid-transform
                ctx.operator.reset_state();
                Ok(!ctx.is_canceled())
            }
            fn config(&self) -> serde_json::Value {
                serde_json::Value::Null
            }
        }

        let op = Operator::new(Resets);
        let mut buffer = VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 0.0);
        let canceled = AtomicBool::new(true);
        assert_eq!(
            op.transform_in_run(&mut buffer, None, Some(&canceled)),
            TransformResult::Canceled
        );
        assert_eq!(op.state(), OperatorState::Canceled);

        canceled.store(false, Ordering::SeqCst);
        assert_eq!(
            op.transform_in_run(&mut buffer, None, Some(&canceled)),
            TransformResult::Complete
        );
    }

    #[test]
    fn test_results_by_index_and_name() {
        let op = Operator::new(AddOne);
        assert_eq!(op.number_of_results(), 0);
        assert!(!op.set_result(0, VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 1.0)));

        op.set_number_of_results(2);
        assert!(op.set_result_name(1, "mask"));
        assert!(op.set_result(0, VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 1.0)));
        assert!(op.set_named_result("mask", VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 7.0)));
        assert!(!op.set_named_result("missing", VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 0.0)));

        let mask = op.result_at(1).unwrap();
        assert_eq!(mask.name, "mask");
        assert_eq!(mask.data.unwrap().voxels(), &[7.0]);

        op.set_number_of_results(1);
        assert!(op.result_at(1).is_none());
        assert!(op.result_at(0).unwrap().data.is_some());
    }

    #[test]
    fn test_clone_and_reconfigure() {
        let op = Operator::new(AddOne);
        let mut buffer = VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 0.0);
        op.transform(&mut buffer, None);

        let copy = op.clone_operator();
        assert_ne!(copy.uid(), op.uid());
        assert_eq!(copy.state(), OperatorState::Queued);
        assert!(copy.is_new());
        assert_eq!(copy.label(), "Add One");

        let events = op.subscribe();
        op.reconfigure(Broken(false));
        assert!(op.is_modified());
        assert_eq!(op.label(), "Broken");
        assert_eq!(events.try_recv(), Ok(OperatorEvent::TransformModified));
    }

    #[test]
    fn test_child_request_without_listener() {
        let op = Operator::new(AddOne);
        let ctx = TransformContext::new(&op, None);
        assert!(!ctx.request_child_data_source("child", VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 0.0)));

        let seen = std::cell::RefCell::new(Vec::new());
        let sink = |req: ChildRequest| seen.borrow_mut().push(req.label);
        let ctx = TransformContext::new(&op, Some(&sink));
        assert!(ctx.request_child_data_source("child", VolumeBuffer::filled([1, 1, 1], ScalarType::U8, 0.0)));
        assert_eq!(seen.borrow().as_slice(), &["child".to_string()]);
    }
}
