//! Test data builders for creating test objects

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tomopipe::buffer::{ScalarType, VolumeBuffer};
use tomopipe::config::PipelineSettings;
use tomopipe::executor::WorkerPool;
use tomopipe::operator::{Transform, TransformContext};
use tomopipe::pipeline::Pipeline;
use tomopipe::Result;

/// 2x2x2 unsigned byte volume with every voxel at `value`
pub fn volume(value: f64) -> VolumeBuffer {
    VolumeBuffer::filled([2, 2, 2], ScalarType::U8, value)
}

/// Threaded pipeline on a single worker thread
pub fn threaded_pipeline(value: f64) -> Pipeline {
    Pipeline::with_pool(
        "volume.tvb",
        volume(value),
        PipelineSettings::default(),
        WorkerPool::new(1).unwrap(),
    )
}

/// Shared switch that lets a [`Gated`] transform finish. Also counts how
/// often the transform was entered and how often it gave up on a cancel.
#[derive(Clone, Default)]
pub struct Gate(Arc<GateState>);

#[derive(Default)]
pub struct GateState {
    open: AtomicBool,
    entered: AtomicUsize,
    canceled: AtomicUsize,
}

impl Gate {
    pub fn open(&self) {
        self.0.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.open.load(Ordering::SeqCst)
    }

    pub fn entered(&self) -> usize {
        self.0.entered.load(Ordering::SeqCst)
    }

    pub fn canceled(&self) -> usize {
        self.0.canceled.load(Ordering::SeqCst)
    }
}

/// Identity transform that blocks until its gate opens or it is canceled
pub struct Gated {
    gate: Gate,
}

impl Gated {
    pub fn new() -> (Self, Gate) {
        let gate = Gate::default();
        (Self { gate: gate.clone() }, gate)
    }
}

impl Transform for Gated {
    fn label(&self) -> String {
        "Gated".to_string()
    }

    fn apply(&self, _buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
        self.gate.0.entered.fetch_add(1, Ordering::SeqCst);
        ctx.set_total_progress_steps(1);
        while !self.gate.is_open() {
            if ctx.is_canceled() {
                self.gate.0.canceled.fetch_add(1, Ordering::SeqCst);
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        ctx.set_progress_step(1);
        Ok(true)
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn config(&self) -> Value {
        json!({ "type": "linear", "scale": 1.0, "offset": 0.0 })
    }
}

/// Builder for operator list files
#[derive(Default)]
pub struct OperatorListBuilder {
    operators: Vec<Value>,
}

impl OperatorListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invert(mut self) -> Self {
        self.operators.push(json!({ "type": "invert" }));
        self
    }

    pub fn threshold(mut self, value: f64) -> Self {
        self.operators.push(json!({ "type": "threshold", "value": value }));
        self
    }

    pub fn fork(mut self, label: &str) -> Self {
        self.operators.push(json!({ "type": "fork", "label": label }));
        self
    }

    pub fn script(mut self, label: &str, script: &str) -> Self {
        self.operators
            .push(json!({ "type": "script", "label": label, "script": script }));
        self
    }

    pub fn build(self) -> Vec<Value> {
        self.operators
    }

    /// Write `{"operators": [...]}` to `dir/name`
    pub fn write(self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let document = json!({ "operators": self.operators });
        std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_list_builder() {
        let list = OperatorListBuilder::new().invert().threshold(50.0).build();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["type"], "invert");
        assert_eq!(list[1]["value"], 50.0);
    }
}
