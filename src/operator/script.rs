//! Script-driven operator

use super::{OperatorConfig, Transform, TransformContext};
use crate::buffer::VolumeBuffer;
use crate::error::{PipelineError, Result};
use crate::scripting::{CompiledScript, ScriptEngine};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runs a rhai voxel script over the whole volume
pub struct ScriptTransform {
    label: String,
    script: CompiledScript,
    params: BTreeMap<String, f64>,
    c_ordering: bool,
    engine: Arc<ScriptEngine>,
}

impl ScriptTransform {
    /// Compile `source`; fails when the script does not compile
    pub fn new(
        engine: Arc<ScriptEngine>,
        label: impl Into<String>,
        source: &str,
        params: BTreeMap<String, f64>,
    ) -> Result<Self> {
        let label = label.into();
        let script = engine.compile(&label, source)?;
        Ok(Self {
            label,
            script,
            params,
            c_ordering: false,
            engine,
        })
    }

    pub fn with_c_ordering(mut self, c_ordering: bool) -> Self {
        self.c_ordering = c_ordering;
        self
    }

    pub fn source(&self) -> &str {
        self.script.source()
    }
}

impl Transform for ScriptTransform {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn icon(&self) -> &str {
        "script"
    }

    fn apply(&self, buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
        let [nx, ny, nz] = buffer.dims();
        let slice_len = nx * ny;
        ctx.set_total_progress_steps(nz as u64);
        if slice_len == 0 {
            return Ok(true);
        }

        let mut scope = self.engine.voxel_scope(&self.params);
        for (z, slice) in buffer.voxels_mut().chunks_mut(slice_len).enumerate() {
            if ctx.is_canceled() {
                return Ok(false);
            }
            for (i, v) in slice.iter_mut().enumerate() {
                let coords = [i % nx, i / nx, z];
                *v = self
                    .engine
                    .eval_voxel(&self.script, &mut scope, *v, coords)
                    .map_err(|e| PipelineError::Operator {
                        label: self.label.clone(),
                        message: format!("at voxel {:?}: {}", coords, e),
                    })?;
            }
            ctx.set_progress_step(z as u64 + 1);
        }
        buffer.clamp_to_type();
        Ok(true)
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn prefers_c_ordering(&self) -> bool {
        self.c_ordering
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(OperatorConfig::Script {
            label: self.label.clone(),
            script: self.script.source().to_string(),
            params: self.params.clone(),
            c_ordering: self.c_ordering,
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ScalarType;
    use crate::operator::{Operator, OperatorState, TransformResult};

    #[test]
    fn test_script_applies_per_voxel() {
        let engine = Arc::new(ScriptEngine::new());
        let transform = ScriptTransform::new(
            engine,
            "Offset",
            "value + offset + z",
            BTreeMap::from([("offset".to_string(), 1.0)]),
        )
        .unwrap();
        let op = Operator::new(transform);

        let mut buffer = VolumeBuffer::filled([2, 1, 3], ScalarType::F32, 10.0);
        assert_eq!(op.transform(&mut buffer, None), TransformResult::Complete);
        assert_eq!(buffer.voxels(), &[11.0, 11.0, 12.0, 12.0, 13.0, 13.0]);
        assert_eq!(op.progress_step(), 3);
    }

    #[test]
    fn test_script_runtime_error_is_operator_error() {
        let engine = Arc::new(ScriptEngine::new());
        let transform =
            ScriptTransform::new(engine, "Bad", "if x > 0 { throw \"nope\" } value", BTreeMap::new())
                .unwrap();
        let op = Operator::new(transform);

        let mut buffer = VolumeBuffer::filled([2, 1, 1], ScalarType::F32, 1.0);
        assert_eq!(op.transform(&mut buffer, None), TransformResult::Error);
        assert_eq!(op.state(), OperatorState::Error);
        assert!(op.last_error().unwrap().contains("Bad"));
    }

    #[test]
    fn test_compile_error_is_reported_at_construction() {
        let engine = Arc::new(ScriptEngine::new());
        assert!(ScriptTransform::new(engine, "Broken", "value +", BTreeMap::new()).is_err());
    }
}
