//! Rhai Script Engine Implementation
//!
//! Wraps a sandboxed [`rhai::Engine`] with the voxel helper functions
//! registered and safety limits applied to every evaluation.

use super::{CompiledScript, VOXEL_FN};
use crate::error::{PipelineError, Result};
use rhai::{Dynamic, Engine, Scope, AST};
use std::collections::BTreeMap;

/// Per-voxel evaluation state, reused across voxels of one run
pub struct VoxelScope<'a> {
    scope: Scope<'a>,
}

/// The script engine used by script operators
pub struct ScriptEngine {
    engine: Engine,
}

impl ScriptEngine {
    /// Create a new script engine with default configuration
    pub fn new() -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine);
        Self { engine }
    }

    /// Configure the Rhai engine with built-in functions and safety limits
    fn configure_engine(engine: &mut Engine) {
        // Limits apply per voxel evaluation
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(1_000);
        engine.set_max_map_size(1_000);

        engine.register_fn("clamp", |v: f64, lo: f64, hi: f64| -> f64 {
            if lo <= hi {
                v.clamp(lo, hi)
            } else {
                v
            }
        });
        engine.register_fn("lerp", |a: f64, b: f64, t: f64| -> f64 { a + (b - a) * t });
        engine.register_fn("step", |edge: f64, v: f64| -> f64 {
            if v < edge {
                0.0
            } else {
                1.0
            }
        });
        engine.register_fn("smoothstep", |e0: f64, e1: f64, v: f64| -> f64 {
            if e1 == e0 {
                return if v < e0 { 0.0 } else { 1.0 };
            }
            let t = ((v - e0) / (e1 - e0)).clamp(0.0, 1.0);
            t * t * (3.0 - 2.0 * t)
        });
        engine.register_fn("threshold", |v: f64, t: f64, lo: f64, hi: f64| -> f64 {
            if v >= t {
                hi
            } else {
                lo
            }
        });
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));
    }

    /// Compile a script, checking for the optional `voxel` entry point
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledScript> {
        let ast: AST = self
            .engine
            .compile(source)
            .map_err(|e| PipelineError::Script(format!("{}: {}", name, e)))?;

        let voxel_fn = ast
            .iter_functions()
            .find(|f| f.name == VOXEL_FN)
            .map(|f| f.params.len());
        if let Some(arity) = voxel_fn {
            if arity != 4 {
                return Err(PipelineError::Script(format!(
                    "{}: `{}` must take (value, x, y, z), found {} parameters",
                    name, VOXEL_FN, arity
                )));
            }
        }

        Ok(CompiledScript {
            ast,
            source: source.to_string(),
            name: name.to_string(),
            has_voxel_fn: voxel_fn.is_some(),
        })
    }

    /// Validate a script without keeping the result
    pub fn validate(&self, source: &str) -> Result<()> {
        self.compile("<validate>", source).map(|_| ())
    }

    /// Build the scope shared by the voxels of one run
    pub fn voxel_scope<'a>(&self, params: &BTreeMap<String, f64>) -> VoxelScope<'a> {
        let mut scope = Scope::new();
        for (name, value) in params {
            scope.push_constant(name.clone(), *value);
        }
        scope.push("value", 0.0_f64);
        scope.push("x", 0_i64);
        scope.push("y", 0_i64);
        scope.push("z", 0_i64);
        VoxelScope { scope }
    }

    /// Evaluate the script for one voxel
    pub fn eval_voxel(
        &self,
        script: &CompiledScript,
        scope: &mut VoxelScope<'_>,
        value: f64,
        [x, y, z]: [usize; 3],
    ) -> Result<f64> {
        let (x, y, z) = (x as i64, y as i64, z as i64);
        let result: Dynamic = if script.has_voxel_fn() {
            self.engine
                .call_fn(&mut scope.scope, script.ast(), VOXEL_FN, (value, x, y, z))
                .map_err(PipelineError::from_rhai_error)?
        } else {
            scope.scope.set_value("value", value);
            scope.scope.set_value("x", x);
            scope.scope.set_value("y", y);
            scope.scope.set_value("z", z);
            self.engine
                .eval_ast_with_scope(&mut scope.scope, script.ast())
                .map_err(PipelineError::from_rhai_error)?
        };
        dynamic_to_f64(&result).ok_or_else(|| {
            PipelineError::Script(format!(
                "{}: script returned {} instead of a number",
                script.name(),
                result.type_name()
            ))
        })
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn dynamic_to_f64(value: &Dynamic) -> Option<f64> {
    if let Ok(f) = value.as_float() {
        return Some(f);
    }
    if let Ok(i) = value.as_int() {
        return Some(i as f64);
    }
    value.as_bool().ok().map(|b| if b { 1.0 } else { 0.0 })
}
