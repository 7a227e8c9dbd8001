//! Rhai Scripting Engine for Voxel Operators
//!
//! Script operators run a small rhai program once per voxel. A script is
//! either a bare expression over the voxel variables, or defines a
//! `voxel(value, x, y, z)` function that returns the new value.
//!
//! ## Variables
//!
//! - `value` - The current voxel value
//! - `x`, `y`, `z` - Voxel coordinates
//! - Any numeric parameter configured on the operator
//!
//! ## Helper Functions
//!
//! - `clamp(v, lo, hi)` - Clamp to a range
//! - `lerp(a, b, t)` - Linear interpolation
//! - `step(edge, v)` - 0.0 below `edge`, 1.0 otherwise
//! - `smoothstep(e0, e1, v)` - Hermite interpolation between two edges
//! - `threshold(v, t, lo, hi)` - Binary threshold
//!
//! ## Example Scripts
//!
//! Squaring every voxel:
//! ```rhai
//! value * value
//! ```
//!
//! Masking a slab:
//! ```rhai
//! fn voxel(value, x, y, z) {
//!     if z < 4 { 0.0 } else { value }
//! }
//! ```

mod engine;

pub use engine::ScriptEngine;

use rhai::AST;

/// Name of the optional per-voxel entry point
pub const VOXEL_FN: &str = "voxel";

/// A compiled voxel script
#[derive(Clone)]
pub struct CompiledScript {
    ast: AST,
    source: String,
    name: String,
    has_voxel_fn: bool,
}

impl CompiledScript {
    /// Get the source code of this script
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get the name of this script
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the script defines `voxel(value, x, y, z)`
    pub fn has_voxel_fn(&self) -> bool {
        self.has_voxel_fn
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("has_voxel_fn", &self.has_voxel_fn)
            .finish()
    }
}
