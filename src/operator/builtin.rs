//! Built-in voxel operators

use super::{for_each_slice, OperatorConfig, Transform, TransformContext};
use crate::buffer::VolumeBuffer;
use crate::error::Result;

fn to_json(config: OperatorConfig) -> serde_json::Value {
    serde_json::to_value(config).unwrap_or(serde_json::Value::Null)
}

/// Reflect values about the top of the range: `v -> max - v`.
///
/// For integer types `max` is the type maximum; for floating point types it
/// is the maximum value present in the volume.
#[derive(Debug, Clone, Default)]
pub struct Invert;

impl Transform for Invert {
    fn label(&self) -> String {
        "Invert Data".to_string()
    }

    fn icon(&self) -> &str {
        "invert"
    }

    fn apply(&self, buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
        let max = match buffer.scalar_type().range() {
            Some((_, hi)) => hi,
            None => buffer.value_range().map(|(_, hi)| hi).unwrap_or(0.0),
        };
        Ok(for_each_slice(buffer, ctx, |slice| {
            slice.iter_mut().for_each(|v| *v = max - *v)
        }))
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn prefers_c_ordering(&self) -> bool {
        true
    }

    fn config(&self) -> serde_json::Value {
        to_json(OperatorConfig::Invert)
    }
}

/// Binary threshold: voxels `>= value` become `above`, the rest `below`
#[derive(Debug, Clone)]
pub struct Threshold {
    pub value: f64,
    pub below: f64,
    pub above: f64,
}

impl Threshold {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            below: 0.0,
            above: 255.0,
        }
    }
}

impl Transform for Threshold {
    fn label(&self) -> String {
        "Binary Threshold".to_string()
    }

    fn icon(&self) -> &str {
        "threshold"
    }

    fn apply(&self, buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
        let (t, lo, hi) = (self.value, self.below, self.above);
        Ok(for_each_slice(buffer, ctx, |slice| {
            slice
                .iter_mut()
                .for_each(|v| *v = if *v >= t { hi } else { lo })
        }))
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn prefers_c_ordering(&self) -> bool {
        true
    }

    fn config(&self) -> serde_json::Value {
        to_json(OperatorConfig::Threshold {
            value: self.value,
            below: self.below,
            above: self.above,
        })
    }
}

/// `v -> v * scale + offset`, clamped to the scalar type
#[derive(Debug, Clone)]
pub struct Linear {
    pub scale: f64,
    pub offset: f64,
}

impl Transform for Linear {
    fn label(&self) -> String {
        "Shift and Scale".to_string()
    }

    fn apply(&self, buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
        let (scale, offset) = (self.scale, self.offset);
        let done = for_each_slice(buffer, ctx, |slice| {
            slice.iter_mut().for_each(|v| *v = *v * scale + offset)
        });
        buffer.clamp_to_type();
        Ok(done)
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn config(&self) -> serde_json::Value {
        to_json(OperatorConfig::Linear {
            scale: self.scale,
            offset: self.offset,
        })
    }
}

/// Publish a copy of the volume as an explicit child data source and leave
/// the volume itself untouched
#[derive(Debug, Clone)]
pub struct Fork {
    pub label: String,
}

impl Transform for Fork {
    fn label(&self) -> String {
        format!("Fork ({})", self.label)
    }

    fn icon(&self) -> &str {
        "fork"
    }

    fn apply(&self, buffer: &mut VolumeBuffer, ctx: &TransformContext<'_>) -> Result<bool> {
        ctx.set_total_progress_steps(1);
        ctx.request_child_data_source(self.label.clone(), buffer.clone());
        ctx.set_progress_step(1);
        Ok(true)
    }

    fn has_child_data_source(&self) -> bool {
        true
    }

    fn config(&self) -> serde_json::Value {
        to_json(OperatorConfig::Fork {
            label: self.label.clone(),
        })
    }
}
