//! Volumetric image buffers
//!
//! The engine treats image data as an opaque 3D buffer with shape and type
//! metadata. Voxels are stored as `f64` in Fortran order (x fastest) whatever
//! the nominal scalar type; the scalar type only controls clamping when the
//! buffer is written back.
//!
//! Buffers cross process boundaries as bincode transfer files (`*.tvb`).

use crate::error::{PipelineError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// File extension of a buffer transfer file
pub const TRANSFER_EXTENSION: &str = "tvb";

/// Nominal scalar type of the voxels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScalarType {
    #[default]
    U8,
    U16,
    I16,
    I32,
    F32,
    F64,
}

impl ScalarType {
    /// Representable range, or `None` for floating point types
    pub fn range(&self) -> Option<(f64, f64)> {
        match self {
            ScalarType::U8 => Some((0.0, u8::MAX as f64)),
            ScalarType::U16 => Some((0.0, u16::MAX as f64)),
            ScalarType::I16 => Some((i16::MIN as f64, i16::MAX as f64)),
            ScalarType::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            ScalarType::F32 | ScalarType::F64 => None,
        }
    }
}

/// A 3D volume with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeBuffer {
    dims: [usize; 3],
    scalar_type: ScalarType,
    spacing: [f64; 3],
    tilt_angles: Option<Vec<f64>>,
    voxels: Vec<f64>,
}

impl VolumeBuffer {
    /// Create a volume with every voxel set to `value`
    pub fn filled(dims: [usize; 3], scalar_type: ScalarType, value: f64) -> Self {
        let len = dims.iter().product();
        Self {
            dims,
            scalar_type,
            spacing: [1.0; 3],
            tilt_angles: None,
            voxels: vec![value; len],
        }
    }

    /// Create a volume from existing voxels
    pub fn from_voxels(
        dims: [usize; 3],
        scalar_type: ScalarType,
        voxels: Vec<f64>,
    ) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if voxels.len() != expected {
            return Err(PipelineError::Serialization(format!(
                "voxel count {} does not match dimensions {:?}",
                voxels.len(),
                dims
            )));
        }
        Ok(Self {
            dims,
            scalar_type,
            spacing: [1.0; 3],
            tilt_angles: None,
            voxels,
        })
    }

    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    pub fn set_scalar_type(&mut self, scalar_type: ScalarType) {
        self.scalar_type = scalar_type;
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn set_spacing(&mut self, spacing: [f64; 3]) {
        self.spacing = spacing;
    }

    /// Tilt angles of a tilt series, if this buffer is one
    pub fn tilt_angles(&self) -> Option<&[f64]> {
        self.tilt_angles.as_deref()
    }

    pub fn set_tilt_angles(&mut self, angles: Option<Vec<f64>>) {
        self.tilt_angles = angles;
    }

    pub fn voxels(&self) -> &[f64] {
        &self.voxels
    }

    pub fn voxels_mut(&mut self) -> &mut [f64] {
        &mut self.voxels
    }

    /// Flat index of voxel `(x, y, z)`
    pub fn index(&self, x: usize, y: usize, z: usize) -> Option<usize> {
        let [nx, ny, nz] = self.dims;
        (x < nx && y < ny && z < nz).then(|| x + nx * (y + ny * z))
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f64> {
        self.index(x, y, z).map(|i| self.voxels[i])
    }

    /// Minimum and maximum voxel values
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.voxels.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    /// Clamp every voxel into the scalar type's range
    pub fn clamp_to_type(&mut self) {
        if let Some((lo, hi)) = self.scalar_type.range() {
            for v in &mut self.voxels {
                *v = v.clamp(lo, hi);
            }
        }
    }

    // ==================== Transfer Files ====================

    /// Write this buffer to a transfer file
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("creating {:?}", path))?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a buffer from a transfer file
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
        let buffer: VolumeBuffer = bincode::deserialize_from(BufReader::new(file))?;
        let expected: usize = buffer.dims.iter().product();
        if buffer.voxels.len() != expected {
            return Err(PipelineError::Serialization(format!(
                "{:?}: voxel count {} does not match dimensions {:?}",
                path,
                buffer.voxels.len(),
                buffer.dims
            )));
        }
        Ok(buffer)
    }
}
