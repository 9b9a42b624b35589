//! The normalization-activation kernel on a wgpu device.
//!
//! The tensors, the gpu instance and the kernel dispatch come from `wgcore`. The kernels read
//! single-precision rows. Their scale and bias can be uploaded in any [`DType`]: 16-bit ones
//! are packed two per word and widened on the device.

mod norm_act;
mod shaders;

pub use norm_act::GpuLayerNormAct;

use crate::dtype::DType;
use bytemuck::Pod;
use half::{bf16, f16};
use wgcore::tensor::GpuVector;
use wgpu::Buffer;

/// Element types of the gpu tensors handed to the kernels.
pub trait GpuElement: Pod {
    /// The matching element type of host tensors.
    const DTYPE: DType;
}

impl GpuElement for f32 {
    const DTYPE: DType = DType::F32;
}

impl GpuElement for f16 {
    const DTYPE: DType = DType::F16;
}

impl GpuElement for bf16 {
    const DTYPE: DType = DType::BF16;
}

/// A per-feature scale or bias vector, in any supported precision.
#[derive(Copy, Clone)]
pub enum GpuParam<'a> {
    /// Single-precision elements, bound as-is.
    F32(&'a GpuVector<f32>),
    /// Half-precision elements.
    F16(&'a GpuVector<f16>),
    /// Brain-float elements.
    BF16(&'a GpuVector<bf16>),
}

impl GpuParam<'_> {
    /// The element type.
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
        }
    }

    /// The number of elements.
    pub fn len(&self) -> u64 {
        match self {
            Self::F32(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::BF16(v) => v.len(),
        }
    }

    /// Does this vector contain zero elements?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying storage buffer.
    pub fn buffer(&self) -> &Buffer {
        match self {
            Self::F32(v) => v.buffer(),
            Self::F16(v) => v.buffer(),
            Self::BF16(v) => v.buffer(),
        }
    }
}

impl<'a> From<&'a GpuVector<f32>> for GpuParam<'a> {
    fn from(v: &'a GpuVector<f32>) -> Self {
        Self::F32(v)
    }
}

impl<'a> From<&'a GpuVector<f16>> for GpuParam<'a> {
    fn from(v: &'a GpuVector<f16>) -> Self {
        Self::F16(v)
    }
}

impl<'a> From<&'a GpuVector<bf16>> for GpuParam<'a> {
    fn from(v: &'a GpuVector<bf16>) -> Self {
        Self::BF16(v)
    }
}
