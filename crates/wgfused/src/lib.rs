//! Fused inference kernels for transformer decoders.
//!
//! Two components live here:
//! - [`norm_act::LayerNormAct`] (and its wgpu counterpart [`gpu::GpuLayerNormAct`]) computes a
//!   layer normalization followed by an element-wise activation, promoting reduced-precision
//!   parameters into call-scoped scratch memory first.
//! - [`decoder::FusedMultiTransformer`] runs a whole stack of pre- or post-normalized
//!   attention + feed-forward blocks in a single call, with key/value caching, rotary embeddings
//!   and tensor-parallel reductions.
//!
//! The math primitives are provided by a [`device::DeviceMath`] implementation (see
//! [`cpu::CpuDevice`]) and the cross-participant reductions by a
//! [`parallel::Communicator`].

#![allow(clippy::too_many_arguments)]
#![warn(missing_docs)]

pub mod activation;
pub mod cpu;
pub mod decoder;
pub mod device;
pub mod dtype;
pub mod error;
pub mod gpu;
pub mod norm_act;
pub mod parallel;
pub mod registry;
pub mod scratch;
pub mod tensor;

pub use activation::{Activation, ActivationKind};
pub use dtype::DType;
pub use error::{ConfigError, DeviceError, Error, Result};
pub use tensor::{Tensor, TensorData};

/// Third-party modules re-exports.
pub mod re_exports {
    pub use half;
    pub use naga_oil;
    pub use nalgebra;
    pub use wgcore;
    pub use wgpu;
}
