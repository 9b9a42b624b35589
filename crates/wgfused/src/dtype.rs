//! Element types supported by the kernels.

use std::fmt;

/// Element type of a [`crate::Tensor`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DType {
    /// IEEE 754 single precision.
    F32,
    /// IEEE 754 half precision.
    F16,
    /// Brain floating point (8 exponent bits, 7 mantissa bits).
    BF16,
}

impl DType {
    /// Size of one element, in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Is this a 16-bit type that the math primitives don’t accept directly?
    pub const fn is_reduced(self) -> bool {
        !matches!(self, Self::F32)
    }

    /// Relative tolerance matching the precision of this type.
    pub const fn epsilon(self) -> f32 {
        match self {
            Self::F32 => 1.0e-5,
            Self::F16 => 1.0e-3,
            Self::BF16 => 1.0e-2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
        };
        f.write_str(name)
    }
}
