//! Host tensors: a row-major buffer, its shape, and its element type.

use crate::dtype::DType;
use crate::error::ConfigError;
use half::{bf16, f16};

/// Storage of a [`Tensor`], one variant per [`DType`].
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    /// Single-precision elements.
    F32(Vec<f32>),
    /// Half-precision elements.
    F16(Vec<f16>),
    /// Brain-float elements.
    BF16(Vec<bf16>),
}

impl TensorData {
    /// Zero-initialized storage for `len` elements of type `dtype`.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::F16 => Self::F16(vec![f16::ZERO; len]),
            DType::BF16 => Self::BF16(vec![bf16::ZERO; len]),
        }
    }

    /// The element type of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F16(_) => DType::F16,
            Self::BF16(_) => DType::BF16,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::BF16(v) => v.len(),
        }
    }

    /// Is this storage empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The elements, if they are already single-precision.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }

    /// The raw bytes of the elements.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::F32(v) => bytemuck::cast_slice(v),
            Self::F16(v) => bytemuck::cast_slice(v),
            Self::BF16(v) => bytemuck::cast_slice(v),
        }
    }

    /// Converts `out.len()` elements starting at `offset` into `out`.
    pub fn read_f32(&self, offset: usize, out: &mut [f32]) {
        let range = offset..offset + out.len();
        match self {
            Self::F32(v) => out.copy_from_slice(&v[range]),
            Self::F16(v) => out
                .iter_mut()
                .zip(&v[range])
                .for_each(|(o, x)| *o = x.to_f32()),
            Self::BF16(v) => out
                .iter_mut()
                .zip(&v[range])
                .for_each(|(o, x)| *o = x.to_f32()),
        }
    }

    /// Stores `src` starting at `offset`, rounding to this storage’s element type.
    pub fn write_f32(&mut self, offset: usize, src: &[f32]) {
        let range = offset..offset + src.len();
        match self {
            Self::F32(v) => v[range].copy_from_slice(src),
            Self::F16(v) => v[range]
                .iter_mut()
                .zip(src)
                .for_each(|(o, x)| *o = f16::from_f32(*x)),
            Self::BF16(v) => v[range]
                .iter_mut()
                .zip(src)
                .for_each(|(o, x)| *o = bf16::from_f32(*x)),
        }
    }

    /// All the elements converted to single precision.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.len()];
        self.read_f32(0, &mut out);
        out
    }
}

/// A dense, row-major tensor stored in RAM.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Creates a tensor from its shape and storage.
    ///
    /// Fails if the number of elements doesn’t match the shape.
    pub fn new(shape: impl Into<Vec<usize>>, data: TensorData) -> Result<Self, ConfigError> {
        let shape = shape.into();
        let expected = shape.iter().product::<usize>();

        if expected != data.len() {
            return Err(ConfigError::ElementCount {
                shape,
                expected,
                found: data.len(),
            });
        }

        Ok(Self { shape, data })
    }

    /// Creates a single-precision tensor.
    pub fn from_f32(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self, ConfigError> {
        Self::new(shape, TensorData::F32(data))
    }

    /// Creates a half-precision tensor.
    pub fn from_f16(shape: impl Into<Vec<usize>>, data: Vec<f16>) -> Result<Self, ConfigError> {
        Self::new(shape, TensorData::F16(data))
    }

    /// Creates a brain-float tensor.
    pub fn from_bf16(shape: impl Into<Vec<usize>>, data: Vec<bf16>) -> Result<Self, ConfigError> {
        Self::new(shape, TensorData::BF16(data))
    }

    /// A zero-filled tensor.
    pub fn zeros(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: TensorData::zeros(dtype, len),
        }
    }

    /// The tensor’s shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// The element type.
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Does this tensor contain zero elements?
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The tensor’s storage.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// The tensor’s mutable storage.
    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    /// All the elements converted to single precision.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.to_f32_vec()
    }

    /// A copy of this tensor with its elements converted to `dtype`.
    pub fn to_dtype(&self, dtype: DType) -> Self {
        if dtype == self.dtype() {
            return self.clone();
        }

        let mut data = TensorData::zeros(dtype, self.len());
        data.write_f32(0, &self.to_f32_vec());
        Self {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Views the shape as a matrix: every dimension before `axis` is flattened into the row
    /// count, every dimension from `axis` onward into the row length.
    pub fn flatten_to_2d(&self, axis: usize) -> Result<(usize, usize), ConfigError> {
        flatten_to_2d(&self.shape, axis)
    }

    pub(crate) fn expect_shape(
        &self,
        what: &'static str,
        expected: &[usize],
    ) -> Result<(), ConfigError> {
        if self.shape != expected {
            return Err(ConfigError::ShapeMismatch {
                what,
                expected: expected.to_vec(),
                found: self.shape.clone(),
            });
        }
        Ok(())
    }
}

/// Splits `shape` into `(product of the dims before axis, product of the dims from axis on)`.
pub(crate) fn flatten_to_2d(shape: &[usize], axis: usize) -> Result<(usize, usize), ConfigError> {
    if axis >= shape.len() {
        return Err(ConfigError::InvalidAxis {
            axis,
            rank: shape.len(),
        });
    }

    let left = shape[..axis].iter().product();
    let right = shape[axis..].iter().product();
    Ok((left, right))
}
