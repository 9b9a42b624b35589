//! Indexing of the per-layer key/value caches.

use crate::error::ConfigError;
use crate::tensor::{Tensor, TensorData};

/// Index of the keys along the first cache axis.
pub(crate) const KEYS: usize = 0;
/// Index of the values along the first cache axis.
pub(crate) const VALUES: usize = 1;

/// Layout of a `[2, batch, heads, capacity, head_dim]` key/value tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct KvLayout {
    pub batch: usize,
    pub heads: usize,
    pub capacity: usize,
    pub head_dim: usize,
}

impl KvLayout {
    /// Reads the layout of `tensor`, checking every dimension but the sequence one.
    pub fn of(
        what: &'static str,
        tensor: &Tensor,
        batch: usize,
        heads: usize,
        head_dim: usize,
    ) -> Result<Self, ConfigError> {
        let shape = tensor.shape();
        if shape.len() != 5 {
            return Err(ConfigError::RankMismatch {
                what,
                expected: 5,
                found: shape.len(),
            });
        }

        let layout = Self {
            batch,
            heads,
            capacity: shape[3],
            head_dim,
        };
        tensor.expect_shape(what, &layout.shape())?;
        Ok(layout)
    }

    pub fn shape(&self) -> [usize; 5] {
        [2, self.batch, self.heads, self.capacity, self.head_dim]
    }

    /// Flat index of the first element of the `pos`-th entry of head `h` of batch entry `b`.
    pub fn offset(&self, kv: usize, b: usize, h: usize, pos: usize) -> usize {
        (((kv * self.batch + b) * self.heads + h) * self.capacity + pos) * self.head_dim
    }

    /// Copies the first `len` entries of a head into `out` (`len * head_dim` elements).
    pub fn read(&self, data: &TensorData, kv: usize, b: usize, h: usize, out: &mut [f32]) {
        debug_assert_eq!(out.len() % self.head_dim, 0);
        debug_assert!(out.len() / self.head_dim <= self.capacity);
        data.read_f32(self.offset(kv, b, h, 0), out);
    }

    /// Stores consecutive entries of a head, starting at entry `pos`.
    pub fn write(
        &self,
        data: &mut TensorData,
        kv: usize,
        b: usize,
        h: usize,
        pos: usize,
        src: &[f32],
    ) {
        debug_assert!(pos * self.head_dim + src.len() <= self.capacity * self.head_dim);
        data.write_f32(self.offset(kv, b, h, pos), src);
    }
}
