//! Rotary position embeddings and masked scaled dot-product attention.

use crate::error::ConfigError;
use crate::tensor::Tensor;
use nalgebra::{DMatrixView, DVector, DVectorView, DVectorViewMut, UnitComplex, Vector2};
use std::borrow::Cow;

/// A `[2, positions, head_dim / 2]` table of cosines followed by sines.
pub(crate) struct RotaryTable<'a> {
    data: Cow<'a, [f32]>,
    positions: usize,
    half: usize,
}

impl<'a> RotaryTable<'a> {
    pub fn new(table: &'a Tensor, head_dim: usize) -> Result<Self, ConfigError> {
        let shape = table.shape();
        if shape.len() != 3 {
            return Err(ConfigError::RankMismatch {
                what: "rotary_emb",
                expected: 3,
                found: shape.len(),
            });
        }

        let half = head_dim / 2;
        if head_dim % 2 != 0 || shape[2] != half {
            return Err(ConfigError::RotaryDimMismatch {
                expected: half,
                found: shape[2],
            });
        }
        table.expect_shape("rotary_emb", &[2, shape[1], half])?;

        let data = match table.data().as_f32() {
            Some(data) => Cow::Borrowed(data),
            None => Cow::Owned(table.to_f32_vec()),
        };

        Ok(Self {
            data,
            positions: shape[1],
            half,
        })
    }

    pub fn check_position(&self, position: usize) -> Result<(), ConfigError> {
        if position >= self.positions {
            return Err(ConfigError::RotaryPositionOutOfRange {
                position,
                capacity: self.positions,
            });
        }
        Ok(())
    }

    /// Rotates the interleaved pairs `(2i, 2i + 1)` of `head` by the angles of `position`.
    pub fn rotate(&self, head: &mut [f32], position: usize) {
        let cos = &self.data[position * self.half..][..self.half];
        let sin = &self.data[(self.positions + position) * self.half..][..self.half];

        for (i, pair) in head.chunks_exact_mut(2).enumerate() {
            let rot = UnitComplex::from_cos_sin_unchecked(cos[i], sin[i]);
            let rotated = rot * Vector2::new(pair[0], pair[1]);
            pair[0] = rotated.x;
            pair[1] = rotated.y;
        }
    }
}

/// Attends the query `q` over `kv_len` keys and values stored contiguously (one entry of
/// `q.len()` elements after the other), writing the weighted sum of values into `out`.
///
/// Keys at index `limit` and beyond are ignored. `mask` is added to the scaled scores. A query
/// with no visible key produces zeros.
pub(crate) fn attend(
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    kv_len: usize,
    limit: usize,
    mask: Option<&[f32]>,
    out: &mut [f32],
) {
    let head_dim = q.len();
    let scale = 1.0 / (head_dim as f32).sqrt();
    let keys = DMatrixView::from_slice(&keys[..kv_len * head_dim], head_dim, kv_len);
    let values = DMatrixView::from_slice(&values[..kv_len * head_dim], head_dim, kv_len);
    let q = DVectorView::from_slice(q, head_dim);

    let mut scores: DVector<f32> = keys.tr_mul(&q) * scale;
    if let Some(mask) = mask {
        scores
            .iter_mut()
            .zip(&mask[..kv_len])
            .for_each(|(s, m)| *s += m);
    }
    scores
        .iter_mut()
        .skip(limit)
        .for_each(|s| *s = f32::NEG_INFINITY);

    let mut out = DVectorViewMut::from_slice(out, head_dim);
    if !softmax(scores.as_mut_slice()) {
        out.fill(0.0);
        return;
    }

    out.gemv(1.0, &values, &scores, 0.0);
}

/// Max-subtracted softmax. Returns `false`, leaving `scores` unspecified, if no score is finite.
fn softmax(scores: &mut [f32]) -> bool {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return false;
    }

    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    scores.iter_mut().for_each(|s| *s /= sum);
    true
}
