//! Host implementation of the device-math primitives, built on `nalgebra`.
//!
//! Row-major buffers are viewed as column-major matrices with swapped dimensions, i.e., a
//! row-major `m × k` buffer is the column-major `k × m` transpose.

use crate::activation::Activation;
use crate::device::{check_len, DeviceMath};
use crate::error::DeviceError;
use crate::tensor::TensorData;
use nalgebra::{DMatrixView, DMatrixViewMut, DVectorView, DVectorViewMut};

/// Device-math primitives executed on the calling thread.
#[derive(Copy, Clone, Debug)]
pub struct CpuDevice {
    fused: bool,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    /// A CPU device providing the fused normalization-activation primitive.
    pub fn new() -> Self {
        Self { fused: true }
    }

    /// A CPU device without the fused normalization-activation primitive.
    pub fn unfused() -> Self {
        Self { fused: false }
    }

    fn normalize_rows(
        x: &[f32],
        y: &mut [f32],
        left: usize,
        right: usize,
        epsilon: f32,
        scale: Option<&[f32]>,
        bias: Option<&[f32]>,
        act: Activation,
        op: &'static str,
    ) -> Result<(), DeviceError> {
        check_len(op, "x", x.len(), left * right)?;
        check_len(op, "y", y.len(), left * right)?;
        if let Some(scale) = scale {
            check_len(op, "scale", scale.len(), right)?;
        }
        if let Some(bias) = bias {
            check_len(op, "bias", bias.len(), right)?;
        }
        if right == 0 {
            return Ok(());
        }

        let scale = scale.map(|s| DVectorView::from_slice(s, right));
        let bias = bias.map(|b| DVectorView::from_slice(b, right));

        for (x_row, y_row) in x.chunks_exact(right).zip(y.chunks_exact_mut(right)) {
            let x_row = DVectorView::from_slice(x_row, right);
            let mut y_row = DVectorViewMut::from_slice(y_row, right);

            let mean = x_row.mean();
            y_row.zip_apply(&x_row, |y, x| *y = x - mean);
            let variance = y_row.norm_squared() / (right as f32);
            y_row *= 1.0 / (variance + epsilon).sqrt();

            if let Some(scale) = &scale {
                y_row.component_mul_assign(scale);
            }
            if let Some(bias) = &bias {
                y_row += bias;
            }
            act.apply(&mut y_row);
        }

        Ok(())
    }
}

impl DeviceMath for CpuDevice {
    fn name(&self) -> &str {
        if self.fused {
            "cpu"
        } else {
            "cpu (unfused)"
        }
    }

    fn supports_fused_norm_act(&self) -> bool {
        self.fused
    }

    fn cast_to_f32(&self, src: &TensorData, dst: &mut [f32]) -> Result<(), DeviceError> {
        check_len("cast_to_f32", "dst", dst.len(), src.len())?;
        src.read_f32(0, dst);
        Ok(())
    }

    fn layer_norm(
        &self,
        x: &[f32],
        y: &mut [f32],
        left: usize,
        right: usize,
        epsilon: f32,
        scale: Option<&[f32]>,
        bias: Option<&[f32]>,
    ) -> Result<(), DeviceError> {
        Self::normalize_rows(
            x,
            y,
            left,
            right,
            epsilon,
            scale,
            bias,
            Activation::IDENTITY,
            "layer_norm",
        )
    }

    fn activation(&self, y: &mut [f32], act: Activation) -> Result<(), DeviceError> {
        let len = y.len();
        act.apply(&mut DVectorViewMut::from_slice(y, len));
        Ok(())
    }

    fn layer_norm_act(
        &self,
        x: &[f32],
        y: &mut [f32],
        left: usize,
        right: usize,
        epsilon: f32,
        scale: Option<&[f32]>,
        bias: Option<&[f32]>,
        act: Activation,
    ) -> Result<(), DeviceError> {
        if !self.fused {
            return Err(DeviceError::unsupported("layer_norm_act"));
        }

        Self::normalize_rows(
            x,
            y,
            left,
            right,
            epsilon,
            scale,
            bias,
            act,
            "layer_norm_act",
        )
    }

    fn matmul(
        &self,
        x: &[f32],
        w: &[f32],
        y: &mut [f32],
        m: usize,
        k: usize,
        n: usize,
        trans_w: bool,
    ) -> Result<(), DeviceError> {
        check_len("matmul", "x", x.len(), m * k)?;
        check_len("matmul", "w", w.len(), k * n)?;
        check_len("matmul", "y", y.len(), m * n)?;

        // Everything below is the transposed product `yᵀ = wᵀ · xᵀ`.
        let xt = DMatrixView::from_slice(x, k, m);
        let mut yt = DMatrixViewMut::from_slice(y, n, m);

        if trans_w {
            let w = DMatrixView::from_slice(w, k, n);
            yt.gemm_tr(1.0, &w, &xt, 0.0);
        } else {
            let wt = DMatrixView::from_slice(w, n, k);
            yt.gemm(1.0, &wt, &xt, 0.0);
        }

        Ok(())
    }

    fn bias_act(
        &self,
        y: &mut [f32],
        width: usize,
        bias: Option<&[f32]>,
        act: Activation,
    ) -> Result<(), DeviceError> {
        if width == 0 || y.len() % width != 0 {
            return Err(DeviceError::new(
                "bias_act",
                format!("{} elements can’t be split into rows of {width}", y.len()),
            ));
        }
        if let Some(bias) = bias {
            check_len("bias_act", "bias", bias.len(), width)?;
        }

        let bias = bias.map(|b| DVectorView::from_slice(b, width));
        for row in y.chunks_exact_mut(width) {
            let mut row = DVectorViewMut::from_slice(row, width);
            if let Some(bias) = &bias {
                row += bias;
            }
            act.apply(&mut row);
        }

        Ok(())
    }

    fn gated_act(
        &self,
        x: &[f32],
        y: &mut [f32],
        width: usize,
        act: Activation,
    ) -> Result<(), DeviceError> {
        if width == 0 || y.len() % width != 0 {
            return Err(DeviceError::new(
                "gated_act",
                format!("{} elements can’t be split into rows of {width}", y.len()),
            ));
        }
        check_len("gated_act", "x", x.len(), y.len() * 2)?;

        for (x_row, y_row) in x.chunks_exact(width * 2).zip(y.chunks_exact_mut(width)) {
            let (gate, value) = x_row.split_at(width);
            for ((y, gate), value) in y_row.iter_mut().zip(gate).zip(value) {
                *y = act.eval(*gate) * value;
            }
        }

        Ok(())
    }

    fn add_assign(&self, y: &mut [f32], x: &[f32]) -> Result<(), DeviceError> {
        check_len("add_assign", "x", x.len(), y.len())?;
        let len = y.len();
        let mut y = DVectorViewMut::from_slice(y, len);
        y += DVectorView::from_slice(x, len);
        Ok(())
    }
}
