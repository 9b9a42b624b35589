//! The narrow set of math primitives the fused kernels are built from.

use crate::activation::Activation;
use crate::error::DeviceError;
use crate::tensor::TensorData;

/// Math primitives of a compute device.
///
/// All buffers are single-precision and row-major. Reduced-precision tensors reach these
/// primitives only after going through [`DeviceMath::cast_to_f32`].
pub trait DeviceMath {
    /// A human-readable name for this device, used in diagnostics.
    fn name(&self) -> &str;

    /// Does this device implement [`DeviceMath::layer_norm_act`]?
    fn supports_fused_norm_act(&self) -> bool {
        false
    }

    /// Widens every element of `src` into `dst`.
    fn cast_to_f32(&self, src: &TensorData, dst: &mut [f32]) -> Result<(), DeviceError>;

    /// Normalizes each of the `left` rows of `right` elements of `x` into `y`.
    ///
    /// Absent `scale` and `bias` behave as ones and zeros.
    fn layer_norm(
        &self,
        x: &[f32],
        y: &mut [f32],
        left: usize,
        right: usize,
        epsilon: f32,
        scale: Option<&[f32]>,
        bias: Option<&[f32]>,
    ) -> Result<(), DeviceError>;

    /// Applies `act` in-place to every element of `y`.
    fn activation(&self, y: &mut [f32], act: Activation) -> Result<(), DeviceError>;

    /// [`DeviceMath::layer_norm`] followed by `act`, in a single pass over the data.
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
        let _ = (x, y, left, right, epsilon, scale, bias, act);
        Err(DeviceError::unsupported("layer_norm_act"))
    }

    /// Computes the `m × n` matrix `y = x · w` where `x` is `m × k`.
    ///
    /// `w` is stored as a `k × n` matrix, or as an `n × k` matrix if `trans_w` is `true`.
    fn matmul(
        &self,
        x: &[f32],
        w: &[f32],
        y: &mut [f32],
        m: usize,
        k: usize,
        n: usize,
        trans_w: bool,
    ) -> Result<(), DeviceError>;

    /// Adds `bias` to every row of `width` elements of `y`, then applies `act`.
    fn bias_act(
        &self,
        y: &mut [f32],
        width: usize,
        bias: Option<&[f32]>,
        act: Activation,
    ) -> Result<(), DeviceError>;

    /// Gated linear unit: for every row of `x` made of a gate half followed by a value half of
    /// `width` elements each, writes `act(gate) * value` into the matching row of `y`.
    fn gated_act(
        &self,
        x: &[f32],
        y: &mut [f32],
        width: usize,
        act: Activation,
    ) -> Result<(), DeviceError>;

    /// Computes `y += x` element-wise.
    fn add_assign(&self, y: &mut [f32], x: &[f32]) -> Result<(), DeviceError>;
}

pub(crate) fn check_len(
    op: &'static str,
    what: &str,
    len: usize,
    expected: usize,
) -> Result<(), DeviceError> {
    if len != expected {
        return Err(DeviceError::new(
            op,
            format!("`{what}` has {len} elements, expected {expected}"),
        ));
    }
    Ok(())
}
