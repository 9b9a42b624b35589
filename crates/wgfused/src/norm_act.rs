//! Layer normalization fused with an element-wise activation.

use crate::activation::Activation;
use crate::device::DeviceMath;
use crate::dtype::DType;
use crate::error::{ConfigError, Result};
use crate::registry::{DeviceClass, KernelEntry};
use crate::scratch::ScratchArena;
use crate::tensor::{Tensor, TensorData};
use std::borrow::Cow;

/// Parameters of a [`LayerNormAct`] invocation.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct NormActConfig {
    /// Dimensions from this axis onward are normalized together.
    pub begin_norm_axis: usize,
    /// Added to the variance before taking its square root.
    pub epsilon: f32,
    /// Applied to the normalized values.
    pub activation: Activation,
}

impl Default for NormActConfig {
    fn default() -> Self {
        Self {
            begin_norm_axis: 1,
            epsilon: 1.0e-5,
            activation: Activation::IDENTITY,
        }
    }
}

impl NormActConfig {
    pub(crate) fn check_epsilon(epsilon: f32) -> Result<(), ConfigError> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "epsilon",
                value: epsilon,
                reason: "must be finite and non-negative",
            });
        }
        Ok(())
    }
}

/// How the normalization and the activation are mapped to device calls.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FusionStrategy {
    /// A single call computing both.
    Fused,
    /// A normalization call followed by an in-place activation call.
    TwoPass,
}

impl FusionStrategy {
    /// The fused strategy if the device supports it, the two-pass strategy otherwise.
    pub fn select<D: DeviceMath + ?Sized>(device: &D) -> Self {
        if device.supports_fused_norm_act() {
            Self::Fused
        } else {
            Self::TwoPass
        }
    }
}

/// Layer normalization followed by an activation, on a [`DeviceMath`] device.
///
/// Half-precision and brain-float scale/bias tensors are converted into scratch memory before
/// the device primitives see them. Single-precision ones are used in-place.
pub struct LayerNormAct<'d, D: ?Sized> {
    device: &'d D,
    strategy: FusionStrategy,
    scratch_capacity: Option<usize>,
}

impl<'d, D: DeviceMath + ?Sized> LayerNormAct<'d, D> {
    /// Registration entry of this kernel.
    pub const ENTRY: KernelEntry = KernelEntry {
        name: "layer_norm_act",
        device: DeviceClass::Cpu,
        dtypes: &[DType::F32, DType::F16, DType::BF16],
    };

    /// Creates the kernel with the best strategy available on `device`.
    pub fn new(device: &'d D) -> Self {
        let strategy = FusionStrategy::select(device);
        log::debug!(
            "layer_norm_act: {strategy:?} strategy selected for `{}`",
            device.name()
        );
        Self {
            device,
            strategy,
            scratch_capacity: None,
        }
    }

    /// Creates the kernel with an explicit strategy.
    ///
    /// Fails if the fused strategy is requested on a device that doesn’t support it.
    pub fn with_strategy(device: &'d D, strategy: FusionStrategy) -> Result<Self, ConfigError> {
        if strategy == FusionStrategy::Fused && !device.supports_fused_norm_act() {
            return Err(ConfigError::FusionUnavailable {
                device: device.name().to_string(),
            });
        }

        Ok(Self {
            device,
            strategy,
            scratch_capacity: None,
        })
    }

    /// Limits the scratch memory each call may use, in bytes.
    pub fn with_scratch_capacity(mut self, bytes: usize) -> Self {
        self.scratch_capacity = Some(bytes);
        self
    }

    /// The strategy used by this kernel.
    pub fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    /// Normalizes `x` and applies the configured activation, writing the result to `out`.
    ///
    /// `out` must have the same shape and element type as `x`. An absent `scale` behaves as
    /// ones and an absent `bias` as zeros. Both must contain as many elements as a normalized
    /// row.
    pub fn run(
        &self,
        x: &Tensor,
        scale: Option<&Tensor>,
        bias: Option<&Tensor>,
        config: &NormActConfig,
        out: &mut Tensor,
    ) -> Result<()> {
        NormActConfig::check_epsilon(config.epsilon)?;
        Self::ENTRY.check(x.dtype())?;
        let (left, right) = x.flatten_to_2d(config.begin_norm_axis)?;

        out.expect_shape("out", x.shape())?;
        if out.dtype() != x.dtype() {
            return Err(ConfigError::DTypeMismatch {
                what: "out",
                expected: x.dtype(),
                found: out.dtype(),
            }
            .into());
        }
        for (what, param) in [("scale", scale), ("bias", bias)] {
            if let Some(param) = param {
                if param.len() != right {
                    return Err(ConfigError::ShapeMismatch {
                        what,
                        expected: vec![right],
                        found: param.shape().to_vec(),
                    }
                    .into());
                }
            }
        }

        log::trace!(
            "layer_norm_act: {left}×{right} {} rows, {:?}",
            x.dtype(),
            config.activation
        );

        let arena = ScratchArena::new(self.scratch_capacity);
        let scale = arena.promote_opt(self.device, scale)?;
        let bias = arena.promote_opt(self.device, bias)?;

        let x = match x.data().as_f32() {
            Some(data) => Cow::Borrowed(data),
            None => Cow::Owned(x.to_f32_vec()),
        };

        match out.data_mut() {
            TensorData::F32(y) => self.run_slices(
                &x,
                y,
                left,
                right,
                config.epsilon,
                scale.as_deref(),
                bias.as_deref(),
                config.activation,
            ),
            out => {
                let mut y = vec![0.0; x.len()];
                self.run_slices(
                    &x,
                    &mut y,
                    left,
                    right,
                    config.epsilon,
                    scale.as_deref(),
                    bias.as_deref(),
                    config.activation,
                )?;
                out.write_f32(0, &y);
                Ok(())
            }
        }
    }

    /// Runs the kernel on single-precision buffers with already-promoted parameters.
    pub(crate) fn run_slices(
        &self,
        x: &[f32],
        y: &mut [f32],
        left: usize,
        right: usize,
        epsilon: f32,
        scale: Option<&[f32]>,
        bias: Option<&[f32]>,
        act: Activation,
    ) -> Result<()> {
        match self.strategy {
            FusionStrategy::Fused => self
                .device
                .layer_norm_act(x, y, left, right, epsilon, scale, bias, act)?,
            FusionStrategy::TwoPass => {
                self.device
                    .layer_norm(x, y, left, right, epsilon, scale, bias)?;
                if !act.is_identity() {
                    self.device.activation(y, act)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{FusionStrategy, LayerNormAct, NormActConfig};
    use crate::activation::{Activation, ActivationKind};
    use crate::cpu::CpuDevice;
    use crate::dtype::DType;
    use crate::error::{ConfigError, Error};
    use crate::tensor::Tensor;
    use half::{bf16, f16};
    use nalgebra::{DMatrix, DVector};
    use proptest::prelude::*;

    fn z_scores(x: &DMatrix<f32>, epsilon: f32) -> DMatrix<f32> {
        let mut result = x.clone();
        for mut row in result.row_iter_mut() {
            let mean = row.mean();
            row.add_scalar_mut(-mean);
            let variance = row.norm_squared() / row.len() as f32;
            row /= (variance + epsilon).sqrt();
        }
        result
    }

    fn random_tensor(shape: [usize; 2]) -> (DMatrix<f32>, Tensor) {
        let x = DMatrix::<f32>::new_random(shape[0], shape[1]) * 4.0;
        let t = Tensor::from_f32(shape, x.transpose().as_slice().to_vec()).unwrap();
        (x, t)
    }

    #[test]
    fn normalizes_rows_to_z_scores() {
        let device = CpuDevice::new();
        let (x, x_t) = random_tensor([2, 8]);
        let config = NormActConfig::default();
        let expected = z_scores(&x, config.epsilon);

        for kernel in [
            LayerNormAct::with_strategy(&device, FusionStrategy::Fused).unwrap(),
            LayerNormAct::with_strategy(&device, FusionStrategy::TwoPass).unwrap(),
        ] {
            let mut out = Tensor::zeros([2, 8], DType::F32);
            kernel.run(&x_t, None, None, &config, &mut out).unwrap();
            let result = DMatrix::from_row_slice(2, 8, &out.to_f32_vec());
            approx::assert_relative_eq!(result, expected, epsilon = 1.0e-5);

            for row in result.row_iter() {
                approx::assert_relative_eq!(row.mean(), 0.0, epsilon = 1.0e-5);
            }
        }
    }

    #[test]
    fn scale_bias_and_activation() {
        let device = CpuDevice::new();
        let (x, x_t) = random_tensor([3, 5]);
        let scale = DVector::from_vec(vec![0.5, 1.0, 2.0, -1.0, 3.0]);
        let bias = DVector::from_vec(vec![0.1, -0.2, 0.0, 1.0, -3.0]);
        let config = NormActConfig {
            activation: Activation::leaky_relu(0.1),
            ..Default::default()
        };

        let mut expected = z_scores(&x, config.epsilon);
        for mut row in expected.row_iter_mut() {
            row.component_mul_assign(&scale.transpose());
            row += bias.transpose();
            row.apply(|x| *x = config.activation.eval(*x));
        }

        let scale_t = Tensor::from_f32([5], scale.as_slice().to_vec()).unwrap();
        let bias_t = Tensor::from_f32([5], bias.as_slice().to_vec()).unwrap();
        let mut out = Tensor::zeros([3, 5], DType::F32);
        LayerNormAct::new(&device)
            .run(&x_t, Some(&scale_t), Some(&bias_t), &config, &mut out)
            .unwrap();

        approx::assert_relative_eq!(
            DMatrix::from_row_slice(3, 5, &out.to_f32_vec()),
            expected,
            epsilon = 1.0e-5
        );
    }

    #[test]
    fn absent_parameters_are_identities() {
        let device = CpuDevice::new();
        let kernel = LayerNormAct::new(&device);
        let (_, x) = random_tensor([4, 6]);
        let config = NormActConfig::default();

        let ones = Tensor::from_f32([6], vec![1.0; 6]).unwrap();
        let zeros = Tensor::from_f32([6], vec![0.0; 6]).unwrap();

        let mut implicit = Tensor::zeros([4, 6], DType::F32);
        let mut explicit = Tensor::zeros([4, 6], DType::F32);
        kernel.run(&x, None, None, &config, &mut implicit).unwrap();
        kernel
            .run(&x, Some(&ones), Some(&zeros), &config, &mut explicit)
            .unwrap();
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn reduced_precision_parameters_match_promoted_ones() {
        let device = CpuDevice::new();
        let kernel = LayerNormAct::new(&device);
        let (_, x) = random_tensor([3, 4]);
        let config = NormActConfig {
            activation: Activation::new(ActivationKind::Gelu),
            ..Default::default()
        };

        let scale = [1.5f32, -0.25, 2.0, 0.75];
        let bias = [0.5f32, 0.125, -1.0, 0.0];

        let mut reference = Tensor::zeros([3, 4], DType::F32);
        kernel
            .run(
                &x,
                Some(&Tensor::from_f32([4], scale.to_vec()).unwrap()),
                Some(&Tensor::from_f32([4], bias.to_vec()).unwrap()),
                &config,
                &mut reference,
            )
            .unwrap();

        let halves = (
            Tensor::from_f16([4], scale.map(f16::from_f32).to_vec()).unwrap(),
            Tensor::from_f16([4], bias.map(f16::from_f32).to_vec()).unwrap(),
        );
        let brains = (
            Tensor::from_bf16([4], scale.map(bf16::from_f32).to_vec()).unwrap(),
            Tensor::from_bf16([4], bias.map(bf16::from_f32).to_vec()).unwrap(),
        );

        for (scale, bias) in [halves, brains] {
            let mut out = Tensor::zeros([3, 4], DType::F32);
            kernel
                .run(&x, Some(&scale), Some(&bias), &config, &mut out)
                .unwrap();
            // The parameters are exactly representable so the results must match exactly.
            assert_eq!(out, reference);
        }
    }

    #[test]
    fn output_keeps_input_dtype() {
        let device = CpuDevice::new();
        let kernel = LayerNormAct::new(&device);
        // Exactly representable in every element type.
        let values = (0..24).map(|i| ((i * 7) % 11) as f32 * 0.25 - 1.0).collect();
        let x = Tensor::from_f32([2, 3, 4], values).unwrap();
        let config = NormActConfig {
            begin_norm_axis: 2,
            ..Default::default()
        };

        let mut reference = Tensor::zeros([2, 3, 4], DType::F32);
        kernel.run(&x, None, None, &config, &mut reference).unwrap();

        for dtype in [DType::F16, DType::BF16] {
            let x = x.to_dtype(dtype);
            let mut out = Tensor::zeros([2, 3, 4], dtype);
            kernel.run(&x, None, None, &config, &mut out).unwrap();
            assert_eq!(out.shape(), x.shape());
            assert_eq!(out.dtype(), dtype);
            approx::assert_relative_eq!(
                DVector::from(out.to_f32_vec()),
                DVector::from(reference.to_f32_vec()),
                epsilon = dtype.epsilon() * 10.0,
                max_relative = dtype.epsilon() * 10.0
            );
        }

        let mut wrong_dtype = Tensor::zeros([2, 3, 4], DType::F16);
        assert!(matches!(
            kernel.run(&x, None, None, &config, &mut wrong_dtype),
            Err(Error::Config(ConfigError::DTypeMismatch { what: "out", .. }))
        ));
        let mut wrong_shape = Tensor::zeros([6, 4], DType::F32);
        assert!(matches!(
            kernel.run(&x, None, None, &config, &mut wrong_shape),
            Err(Error::Config(ConfigError::ShapeMismatch { what: "out", .. }))
        ));
    }

    #[test]
    fn invalid_configurations() {
        let device = CpuDevice::unfused();
        assert_eq!(
            LayerNormAct::new(&device).strategy(),
            FusionStrategy::TwoPass
        );
        assert!(matches!(
            LayerNormAct::with_strategy(&device, FusionStrategy::Fused),
            Err(ConfigError::FusionUnavailable { .. })
        ));

        let kernel = LayerNormAct::new(&device);
        let (_, x) = random_tensor([2, 4]);
        let mut out = Tensor::zeros([2, 4], DType::F32);

        let axis = NormActConfig {
            begin_norm_axis: 2,
            ..Default::default()
        };
        assert!(matches!(
            kernel.run(&x, None, None, &axis, &mut out),
            Err(Error::Config(ConfigError::InvalidAxis { axis: 2, rank: 2 }))
        ));

        let epsilon = NormActConfig {
            epsilon: -1.0,
            ..Default::default()
        };
        assert!(kernel.run(&x, None, None, &epsilon, &mut out).is_err());

        let scale = Tensor::from_f32([3], vec![1.0; 3]).unwrap();
        assert!(matches!(
            kernel.run(&x, Some(&scale), None, &Default::default(), &mut out),
            Err(Error::Config(ConfigError::ShapeMismatch { what: "scale", .. }))
        ));
    }

    #[test]
    fn scratch_capacity_is_enforced() {
        let device = CpuDevice::new();
        let (_, x) = random_tensor([2, 16]);
        let scale = Tensor::from_f16([16], vec![f16::ONE; 16]).unwrap();
        let bias = Tensor::from_f16([16], vec![f16::ZERO; 16]).unwrap();
        let mut out = Tensor::zeros([2, 16], DType::F32);
        let config = NormActConfig::default();

        // Room for the promoted scale only.
        let kernel = LayerNormAct::new(&device).with_scratch_capacity(16 * 4);
        assert!(kernel
            .run(&x, Some(&scale), None, &config, &mut out)
            .is_ok());
        assert!(matches!(
            kernel.run(&x, Some(&scale), Some(&bias), &config, &mut out),
            Err(Error::Scratch { requested: 64, .. })
        ));
    }

    fn rows_and_params() -> impl Strategy<Value = (usize, usize, Vec<f32>, Vec<f32>, Vec<f32>, i32)>
    {
        (1usize..5, 1usize..48).prop_flat_map(|(left, right)| {
            (
                Just(left),
                Just(right),
                prop::collection::vec(-10.0f32..10.0, left * right),
                prop::collection::vec(0.25f32..2.0, right),
                prop::collection::vec(-1.0f32..1.0, right),
                0i32..9,
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn fused_and_two_pass_strategies_agree(
            (left, right, x, scale, bias, act) in rows_and_params(),
            leaky_slope in 0.0f32..0.5,
        ) {
            let device = CpuDevice::new();
            let kind = ActivationKind::from_id(act).unwrap();
            let config = NormActConfig {
                activation: Activation::with_param(kind, leaky_slope),
                ..Default::default()
            };
            let x = Tensor::from_f32([left, right], x).unwrap();
            let scale = Tensor::from_f32([right], scale).unwrap();
            let bias = Tensor::from_f32([right], bias).unwrap();

            let mut fused = Tensor::zeros([left, right], DType::F32);
            let mut two_pass = Tensor::zeros([left, right], DType::F32);
            LayerNormAct::with_strategy(&device, FusionStrategy::Fused)
                .unwrap()
                .run(&x, Some(&scale), Some(&bias), &config, &mut fused)
                .unwrap();
            LayerNormAct::with_strategy(&device, FusionStrategy::TwoPass)
                .unwrap()
                .run(&x, Some(&scale), Some(&bias), &config, &mut two_pass)
                .unwrap();

            for (a, b) in fused.to_f32_vec().iter().zip(two_pass.to_f32_vec()) {
                prop_assert!(approx::relative_eq!(*a, b, epsilon = 1.0e-5, max_relative = 1.0e-5));
            }
        }
    }
}
