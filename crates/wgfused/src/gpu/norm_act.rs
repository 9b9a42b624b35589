use super::shaders::{WgCast, WgLayerNormAct};
use super::{GpuElement, GpuParam};
use crate::dtype::DType;
use crate::error::{ConfigError, DeviceError, Result};
use crate::norm_act::{FusionStrategy, NormActConfig};
use crate::registry::{DeviceClass, KernelEntry};
use crate::tensor::flatten_to_2d;
use bytemuck::{Pod, Zeroable};
use naga_oil::compose::ComposerError;
use wgcore::kernel::KernelDispatch;
use wgcore::tensor::{GpuScalar, GpuTensor, GpuVector};
use wgcore::Shader;
use wgpu::{Buffer, BufferUsages, ComputePass, Device};

const ELEMENTWISE_WORKGROUP_SIZE: u32 = 64;
// Must match the constant of the same name in the kernels.
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct NormActParams {
    left: u32,
    right: u32,
    epsilon: f32,
    has_scale: u32,
    has_bias: u32,
    act_kind: u32,
    act_param: f32,
    _pad: u32,
}

#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
struct CastParams {
    len: u32,
    format: u32,
    _pad: [u32; 2],
}

/// Spreads `count` workgroups over the first two dispatch dimensions.
///
/// The kernels recover the linear workgroup index as `id.x + id.y * MAX_WORKGROUPS_PER_DIM`
/// and discard indices greater than or equal to `count`.
fn linear_workgroups(count: u32) -> [u32; 3] {
    [
        count.min(MAX_WORKGROUPS_PER_DIM),
        count.div_ceil(MAX_WORKGROUPS_PER_DIM),
        1,
    ]
}

/// Splits `shape` at `axis` into `(rows, row length)`.
///
/// Fails if the kernels could not index every element with 32-bit integers.
fn dispatch_dims(shape: &[usize], axis: usize) -> Result<(u32, u32)> {
    let (left, right) = flatten_to_2d(shape, axis)?;
    let too_large = || {
        DeviceError::new(
            "layer_norm_act",
            format!("{left}×{right} elements exceed the 32-bit indexing of the kernels"),
        )
    };

    let elements = left.checked_mul(right).ok_or_else(too_large)?;
    match (
        u32::try_from(left),
        u32::try_from(right),
        u32::try_from(elements),
    ) {
        (Ok(left), Ok(right), Ok(_)) => Ok((left, right)),
        _ => Err(too_large().into()),
    }
}

/// A single-precision parameter buffer, either the caller’s or a widened scratch copy.
enum ParamBuffer<'a> {
    Borrowed(&'a Buffer),
    Promoted(GpuVector<f32>),
}

impl ParamBuffer<'_> {
    fn buffer(&self) -> &Buffer {
        match self {
            Self::Borrowed(buffer) => buffer,
            Self::Promoted(scratch) => scratch.buffer(),
        }
    }
}

/// Layer normalization followed by an activation, on a wgpu device.
///
/// The input and output tensors are single-precision. The scale and bias can be single,
/// half-precision or brain-float: reduced-precision ones are widened into a scratch storage
/// buffer by a cast kernel queued in the same compute pass.
pub struct GpuLayerNormAct {
    kernels: WgLayerNormAct,
    cast: WgCast,
    // Bound in place of an absent scale or bias.
    placeholder: GpuVector<f32>,
    strategy: FusionStrategy,
}

impl GpuLayerNormAct {
    /// Registration entry of this kernel.
    pub const ENTRY: KernelEntry = KernelEntry {
        name: "layer_norm_act",
        device: DeviceClass::Gpu,
        dtypes: &[DType::F32],
    };

    /// Compiles the kernel’s pipelines on `device`.
    pub fn from_device(device: &Device) -> Result<Self, ComposerError> {
        Ok(Self {
            kernels: WgLayerNormAct::from_device(device)?,
            cast: WgCast::from_device(device)?,
            placeholder: GpuVector::uninit(device, 1, BufferUsages::STORAGE),
            strategy: FusionStrategy::Fused,
        })
    }

    /// Uses `strategy` instead of the fused kernel.
    pub fn with_strategy(mut self, strategy: FusionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The strategy used by this kernel.
    pub fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    /// Queues the normalization of `x` followed by the configured activation into `pass`.
    ///
    /// `out` must have the same shape as `x`, and must not share its buffer. The results are
    /// available once the pass has been submitted and executed.
    pub fn dispatch<T: GpuElement, const DIM: usize>(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        x: &GpuTensor<T, DIM>,
        scale: Option<GpuParam>,
        bias: Option<GpuParam>,
        config: &NormActConfig,
        out: &GpuTensor<T, DIM>,
    ) -> Result<()> {
        NormActConfig::check_epsilon(config.epsilon)?;
        Self::ENTRY.check(T::DTYPE)?;
        let shape = x.shape().map(|d| d as usize);
        let (left, right) = dispatch_dims(&shape, config.begin_norm_axis)?;

        if out.shape() != x.shape() {
            return Err(ConfigError::ShapeMismatch {
                what: "out",
                expected: shape.to_vec(),
                found: out.shape().map(|d| d as usize).to_vec(),
            }
            .into());
        }
        for (what, param) in [("scale", scale), ("bias", bias)] {
            if let Some(param) = param {
                if param.len() != right as u64 {
                    return Err(ConfigError::ShapeMismatch {
                        what,
                        expected: vec![right as usize],
                        found: vec![param.len() as usize],
                    }
                    .into());
                }
            }
        }

        let scale = scale.map(|s| self.promote(device, pass, s, right));
        let bias = bias.map(|b| self.promote(device, pass, b, right));

        let params = NormActParams {
            left,
            right,
            epsilon: config.epsilon,
            has_scale: scale.is_some() as u32,
            has_bias: bias.is_some() as u32,
            act_kind: config.activation.kind.id(),
            act_param: config.activation.param,
            _pad: 0,
        };
        let params = GpuScalar::init(device, params, BufferUsages::UNIFORM);

        let bindings = [
            (params.buffer(), 0),
            (x.buffer(), 1),
            (scale.as_ref().map_or(self.placeholder.buffer(), ParamBuffer::buffer), 2),
            (bias.as_ref().map_or(self.placeholder.buffer(), ParamBuffer::buffer), 3),
            (out.buffer(), 4),
        ];

        log::trace!(
            "layer_norm_act: queueing {left}×{right} rows with the {:?} strategy",
            self.strategy
        );

        match self.strategy {
            FusionStrategy::Fused => {
                KernelDispatch::new(device, pass, &self.kernels.layer_norm_act)
                    .bind_at(0, bindings)
                    .dispatch(linear_workgroups(left));
            }
            FusionStrategy::TwoPass => {
                KernelDispatch::new(device, pass, &self.kernels.layer_norm)
                    .bind_at(0, bindings)
                    .dispatch(linear_workgroups(left));

                if !config.activation.is_identity() {
                    // `dispatch_dims` checked that the product fits.
                    let workgroups = (left * right).div_ceil(ELEMENTWISE_WORKGROUP_SIZE);
                    KernelDispatch::new(device, pass, &self.kernels.activation)
                        .bind_at(0, [(params.buffer(), 0), (out.buffer(), 4)])
                        .dispatch(linear_workgroups(workgroups));
                }
            }
        }

        Ok(())
    }

    fn promote<'a>(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        param: GpuParam<'a>,
        len: u32,
    ) -> ParamBuffer<'a> {
        let format = match param {
            GpuParam::F32(v) => return ParamBuffer::Borrowed(v.buffer()),
            GpuParam::F16(_) => 1,
            GpuParam::BF16(_) => 2,
        };

        log::debug!(
            "layer_norm_act: widening a {} parameter of {len} elements",
            param.dtype()
        );

        let scratch = GpuVector::uninit(device, len, BufferUsages::STORAGE);
        let params = CastParams {
            len,
            format,
            _pad: [0; 2],
        };
        let params = GpuScalar::init(device, params, BufferUsages::UNIFORM);

        KernelDispatch::new(device, pass, &self.cast.cast_to_f32)
            .bind0([params.buffer(), param.buffer(), scratch.buffer()])
            .dispatch(linear_workgroups(len.div_ceil(ELEMENTWISE_WORKGROUP_SIZE)));

        ParamBuffer::Promoted(scratch)
    }
}

#[cfg(test)]
mod test {
    use super::{dispatch_dims, linear_workgroups, GpuLayerNormAct, MAX_WORKGROUPS_PER_DIM};
    use crate::activation::{Activation, ActivationKind};
    use crate::cpu::CpuDevice;
    use crate::dtype::DType;
    use crate::error::{ConfigError, Error};
    use crate::gpu::GpuParam;
    use crate::norm_act::{FusionStrategy, LayerNormAct, NormActConfig};
    use crate::tensor::Tensor;
    use half::{bf16, f16};
    use nalgebra::DVector;
    use wgcore::gpu::GpuInstance;
    use wgcore::kernel::CommandEncoderExt;
    use wgcore::tensor::{GpuVector, TensorBuilder};
    use wgpu::BufferUsages;

    const LEFT: u32 = 37;
    // Larger than the workgroup size so every thread handles several elements.
    const RIGHT: u32 = 300;

    #[test]
    fn workgroups_spill_into_second_dimension() {
        assert_eq!(linear_workgroups(0), [0, 0, 1]);
        assert_eq!(linear_workgroups(10), [10, 1, 1]);
        assert_eq!(
            linear_workgroups(MAX_WORKGROUPS_PER_DIM + 1),
            [MAX_WORKGROUPS_PER_DIM, 2, 1]
        );
    }

    #[test]
    fn kernels_use_the_same_workgroup_limit() {
        let limit = format!("const MAX_WORKGROUPS_PER_DIM: u32 = {MAX_WORKGROUPS_PER_DIM};");
        assert!(include_str!("layer_norm_act.wgsl").contains(&limit));
        assert!(include_str!("cast.wgsl").contains(&limit));
    }

    #[test]
    fn element_count_must_fit_32_bit_indices() {
        // Both dimensions fit but their product does not.
        assert!(matches!(
            dispatch_dims(&[65536, 65536], 1),
            Err(Error::Device(_))
        ));
        assert!(matches!(
            dispatch_dims(&[1, u32::MAX as usize + 1], 1),
            Err(Error::Device(_))
        ));
        assert_eq!(dispatch_dims(&[65535, 65537], 1).unwrap(), (65535, 65537));
        assert_eq!(dispatch_dims(&[3, 4, 5], 1).unwrap(), (3, 20));
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn gpu_layer_norm_act() {
        let gpu = GpuInstance::new().await.unwrap();
        let device = gpu.device();

        let n = (LEFT * RIGHT) as usize;
        let x = DVector::<f32>::new_random(n).add_scalar(-0.5) * 8.0;
        let scale: Vec<_> = (0..RIGHT)
            .map(|i| f16::from_f32(0.5 + (i % 7) as f32 * 0.25))
            .collect();
        let bias: Vec<_> = (0..RIGHT)
            .map(|i| bf16::from_f32((i % 5) as f32 * 0.5 - 1.0))
            .collect();

        let gpu_x = TensorBuilder::tensor([LEFT, RIGHT], BufferUsages::STORAGE)
            .build_init(device, x.as_slice());
        let gpu_scale = GpuVector::init(device, &scale, BufferUsages::STORAGE);
        let gpu_bias = GpuVector::init(device, &bias, BufferUsages::STORAGE);
        let gpu_out = TensorBuilder::tensor(
            [LEFT, RIGHT],
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        )
        .build::<f32>(device);
        let staging = TensorBuilder::tensor(
            [LEFT, RIGHT],
            BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        )
        .build::<f32>(device);

        let x = Tensor::from_f32([LEFT as usize, RIGHT as usize], x.as_slice().to_vec()).unwrap();
        let scale = Tensor::from_f16([RIGHT as usize], scale).unwrap();
        let bias = Tensor::from_bf16([RIGHT as usize], bias).unwrap();

        let cpu_device = CpuDevice::new();
        let activations = [
            Activation::new(ActivationKind::Gelu),
            Activation::leaky_relu(0.1),
            Activation::hard_sigmoid(0.2),
            Activation::IDENTITY,
        ];

        for strategy in [FusionStrategy::Fused, FusionStrategy::TwoPass] {
            let kernel = GpuLayerNormAct::from_device(device)
                .unwrap()
                .with_strategy(strategy);

            for activation in activations {
                let config = NormActConfig {
                    activation,
                    ..Default::default()
                };

                let mut expected = Tensor::zeros(x.shape(), DType::F32);
                LayerNormAct::new(&cpu_device)
                    .run(&x, Some(&scale), Some(&bias), &config, &mut expected)
                    .unwrap();

                let mut encoder = device.create_command_encoder(&Default::default());
                let mut pass = encoder.compute_pass("layer_norm_act", None);
                kernel
                    .dispatch(
                        device,
                        &mut pass,
                        &gpu_x,
                        Some(GpuParam::from(&gpu_scale)),
                        Some(GpuParam::from(&gpu_bias)),
                        &config,
                        &gpu_out,
                    )
                    .unwrap();
                drop(pass); // Ensure the pass is ended before the encoder is borrowed again.

                staging.copy_from(&mut encoder, &gpu_out);
                gpu.queue().submit(Some(encoder.finish()));

                let result = staging.read(device).await.unwrap();
                approx::assert_relative_eq!(
                    DVector::from_vec(result),
                    DVector::from_vec(expected.to_f32_vec()),
                    epsilon = 1.0e-4
                );
            }
        }
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn gpu_rejects_reduced_precision_inputs() {
        let gpu = GpuInstance::new().await.unwrap();
        let device = gpu.device();
        let kernel = GpuLayerNormAct::from_device(device).unwrap();

        let x = TensorBuilder::tensor([2, 4], BufferUsages::STORAGE)
            .build_init(device, &[f16::ZERO; 8]);
        let out = TensorBuilder::tensor([2, 4], BufferUsages::STORAGE).build::<f16>(device);

        let mut encoder = device.create_command_encoder(&Default::default());
        let mut pass = encoder.compute_pass("layer_norm_act", None);
        let err = kernel
            .dispatch(
                device,
                &mut pass,
                &x,
                None,
                None,
                &Default::default(),
                &out,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnsupportedDType {
                dtype: DType::F16,
                ..
            })
        ));
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn gpu_parameter_lengths_are_checked() {
        let gpu = GpuInstance::new().await.unwrap();
        let device = gpu.device();
        let kernel = GpuLayerNormAct::from_device(device).unwrap();

        let x = TensorBuilder::tensor([2, 4], BufferUsages::STORAGE)
            .build_init(device, &[0.0f32; 8]);
        let out = TensorBuilder::tensor([2, 4], BufferUsages::STORAGE).build::<f32>(device);
        let scale = GpuVector::init(device, [f16::ONE; 3], BufferUsages::STORAGE);

        let mut encoder = device.create_command_encoder(&Default::default());
        let mut pass = encoder.compute_pass("layer_norm_act", None);
        let err = kernel
            .dispatch(
                device,
                &mut pass,
                &x,
                Some(GpuParam::from(&scale)),
                None,
                &Default::default(),
                &out,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ShapeMismatch { what: "scale", .. })
        ));
    }
}
