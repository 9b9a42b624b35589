use wgcore::Shader;
use wgpu::ComputePipeline;

#[derive(Shader)]
#[shader(src = "activation.wgsl")]
/// Activation functions, imported by the normalization kernels.
pub(crate) struct WgActivation;

#[derive(Shader)]
#[shader(derive(WgActivation), src = "layer_norm_act.wgsl", composable = false)]
/// Row normalization, with or without the activation applied in the same kernel.
pub(crate) struct WgLayerNormAct {
    /// Normalizes and activates one row per workgroup.
    pub layer_norm_act: ComputePipeline,
    /// Normalizes one row per workgroup.
    pub layer_norm: ComputePipeline,
    /// Activates the output in place, one element per thread.
    pub activation: ComputePipeline,
}

#[derive(Shader)]
#[shader(src = "cast.wgsl", composable = false)]
/// Widening of packed 16-bit parameters to single precision.
pub(crate) struct WgCast {
    pub cast_to_f32: ComputePipeline,
}

#[cfg(test)]
mod test {
    use super::{WgActivation, WgCast, WgLayerNormAct};
    use naga_oil::compose::NagaModuleDescriptor;
    use wgcore::gpu::GpuInstance;
    use wgcore::Shader;

    #[test]
    fn normalization_kernels_compose() {
        let composer = WgActivation::composer().unwrap();
        assert!(composer.contains_module("wgfused::activation"));

        let module = WgLayerNormAct::composer()
            .unwrap()
            .make_naga_module(NagaModuleDescriptor {
                source: &WgLayerNormAct::src(),
                file_path: WgLayerNormAct::FILE_PATH,
                ..Default::default()
            })
            .unwrap();
        for entry in ["layer_norm_act", "layer_norm", "activation"] {
            assert!(
                module.entry_points.iter().any(|e| e.name == entry),
                "missing entry point {entry}"
            );
        }
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn pipelines_build() {
        let gpu = GpuInstance::new().await.unwrap();
        WgLayerNormAct::from_device(gpu.device()).unwrap();
        WgCast::from_device(gpu.device()).unwrap();
    }
}
