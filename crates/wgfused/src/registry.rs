//! Registration of the kernels with the element types they accept on each device class.

use crate::dtype::DType;
use crate::error::ConfigError;
use std::collections::HashMap;
use std::fmt;

/// The class of device a kernel runs on.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DeviceClass {
    /// The host, through a [`crate::device::DeviceMath`] implementation.
    Cpu,
    /// A wgpu device.
    Gpu,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeviceClass {
    /// Lowercase name of the device class.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

/// A kernel, the device class it runs on, and the element types of the tensors it accepts.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct KernelEntry {
    /// Name of the kernel.
    pub name: &'static str,
    /// The device class it runs on.
    pub device: DeviceClass,
    /// The supported element types.
    pub dtypes: &'static [DType],
}

impl KernelEntry {
    /// Does this kernel accept tensors of type `dtype`?
    pub fn supports(&self, dtype: DType) -> bool {
        self.dtypes.contains(&dtype)
    }

    /// Fails with [`ConfigError::UnsupportedDType`] if this kernel doesn’t accept `dtype`.
    pub fn check(&self, dtype: DType) -> Result<(), ConfigError> {
        if !self.supports(dtype) {
            return Err(ConfigError::UnsupportedDType {
                kernel: self.name,
                device: self.device.as_str(),
                dtype,
            });
        }
        Ok(())
    }
}

/// A set of kernels, indexed by name and device class.
#[derive(Default, Clone, Debug)]
pub struct KernelRegistry {
    entries: HashMap<(&'static str, DeviceClass), KernelEntry>,
}

impl KernelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry containing every kernel of this crate.
    pub fn with_builtin_kernels() -> Self {
        let mut registry = Self::new();
        registry.register(crate::norm_act::LayerNormAct::<crate::cpu::CpuDevice>::ENTRY);
        registry.register(crate::gpu::GpuLayerNormAct::ENTRY);
        registry.register(
            crate::decoder::FusedMultiTransformer::<
                crate::cpu::CpuDevice,
                crate::parallel::SingleProcess,
            >::ENTRY,
        );
        registry
    }

    /// Registers a kernel, replacing any entry with the same name and device class.
    pub fn register(&mut self, entry: KernelEntry) {
        log::debug!(
            "registering kernel `{}` on {} for {:?}",
            entry.name,
            entry.device,
            entry.dtypes
        );
        self.entries.insert((entry.name, entry.device), entry);
    }

    /// The entry of the kernel `name` on the device class `device`.
    pub fn lookup(&self, name: &str, device: DeviceClass) -> Option<&KernelEntry> {
        self.entries
            .values()
            .find(|entry| entry.name == name && entry.device == device)
    }

    /// Number of registered kernels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
