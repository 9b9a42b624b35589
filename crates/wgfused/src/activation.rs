//! Element-wise activations applied after normalization or inside feed-forward networks.

use crate::error::ConfigError;
use nalgebra::{Dyn, StorageMut, Vector};
use std::str::FromStr;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[non_exhaustive]
/// Listing of all the activations the kernels can fuse.
///
/// The discriminant is the stable identifier passed to the GPU kernels.
pub enum ActivationKind {
    Identity = 0,
    Relu = 1,
    Sigmoid = 2,
    Tanh = 3,
    Gelu = 4,
    // Activations with a numeric parameter.
    LeakyRelu = 5,
    HardSigmoid = 6,
    HardSwish = 7,
    Silu = 8,
}

impl ActivationKind {
    const ALL: [Self; 9] = [
        Self::Identity,
        Self::Relu,
        Self::Sigmoid,
        Self::Tanh,
        Self::Gelu,
        Self::LeakyRelu,
        Self::HardSigmoid,
        Self::HardSwish,
        Self::Silu,
    ];

    /// The stable identifier of this activation.
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// The activation with the stable identifier `id`.
    pub fn from_id(id: i32) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() as i32 == id)
            .ok_or_else(|| ConfigError::UnsupportedActivation(id.to_string()))
    }

    /// Does this activation read its numeric parameter?
    pub const fn has_param(self) -> bool {
        matches!(self, Self::LeakyRelu | Self::HardSigmoid)
    }

    /// The numeric parameter used when none is specified.
    pub const fn default_param(self) -> f32 {
        match self {
            // Negative slope.
            Self::LeakyRelu => 0.02,
            // Slope of the linear section, centered on 0.5.
            Self::HardSigmoid => 0.2,
            _ => 0.0,
        }
    }
}

impl FromStr for ActivationKind {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, ConfigError> {
        match name {
            "identity" | "linear" | "none" => Ok(Self::Identity),
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "gelu" => Ok(Self::Gelu),
            "leaky_relu" => Ok(Self::LeakyRelu),
            "hard_sigmoid" => Ok(Self::HardSigmoid),
            "hard_swish" => Ok(Self::HardSwish),
            "silu" | "swish" => Ok(Self::Silu),
            _ => Err(ConfigError::UnsupportedActivation(name.to_string())),
        }
    }
}

/// An activation together with its numeric parameter.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Activation {
    /// Which function to apply.
    pub kind: ActivationKind,
    /// Negative slope of [`ActivationKind::LeakyRelu`], slope of
    /// [`ActivationKind::HardSigmoid`]. Ignored by the other kinds.
    pub param: f32,
}

impl Default for Activation {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Activation {
    /// The identity function.
    pub const IDENTITY: Self = Self {
        kind: ActivationKind::Identity,
        param: 0.0,
    };

    /// The activation `kind` with its default parameter.
    pub const fn new(kind: ActivationKind) -> Self {
        Self {
            kind,
            param: kind.default_param(),
        }
    }

    /// The activation `kind` with an explicit parameter.
    ///
    /// The parameter is dropped for kinds that don’t use one.
    pub const fn with_param(kind: ActivationKind, param: f32) -> Self {
        if kind.has_param() {
            Self { kind, param }
        } else {
            Self::new(kind)
        }
    }

    /// Leaky rectifier with the given negative slope.
    pub const fn leaky_relu(alpha: f32) -> Self {
        Self::with_param(ActivationKind::LeakyRelu, alpha)
    }

    /// Hard sigmoid `clamp(slope * x + 0.5, 0, 1)`.
    pub const fn hard_sigmoid(slope: f32) -> Self {
        Self::with_param(ActivationKind::HardSigmoid, slope)
    }

    /// Is this the identity function?
    pub fn is_identity(self) -> bool {
        self.kind == ActivationKind::Identity
    }

    /// Evaluates the activation at `x`.
    pub fn eval(self, x: f32) -> f32 {
        match self.kind {
            ActivationKind::Identity => x,
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::Gelu => {
                const GELU_COEF_A: f32 = 0.044715;
                const SQRT_2_OVER_PI: f32 = 0.7978846;
                // Clamped so backends computing tanh through exponentials don’t overflow.
                let inner =
                    (SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).clamp(-10.0, 10.0);
                0.5 * x * (1.0 + inner.tanh())
            }
            ActivationKind::LeakyRelu => x.max(0.0) + x.min(0.0) * self.param,
            ActivationKind::HardSigmoid => (self.param * x + 0.5).clamp(0.0, 1.0),
            ActivationKind::HardSwish => x * ((x + 3.0) / 6.0).clamp(0.0, 1.0),
            ActivationKind::Silu => x / (1.0 + (-x).exp()),
        }
    }

    /// Applies the activation to every component of `vals`.
    pub fn apply<S: StorageMut<f32, Dyn>>(self, vals: &mut Vector<f32, Dyn, S>) {
        if !self.is_identity() {
            vals.apply(|x| *x = self.eval(*x));
        }
    }
}
