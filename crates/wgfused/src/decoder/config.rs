//! Configuration of the decoder stack.

use crate::activation::{Activation, ActivationKind};
use crate::error::ConfigError;
use crate::norm_act::NormActConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// How dropout scales the residual branches.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropoutImplementation {
    /// Kept values are unchanged during training and scaled by `1 - rate` at inference.
    #[default]
    DowngradeInInfer,
    /// Kept values are scaled by `1 / (1 - rate)` during training and unchanged at inference.
    UpscaleInTrain,
}

/// Attributes of a [`super::FusedMultiTransformer`].
///
/// Field names match the attribute names of the serialized operator.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Normalize the input of each block (`true`) or the residual sum after it (`false`).
    pub pre_layer_norm: bool,
    /// Added to the variances of every normalization.
    pub epsilon: f32,
    /// Probability of dropping an element of a residual branch.
    pub dropout_rate: f32,
    /// Number of rotary embeddings applied to the queries and keys (0 or 1).
    pub rotary_emb_dims: i32,
    /// Inference mode: dropout draws no random numbers.
    pub is_test: bool,
    /// Name of the feed-forward activation.
    pub act_method: String,
    /// Numeric parameter of the feed-forward activation, if it takes one.
    pub act_param: Option<f32>,
    /// Dropout scaling convention.
    pub dropout_implementation: DropoutImplementation,
    /// Whether the fused query/key/value weight is stored as `[3, heads, head_dim, embed]`
    /// instead of `[embed, 3, heads, head_dim]`.
    pub trans_qkvw: bool,
    /// Tensor-parallel ring the partial sums are reduced on. Negative disables the reduction.
    pub ring_id: i32,
    /// Seed of the training-mode dropout masks.
    pub seed: Option<u64>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            pre_layer_norm: true,
            epsilon: 1.0e-5,
            dropout_rate: 0.0,
            rotary_emb_dims: 0,
            is_test: true,
            act_method: "gelu".to_string(),
            act_param: None,
            dropout_implementation: DropoutImplementation::DowngradeInInfer,
            trans_qkvw: true,
            ring_id: -1,
            seed: None,
        }
    }
}

impl DecoderConfig {
    /// Checks every attribute and resolves the feed-forward activation.
    pub fn validate(&self) -> Result<FeedForwardActivation, ConfigError> {
        NormActConfig::check_epsilon(self.epsilon)?;

        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ConfigError::InvalidValue {
                name: "dropout_rate",
                value: self.dropout_rate,
                reason: "must be in [0, 1)",
            });
        }

        if !matches!(self.rotary_emb_dims, 0 | 1) {
            return Err(ConfigError::UnsupportedRotaryDims(self.rotary_emb_dims));
        }

        FeedForwardActivation::parse(&self.act_method, self.act_param)
    }
}

/// The activation of the feed-forward network.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FeedForwardActivation {
    /// The element-wise activation.
    pub act: Activation,
    /// Gated variants split the expansion in two halves and multiply the activated first half
    /// with the second one.
    pub gated: bool,
}

impl FeedForwardActivation {
    /// Resolves an activation name, with an optional numeric parameter.
    pub fn parse(name: &str, param: Option<f32>) -> Result<Self, ConfigError> {
        let (kind, gated) = match name {
            "geglu" => (ActivationKind::Gelu, true),
            "swiglu" => (ActivationKind::Silu, true),
            name => (name.parse::<ActivationKind>()?, false),
        };

        let act = match param {
            Some(param) => Activation::with_param(kind, param),
            None => Activation::new(kind),
        };

        Ok(Self { act, gated })
    }

    /// Number of expansion columns needed for an activated width of `ffn_dim`.
    pub fn expansion_width(&self, ffn_dim: usize) -> usize {
        if self.gated {
            ffn_dim * 2
        } else {
            ffn_dim
        }
    }
}

/// Dropout applied to the residual branches.
pub(crate) struct Dropout {
    rate: f32,
    implementation: DropoutImplementation,
    rng: Option<StdRng>,
}

impl Dropout {
    pub fn new(config: &DecoderConfig) -> Self {
        let training = !config.is_test && config.dropout_rate > 0.0;
        Self {
            rate: config.dropout_rate,
            implementation: config.dropout_implementation,
            rng: training.then(|| StdRng::seed_from_u64(config.seed.unwrap_or(0))),
        }
    }

    pub fn apply(&mut self, vals: &mut [f32]) {
        let keep = 1.0 - self.rate;

        match (&mut self.rng, self.implementation) {
            (None, DropoutImplementation::DowngradeInInfer) => {
                if self.rate > 0.0 {
                    vals.iter_mut().for_each(|x| *x *= keep);
                }
            }
            (None, DropoutImplementation::UpscaleInTrain) => {}
            (Some(rng), implementation) => {
                let scale = match implementation {
                    DropoutImplementation::DowngradeInInfer => 1.0,
                    DropoutImplementation::UpscaleInTrain => 1.0 / keep,
                };
                for x in vals {
                    *x = if rng.gen::<f32>() < self.rate {
                        0.0
                    } else {
                        *x * scale
                    };
                }
            }
        }
    }
}
