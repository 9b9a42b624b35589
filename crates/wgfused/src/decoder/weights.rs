//! Validation of the per-layer parameter collections.

use super::config::{DecoderConfig, FeedForwardActivation};
use super::KERNEL;
use crate::error::ConfigError;
use crate::tensor::Tensor;

/// The parameters of every layer, one entry per layer in each collection.
///
/// Entry `i` of every collection belongs to layer `i`. Absent normalization parameters behave
/// as a unit scale and a zero shift, absent biases as zeros.
#[derive(Clone, Debug, Default)]
pub struct LayerCollections<'a> {
    /// Attention normalization scales, `[E]`.
    pub ln_scales: Vec<Option<&'a Tensor>>,
    /// Attention normalization biases, `[E]`.
    pub ln_biases: Vec<Option<&'a Tensor>>,
    /// Fused query/key/value projections, `[3, H, D, E]` or `[E, 3, H, D]` (see
    /// [`DecoderConfig::trans_qkvw`]).
    pub qkv_weights: Vec<&'a Tensor>,
    /// Fused query/key/value biases, `[3, H, D]`.
    pub qkv_biases: Vec<Option<&'a Tensor>>,
    /// Attention output projections, `[H * D, E]`.
    pub out_linear_weights: Vec<&'a Tensor>,
    /// Attention output biases, `[E]`.
    pub out_linear_biases: Vec<Option<&'a Tensor>>,
    /// Feed-forward normalization scales, `[E]`.
    pub ffn_ln_scales: Vec<Option<&'a Tensor>>,
    /// Feed-forward normalization biases, `[E]`.
    pub ffn_ln_biases: Vec<Option<&'a Tensor>>,
    /// Feed-forward expansions, `[E, F]` (`[E, 2F]` for gated activations).
    pub ffn1_weights: Vec<&'a Tensor>,
    /// Feed-forward expansion biases.
    pub ffn1_biases: Vec<Option<&'a Tensor>>,
    /// Feed-forward contractions, `[F, E]`.
    pub ffn2_weights: Vec<&'a Tensor>,
    /// Feed-forward contraction biases, `[E]`.
    pub ffn2_biases: Vec<Option<&'a Tensor>>,
}

/// The parameters of a single layer.
///
/// See [`LayerCollections`] for the shape of each parameter.
#[derive(Copy, Clone, Debug)]
pub struct LayerWeights<'a> {
    /// Attention normalization scale.
    pub ln_scale: Option<&'a Tensor>,
    /// Attention normalization bias.
    pub ln_bias: Option<&'a Tensor>,
    /// Fused query/key/value projection.
    pub qkv_weight: &'a Tensor,
    /// Fused query/key/value bias.
    pub qkv_bias: Option<&'a Tensor>,
    /// Attention output projection.
    pub out_linear_weight: &'a Tensor,
    /// Attention output bias.
    pub out_linear_bias: Option<&'a Tensor>,
    /// Feed-forward normalization scale.
    pub ffn_ln_scale: Option<&'a Tensor>,
    /// Feed-forward normalization bias.
    pub ffn_ln_bias: Option<&'a Tensor>,
    /// Feed-forward expansion.
    pub ffn1_weight: &'a Tensor,
    /// Feed-forward expansion bias.
    pub ffn1_bias: Option<&'a Tensor>,
    /// Feed-forward contraction.
    pub ffn2_weight: &'a Tensor,
    /// Feed-forward contraction bias.
    pub ffn2_bias: Option<&'a Tensor>,
}

/// Dimensions of the model, as seen by one tensor-parallel participant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModelDims {
    /// Model width `E`.
    pub embed: usize,
    /// Number of local attention heads `H`.
    pub heads: usize,
    /// Width of each head `D`.
    pub head_dim: usize,
    /// Local activated feed-forward width `F`.
    pub ffn: usize,
}

/// Per-layer parameters checked against each other and against a [`DecoderConfig`].
#[derive(Clone, Debug)]
pub struct DecoderWeights<'a> {
    layers: Vec<LayerWeights<'a>>,
    dims: ModelDims,
    pub(crate) trans_qkvw: bool,
    pub(crate) gated: bool,
}

fn check_count(collection: &'static str, expected: usize, found: usize) -> Result<(), ConfigError> {
    if found != expected {
        return Err(ConfigError::LayerCountMismatch {
            collection,
            expected,
            found,
        });
    }
    Ok(())
}

fn check_param(what: &'static str, tensor: &Tensor, shape: &[usize]) -> Result<(), ConfigError> {
    tensor.expect_shape(what, shape)?;
    KERNEL.check(tensor.dtype())
}

fn check_opt(
    what: &'static str,
    tensor: Option<&Tensor>,
    shape: &[usize],
) -> Result<(), ConfigError> {
    tensor.map_or(Ok(()), |t| check_param(what, t, shape))
}

impl<'a> DecoderWeights<'a> {
    /// Validates `collections` for a decoder configured by `config`.
    ///
    /// The model dimensions are inferred from the first layer and every other parameter is
    /// checked against them.
    pub fn new(
        collections: LayerCollections<'a>,
        config: &DecoderConfig,
    ) -> Result<Self, ConfigError> {
        let ffn_act = config.validate()?;
        let num_layers = collections.qkv_weights.len();
        if num_layers == 0 {
            return Err(ConfigError::NoLayers);
        }

        check_count("ln_scales", num_layers, collections.ln_scales.len())?;
        check_count("ln_biases", num_layers, collections.ln_biases.len())?;
        check_count("qkv_biases", num_layers, collections.qkv_biases.len())?;
        check_count(
            "out_linear_weights",
            num_layers,
            collections.out_linear_weights.len(),
        )?;
        check_count(
            "out_linear_biases",
            num_layers,
            collections.out_linear_biases.len(),
        )?;
        check_count("ffn_ln_scales", num_layers, collections.ffn_ln_scales.len())?;
        check_count("ffn_ln_biases", num_layers, collections.ffn_ln_biases.len())?;
        check_count("ffn1_weights", num_layers, collections.ffn1_weights.len())?;
        check_count("ffn1_biases", num_layers, collections.ffn1_biases.len())?;
        check_count("ffn2_weights", num_layers, collections.ffn2_weights.len())?;
        check_count("ffn2_biases", num_layers, collections.ffn2_biases.len())?;

        let dims = Self::infer_dims(&collections, config.trans_qkvw)?;

        let layers: Vec<_> = (0..num_layers)
            .map(|i| LayerWeights {
                ln_scale: collections.ln_scales[i],
                ln_bias: collections.ln_biases[i],
                qkv_weight: collections.qkv_weights[i],
                qkv_bias: collections.qkv_biases[i],
                out_linear_weight: collections.out_linear_weights[i],
                out_linear_bias: collections.out_linear_biases[i],
                ffn_ln_scale: collections.ffn_ln_scales[i],
                ffn_ln_bias: collections.ffn_ln_biases[i],
                ffn1_weight: collections.ffn1_weights[i],
                ffn1_bias: collections.ffn1_biases[i],
                ffn2_weight: collections.ffn2_weights[i],
                ffn2_bias: collections.ffn2_biases[i],
            })
            .collect();

        for layer in &layers {
            Self::check_layer(layer, dims, config.trans_qkvw, ffn_act)?;
        }

        log::debug!("validated {num_layers} decoder layers with {dims:?}");

        Ok(Self {
            layers,
            dims,
            trans_qkvw: config.trans_qkvw,
            gated: ffn_act.gated,
        })
    }

    fn infer_dims(
        collections: &LayerCollections,
        trans_qkvw: bool,
    ) -> Result<ModelDims, ConfigError> {
        let qkv = collections.qkv_weights[0].shape();
        if qkv.len() != 4 {
            return Err(ConfigError::RankMismatch {
                what: "qkv_weights",
                expected: 4,
                found: qkv.len(),
            });
        }

        let (embed, heads, head_dim) = if trans_qkvw {
            (qkv[3], qkv[1], qkv[2])
        } else {
            (qkv[0], qkv[2], qkv[3])
        };
        for (dim, size) in [("embedding", embed), ("head", heads), ("head_dim", head_dim)] {
            if size == 0 {
                return Err(ConfigError::ZeroDimension {
                    what: "qkv_weights",
                    dim,
                });
            }
        }

        let ffn2 = collections.ffn2_weights[0].shape();
        if ffn2.len() != 2 {
            return Err(ConfigError::RankMismatch {
                what: "ffn2_weights",
                expected: 2,
                found: ffn2.len(),
            });
        }

        Ok(ModelDims {
            embed,
            heads,
            head_dim,
            ffn: ffn2[0],
        })
    }

    fn check_layer(
        layer: &LayerWeights,
        dims: ModelDims,
        trans_qkvw: bool,
        ffn_act: FeedForwardActivation,
    ) -> Result<(), ConfigError> {
        let ModelDims {
            embed: e,
            heads: h,
            head_dim: d,
            ffn: f,
        } = dims;
        let expansion = ffn_act.expansion_width(f);
        let qkv_shape = if trans_qkvw {
            [3, h, d, e]
        } else {
            [e, 3, h, d]
        };

        check_param("qkv_weights", layer.qkv_weight, &qkv_shape)?;
        check_opt("ln_scales", layer.ln_scale, &[e])?;
        check_opt("ln_biases", layer.ln_bias, &[e])?;
        check_opt("qkv_biases", layer.qkv_bias, &[3, h, d])?;
        check_param("out_linear_weights", layer.out_linear_weight, &[h * d, e])?;
        check_opt("out_linear_biases", layer.out_linear_bias, &[e])?;
        check_opt("ffn_ln_scales", layer.ffn_ln_scale, &[e])?;
        check_opt("ffn_ln_biases", layer.ffn_ln_bias, &[e])?;
        check_param("ffn1_weights", layer.ffn1_weight, &[e, expansion])?;
        check_opt("ffn1_biases", layer.ffn1_bias, &[expansion])?;
        check_param("ffn2_weights", layer.ffn2_weight, &[f, e])?;
        check_opt("ffn2_biases", layer.ffn2_bias, &[e])
    }

    /// The validated layers, in execution order.
    pub fn layers(&self) -> &[LayerWeights<'a>] {
        &self.layers
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// The model dimensions.
    pub fn dims(&self) -> ModelDims {
        self.dims
    }
}
