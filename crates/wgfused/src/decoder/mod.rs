//! A stack of transformer decoder layers executed as a single fused kernel.
//!
//! Every layer runs, in order, a (pre- or post-) normalized self-attention block with an
//! optional rotary position embedding and key/value cache, followed by a normalized
//! feed-forward block. Under tensor parallelism each participant holds a shard of the heads and
//! of the feed-forward width, and the partial projections are summed across the group twice per
//! layer.

pub use self::config::{DecoderConfig, DropoutImplementation, FeedForwardActivation};
pub use self::weights::{DecoderWeights, LayerCollections, LayerWeights, ModelDims};

use self::attention::{attend, RotaryTable};
use self::cache::{KvLayout, KEYS, VALUES};
use self::config::Dropout;
use crate::activation::Activation;
use crate::device::DeviceMath;
use crate::dtype::DType;
use crate::error::{ConfigError, Result};
use crate::norm_act::{FusionStrategy, LayerNormAct};
use crate::parallel::Communicator;
use crate::registry::{DeviceClass, KernelEntry};
use crate::scratch::ScratchArena;
use crate::tensor::Tensor;
use std::borrow::Cow;

mod attention;
mod cache;
pub mod config;
pub mod weights;

pub(crate) const KERNEL: KernelEntry = KernelEntry {
    name: "fused_multi_transformer",
    device: DeviceClass::Cpu,
    dtypes: &[DType::F32, DType::F16, DType::BF16],
};

/// The optional per-call inputs of [`FusedMultiTransformer::forward`].
#[derive(Copy, Clone, Debug, Default)]
pub struct DecoderInputs<'a> {
    /// Per-layer prefix keys and values, `[2, B, H, P, D]`, attended before the current tokens.
    pub pre_caches: Option<&'a [Tensor]>,
    /// Rotary table `[2, max_positions, D / 2]`, required when `rotary_emb_dims == 1`.
    pub rotary_emb: Option<&'a Tensor>,
    /// Write position of a decode step. Requires caches and a single token per sequence.
    pub time_step: Option<usize>,
    /// Number of valid tokens of each batch entry.
    ///
    /// During a decode step, batch entry `b` writes its key/value at `seq_lengths[b]` instead
    /// of `time_step`. During the context phase, current keys beyond `seq_lengths[b]` are
    /// ignored.
    pub seq_lengths: Option<&'a [usize]>,
    /// Additive attention mask, `[B, 1, S, T]` with `T` at least the attended length.
    pub attn_mask: Option<&'a Tensor>,
}

enum Phase {
    /// All the tokens of the sequences are processed at once.
    Context,
    /// A single token per sequence, written to the caches at the given positions.
    Decode { positions: Vec<usize> },
}

/// The validated geometry of a forward call.
struct Plan<'a> {
    batch: usize,
    seq: usize,
    dims: ModelDims,
    pre_len: usize,
    pre_cache: Option<KvLayout>,
    cache: Option<KvLayout>,
    phase: Phase,
    seq_lengths: Option<&'a [usize]>,
    rotary: Option<RotaryTable<'a>>,
    // The mask elements and the length of their last axis.
    mask: Option<(Cow<'a, [f32]>, usize)>,
    max_kv_len: usize,
}

impl Plan<'_> {
    /// Absolute position of the `s`-th token of batch entry `b`.
    fn position(&self, b: usize, s: usize) -> usize {
        match &self.phase {
            Phase::Context => self.pre_len + s,
            Phase::Decode { positions } => positions[b],
        }
    }
}

/// Checks that `tensors` holds one key/value tensor per layer, all of the same layout.
fn kv_layouts(
    what: &'static str,
    tensors: &[Tensor],
    num_layers: usize,
    batch: usize,
    dims: ModelDims,
) -> Result<Option<KvLayout>, ConfigError> {
    if tensors.len() != num_layers {
        return Err(ConfigError::LayerCountMismatch {
            collection: what,
            expected: num_layers,
            found: tensors.len(),
        });
    }

    let mut first: Option<KvLayout> = None;
    for tensor in tensors {
        let layout = KvLayout::of(what, tensor, batch, dims.heads, dims.head_dim)?;
        if let Some(expected) = first.filter(|first| *first != layout) {
            return Err(ConfigError::ShapeMismatch {
                what,
                expected: expected.shape().to_vec(),
                found: tensor.shape().to_vec(),
            });
        }
        first = Some(layout);
    }
    Ok(first)
}

/// A multi-layer transformer decoder.
pub struct FusedMultiTransformer<'d, D: ?Sized, C: ?Sized> {
    device: &'d D,
    communicator: &'d C,
    config: DecoderConfig,
    ffn_act: FeedForwardActivation,
    norm: LayerNormAct<'d, D>,
    scratch_capacity: Option<usize>,
}

impl<'d, D: DeviceMath + ?Sized, C: Communicator + ?Sized> FusedMultiTransformer<'d, D, C> {
    /// Registration entry of this kernel.
    pub const ENTRY: KernelEntry = KERNEL;

    /// Creates a decoder running on `device`, reducing its partial sums through `communicator`.
    pub fn new(
        device: &'d D,
        communicator: &'d C,
        config: DecoderConfig,
    ) -> Result<Self, ConfigError> {
        let ffn_act = config.validate()?;

        if config.ring_id >= 0
            && communicator.world_size() > 1
            && communicator.ring_id() != config.ring_id
        {
            return Err(ConfigError::RingMismatch {
                expected: config.ring_id,
                found: communicator.ring_id(),
            });
        }

        log::debug!(
            "fused_multi_transformer: rank {}/{} on `{}`, {:?}",
            communicator.rank(),
            communicator.world_size(),
            device.name(),
            config
        );

        Ok(Self {
            device,
            communicator,
            config,
            ffn_act,
            norm: LayerNormAct::new(device),
            scratch_capacity: None,
        })
    }

    /// Forces the strategy of the normalizations.
    pub fn with_strategy(mut self, strategy: FusionStrategy) -> Result<Self, ConfigError> {
        self.norm = LayerNormAct::with_strategy(self.device, strategy)?;
        Ok(self)
    }

    /// Limits the scratch memory holding the promoted parameters of a layer, in bytes.
    pub fn with_scratch_capacity(mut self, bytes: usize) -> Self {
        self.scratch_capacity = Some(bytes);
        self
    }

    /// The configuration of this decoder.
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Runs every layer on `x` (`[B, S, E]`) and writes the result into `out`.
    ///
    /// `out` must have the same shape and element type as `x`. Each of the `caches` (one per
    /// layer, `[2, B, H, max_seq, D]`) is updated in place with the keys and values of the
    /// current tokens. Every input is validated before any computation starts.
    pub fn forward(
        &self,
        x: &Tensor,
        weights: &DecoderWeights,
        inputs: &DecoderInputs,
        mut caches: Option<&mut [Tensor]>,
        out: &mut Tensor,
    ) -> Result<()> {
        let plan = self.plan(x, weights, inputs, caches.as_deref(), out)?;
        let ModelDims {
            embed,
            heads,
            head_dim,
            ffn,
        } = plan.dims;
        let rows = plan.batch * plan.seq;
        let expansion = self.ffn_act.expansion_width(ffn);

        log::debug!(
            "fused_multi_transformer: {} layers, batch {}, {} tokens, {}",
            weights.num_layers(),
            plan.batch,
            plan.seq,
            match plan.phase {
                Phase::Context => "context",
                Phase::Decode { .. } => "decode",
            }
        );

        let mut residual = x.to_f32_vec();
        let mut h = vec![0.0; rows * embed];
        let mut qkv = vec![0.0; rows * 3 * heads * head_dim];
        let mut ctx = vec![0.0; rows * heads * head_dim];
        let mut branch = vec![0.0; rows * embed];
        let mut expanded = vec![0.0; rows * expansion];
        let mut gated = vec![0.0; if self.ffn_act.gated { rows * ffn } else { 0 }];
        let mut dropout = Dropout::new(&self.config);

        for (i, layer) in weights.layers().iter().enumerate() {
            log::trace!("fused_multi_transformer: layer {i}");
            let arena = ScratchArena::new(self.scratch_capacity);
            let ln_scale = arena.promote_opt(self.device, layer.ln_scale)?;
            let ln_bias = arena.promote_opt(self.device, layer.ln_bias)?;
            let qkv_weight = arena.promote(self.device, layer.qkv_weight)?;
            let qkv_bias = arena.promote_opt(self.device, layer.qkv_bias)?;
            let out_weight = arena.promote(self.device, layer.out_linear_weight)?;
            let out_bias = arena.promote_opt(self.device, layer.out_linear_bias)?;
            let ffn_ln_scale = arena.promote_opt(self.device, layer.ffn_ln_scale)?;
            let ffn_ln_bias = arena.promote_opt(self.device, layer.ffn_ln_bias)?;
            let ffn1_weight = arena.promote(self.device, layer.ffn1_weight)?;
            let ffn1_bias = arena.promote_opt(self.device, layer.ffn1_bias)?;
            let ffn2_weight = arena.promote(self.device, layer.ffn2_weight)?;
            let ffn2_bias = arena.promote_opt(self.device, layer.ffn2_bias)?;

            /*
             * Self-attention block.
             */
            if self.config.pre_layer_norm {
                self.normalize(&residual, &mut h, embed, ln_scale.as_deref(), ln_bias.as_deref())?;
            } else {
                h.copy_from_slice(&residual);
            }

            self.device.matmul(
                &h,
                &qkv_weight,
                &mut qkv,
                rows,
                embed,
                3 * heads * head_dim,
                self.config.trans_qkvw,
            )?;
            if let Some(bias) = qkv_bias.as_deref() {
                self.device.bias_act(
                    &mut qkv,
                    3 * heads * head_dim,
                    Some(bias),
                    Activation::IDENTITY,
                )?;
            }

            let pre_cache = inputs.pre_caches.map(|pre| &pre[i]);
            let cache = caches.as_mut().map(|caches| &mut caches[i]);
            self.attention(&plan, &mut qkv, pre_cache, cache, &mut ctx)?;

            self.device.matmul(
                &ctx,
                &out_weight,
                &mut branch,
                rows,
                heads * head_dim,
                embed,
                false,
            )?;
            self.residual_add(&mut branch, out_bias.as_deref(), &mut dropout, &mut residual)?;

            if !self.config.pre_layer_norm {
                self.normalize(&residual, &mut h, embed, ln_scale.as_deref(), ln_bias.as_deref())?;
                std::mem::swap(&mut residual, &mut h);
            }

            /*
             * Feed-forward block.
             */
            if self.config.pre_layer_norm {
                self.normalize(
                    &residual,
                    &mut h,
                    embed,
                    ffn_ln_scale.as_deref(),
                    ffn_ln_bias.as_deref(),
                )?;
            } else {
                h.copy_from_slice(&residual);
            }

            self.device
                .matmul(&h, &ffn1_weight, &mut expanded, rows, embed, expansion, false)?;
            let activated = if self.ffn_act.gated {
                if let Some(bias) = ffn1_bias.as_deref() {
                    self.device
                        .bias_act(&mut expanded, expansion, Some(bias), Activation::IDENTITY)?;
                }
                self.device
                    .gated_act(&expanded, &mut gated, ffn, self.ffn_act.act)?;
                &gated
            } else {
                self.device
                    .bias_act(&mut expanded, ffn, ffn1_bias.as_deref(), self.ffn_act.act)?;
                &expanded
            };

            self.device
                .matmul(activated, &ffn2_weight, &mut branch, rows, ffn, embed, false)?;
            self.residual_add(&mut branch, ffn2_bias.as_deref(), &mut dropout, &mut residual)?;

            if !self.config.pre_layer_norm {
                self.normalize(
                    &residual,
                    &mut h,
                    embed,
                    ffn_ln_scale.as_deref(),
                    ffn_ln_bias.as_deref(),
                )?;
                std::mem::swap(&mut residual, &mut h);
            }

            log::trace!(
                "fused_multi_transformer: layer {i} used {} bytes of scratch",
                arena.peak()
            );
        }

        out.data_mut().write_f32(0, &residual);
        Ok(())
    }

    /// Validates the inputs of a forward call against each other.
    fn plan<'a>(
        &self,
        x: &Tensor,
        weights: &DecoderWeights,
        inputs: &DecoderInputs<'a>,
        caches: Option<&[Tensor]>,
        out: &Tensor,
    ) -> Result<Plan<'a>, ConfigError> {
        KERNEL.check(x.dtype())?;
        self.check_weight_layout(weights)?;

        let dims = weights.dims();
        if x.rank() != 3 {
            return Err(ConfigError::RankMismatch {
                what: "x",
                expected: 3,
                found: x.rank(),
            });
        }
        let (batch, seq) = (x.shape()[0], x.shape()[1]);
        x.expect_shape("x", &[batch, seq, dims.embed])?;
        out.expect_shape("out", x.shape())?;
        if out.dtype() != x.dtype() {
            return Err(ConfigError::DTypeMismatch {
                what: "out",
                expected: x.dtype(),
                found: out.dtype(),
            });
        }

        let num_layers = weights.num_layers();
        let cache = caches
            .map(|c| kv_layouts("cache_kvs", c, num_layers, batch, dims))
            .transpose()?
            .flatten();
        let pre_cache = inputs
            .pre_caches
            .map(|c| kv_layouts("pre_caches", c, num_layers, batch, dims))
            .transpose()?
            .flatten();
        let pre_len = pre_cache.map(|l| l.capacity).unwrap_or(0);

        if let Some(lens) = inputs.seq_lengths {
            if lens.len() != batch {
                return Err(ConfigError::ShapeMismatch {
                    what: "seq_lengths",
                    expected: vec![batch],
                    found: vec![lens.len()],
                });
            }
        }

        let phase = match inputs.time_step {
            Some(time_step) => {
                let Some(cache) = cache else {
                    return Err(ConfigError::TimeStepWithoutCache);
                };
                if seq != 1 {
                    return Err(ConfigError::DecodeSequenceLength(seq));
                }

                let positions = match inputs.seq_lengths {
                    Some(lens) => lens.to_vec(),
                    None => vec![time_step; batch],
                };
                for &pos in std::iter::once(&time_step).chain(&positions) {
                    if pos >= cache.capacity {
                        return Err(ConfigError::TimeStepOutOfRange {
                            time_step: pos,
                            capacity: cache.capacity,
                        });
                    }
                }
                Phase::Decode { positions }
            }
            None => {
                if let Some(cache) = cache {
                    if pre_len + seq > cache.capacity {
                        return Err(ConfigError::TimeStepOutOfRange {
                            time_step: pre_len + seq,
                            capacity: cache.capacity,
                        });
                    }
                }
                if let Some(&len) = inputs.seq_lengths.into_iter().flatten().find(|l| **l > seq) {
                    return Err(ConfigError::InvalidValue {
                        name: "seq_lengths",
                        value: len as f32,
                        reason: "exceeds the number of tokens",
                    });
                }
                Phase::Context
            }
        };

        let max_kv_len = match &phase {
            Phase::Context => pre_len + seq,
            Phase::Decode { positions } => positions.iter().max().map_or(0, |p| p + 1),
        };

        let rotary = if self.config.rotary_emb_dims == 1 {
            let table = inputs
                .rotary_emb
                .ok_or(ConfigError::MissingInput("rotary_emb"))?;
            let rotary = RotaryTable::new(table, dims.head_dim)?;
            match &phase {
                Phase::Context if seq > 0 => rotary.check_position(pre_len + seq - 1)?,
                Phase::Context => {}
                Phase::Decode { positions } => {
                    for &pos in positions {
                        rotary.check_position(pos)?;
                    }
                }
            }
            Some(rotary)
        } else {
            None
        };

        let mask = match inputs.attn_mask {
            Some(mask) => {
                if mask.rank() != 4 {
                    return Err(ConfigError::RankMismatch {
                        what: "attn_mask",
                        expected: 4,
                        found: mask.rank(),
                    });
                }
                let len = mask.shape()[3];
                if mask.shape()[..3] != [batch, 1, seq] || len < max_kv_len {
                    return Err(ConfigError::ShapeMismatch {
                        what: "attn_mask",
                        expected: vec![batch, 1, seq, max_kv_len],
                        found: mask.shape().to_vec(),
                    });
                }
                let data = match mask.data().as_f32() {
                    Some(data) => Cow::Borrowed(data),
                    None => Cow::Owned(mask.to_f32_vec()),
                };
                Some((data, len))
            }
            None => None,
        };

        Ok(Plan {
            batch,
            seq,
            dims,
            pre_len,
            pre_cache,
            cache,
            phase,
            seq_lengths: inputs.seq_lengths,
            rotary,
            mask,
            max_kv_len,
        })
    }

    /// Checks that `weights` were validated for the layouts this decoder expects.
    fn check_weight_layout(&self, weights: &DecoderWeights) -> Result<(), ConfigError> {
        let ModelDims {
            embed: e,
            heads: h,
            head_dim: d,
            ffn: f,
        } = weights.dims();
        let layer = &weights.layers()[0];

        if weights.trans_qkvw != self.config.trans_qkvw {
            let expected = if self.config.trans_qkvw {
                vec![3, h, d, e]
            } else {
                vec![e, 3, h, d]
            };
            return Err(ConfigError::ShapeMismatch {
                what: "qkv_weights",
                expected,
                found: layer.qkv_weight.shape().to_vec(),
            });
        }

        if weights.gated != self.ffn_act.gated {
            return Err(ConfigError::ShapeMismatch {
                what: "ffn1_weights",
                expected: vec![e, self.ffn_act.expansion_width(f)],
                found: layer.ffn1_weight.shape().to_vec(),
            });
        }

        Ok(())
    }

    /// Rotates the queries and keys, updates the cache, and attends every query.
    fn attention(
        &self,
        plan: &Plan,
        qkv: &mut [f32],
        pre_cache: Option<&Tensor>,
        mut cache: Option<&mut Tensor>,
        ctx: &mut [f32],
    ) -> Result<()> {
        let ModelDims {
            heads, head_dim, ..
        } = plan.dims;
        let hd = heads * head_dim;
        let width = 3 * hd;

        if let Some(rotary) = &plan.rotary {
            for b in 0..plan.batch {
                for s in 0..plan.seq {
                    let pos = plan.position(b, s);
                    let row = &mut qkv[(b * plan.seq + s) * width..][..2 * hd];
                    for head in row.chunks_exact_mut(head_dim) {
                        rotary.rotate(head, pos);
                    }
                }
            }
        }

        let mut keys = vec![0.0; plan.max_kv_len * head_dim];
        let mut values = vec![0.0; plan.max_kv_len * head_dim];

        for b in 0..plan.batch {
            for h in 0..heads {
                let kv_len = match (&plan.phase, &mut cache) {
                    (Phase::Decode { positions }, Some(cache)) => {
                        let Some(layout) = plan.cache else {
                            return Err(ConfigError::TimeStepWithoutCache.into());
                        };
                        let pos = positions[b];
                        let row = &qkv[b * width..][..width];
                        let data = cache.data_mut();
                        layout.write(data, KEYS, b, h, pos, &row[hd + h * head_dim..][..head_dim]);
                        layout.write(
                            data,
                            VALUES,
                            b,
                            h,
                            pos,
                            &row[2 * hd + h * head_dim..][..head_dim],
                        );

                        let len = pos + 1;
                        layout.read(data, KEYS, b, h, &mut keys[..len * head_dim]);
                        layout.read(data, VALUES, b, h, &mut values[..len * head_dim]);
                        len
                    }
                    (Phase::Decode { .. }, None) => {
                        return Err(ConfigError::TimeStepWithoutCache.into());
                    }
                    (Phase::Context, cache) => {
                        let prefix = plan.pre_len * head_dim;
                        if let (Some(pre), Some(layout)) = (pre_cache, plan.pre_cache) {
                            layout.read(pre.data(), KEYS, b, h, &mut keys[..prefix]);
                            layout.read(pre.data(), VALUES, b, h, &mut values[..prefix]);
                        }

                        for s in 0..plan.seq {
                            let row = &qkv[(b * plan.seq + s) * width..][..width];
                            let at = prefix + s * head_dim;
                            keys[at..at + head_dim]
                                .copy_from_slice(&row[hd + h * head_dim..][..head_dim]);
                            values[at..at + head_dim]
                                .copy_from_slice(&row[2 * hd + h * head_dim..][..head_dim]);
                        }

                        let len = plan.pre_len + plan.seq;
                        if let (Some(cache), Some(layout)) = (cache, plan.cache) {
                            let data = cache.data_mut();
                            layout.write(data, KEYS, b, h, 0, &keys[..len * head_dim]);
                            layout.write(data, VALUES, b, h, 0, &values[..len * head_dim]);
                        }
                        len
                    }
                };

                let limit = match (&plan.phase, plan.seq_lengths) {
                    (Phase::Context, Some(lens)) => plan.pre_len + lens[b],
                    _ => kv_len,
                };

                for s in 0..plan.seq {
                    let row = b * plan.seq + s;
                    let mask = plan
                        .mask
                        .as_ref()
                        .map(|(mask, len)| &mask[row * len..][..kv_len]);
                    attend(
                        &qkv[row * width + h * head_dim..][..head_dim],
                        &keys,
                        &values,
                        kv_len,
                        limit,
                        mask,
                        &mut ctx[row * hd + h * head_dim..][..head_dim],
                    );
                }
            }
        }

        Ok(())
    }

    fn normalize(
        &self,
        x: &[f32],
        y: &mut [f32],
        width: usize,
        scale: Option<&[f32]>,
        bias: Option<&[f32]>,
    ) -> Result<()> {
        self.norm.run_slices(
            x,
            y,
            x.len() / width.max(1),
            width,
            self.config.epsilon,
            scale,
            bias,
            Activation::IDENTITY,
        )
    }

    /// Sums the partial `branch` across the group, then adds its bias, its dropout and the
    /// result to `residual`.
    fn residual_add(
        &self,
        branch: &mut [f32],
        bias: Option<&[f32]>,
        dropout: &mut Dropout,
        residual: &mut [f32],
    ) -> Result<()> {
        if self.config.ring_id >= 0 && self.communicator.world_size() > 1 {
            self.communicator.all_reduce_sum(branch)?;
        }

        if let Some(bias) = bias {
            self.device
                .bias_act(branch, bias.len(), Some(bias), Activation::IDENTITY)?;
        }
        dropout.apply(branch);
        self.device.add_assign(residual, branch)?;
        Ok(())
    }
}
