//! Error types shared by every kernel of this crate.

use crate::dtype::DType;
use thiserror::Error;

/// Result type of the kernels.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failed kernel invocation.
///
/// None of these are retried: the in-progress call is aborted and any output it was writing to
/// must be considered undefined.
#[derive(Debug, Error)]
pub enum Error {
    /// The inputs or the configuration were rejected before any device work started.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// A device-math primitive reported a failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A scratch buffer could not be allocated.
    #[error("failed to allocate {requested} bytes of scratch memory: {reason}")]
    Scratch {
        /// Size of the failed allocation, in bytes.
        requested: usize,
        /// Why the allocation failed.
        reason: String,
    },
    /// A collective operation could not complete.
    #[error("collective `{op}` failed on rank {rank}: {reason}")]
    Collective {
        /// Name of the collective operation.
        op: &'static str,
        /// Rank of the participant that observed the failure.
        rank: usize,
        /// Why the collective failed.
        reason: String,
    },
}

/// Failure of a single device-math primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device operation `{op}` failed: {reason}")]
pub struct DeviceError {
    /// Name of the failing primitive.
    pub op: &'static str,
    /// Description of the failure.
    pub reason: String,
}

impl DeviceError {
    /// Creates an error for the primitive named `op`.
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }

    /// The primitive `op` is not provided by this device.
    pub fn unsupported(op: &'static str) -> Self {
        Self::new(op, "not supported by this device")
    }
}

/// Configuration, shape, or dtype errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Two per-layer collections do not have the same number of entries.
    #[error("`{collection}` has {found} entries, expected {expected} (one per layer)")]
    LayerCountMismatch {
        /// Name of the offending collection.
        collection: &'static str,
        /// Number of layers.
        expected: usize,
        /// Length of the offending collection.
        found: usize,
    },
    /// The decoder was given no layer at all.
    #[error("at least one layer is required")]
    NoLayers,
    /// The normalization axis is out of range for the tensor rank.
    #[error("normalization axis {axis} is out of range for a tensor of rank {rank}")]
    InvalidAxis {
        /// The requested axis.
        axis: usize,
        /// The tensor rank.
        rank: usize,
    },
    /// A tensor does not have the expected shape.
    #[error("`{what}` has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Name of the offending tensor.
        what: &'static str,
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        found: Vec<usize>,
    },
    /// A tensor does not have the expected number of dimensions.
    #[error("`{what}` has rank {found}, expected rank {expected}")]
    RankMismatch {
        /// Name of the offending tensor.
        what: &'static str,
        /// The expected rank.
        expected: usize,
        /// The actual rank.
        found: usize,
    },
    /// An input required by the configuration was not provided.
    #[error("`{0}` is required by the configuration but was not provided")]
    MissingInput(&'static str),
    /// A tensor does not have the expected element type.
    #[error("`{what}` has element type {found}, expected {expected}")]
    DTypeMismatch {
        /// Name of the offending tensor.
        what: &'static str,
        /// The expected element type.
        expected: DType,
        /// The actual element type.
        found: DType,
    },
    /// Unknown activation name or identifier.
    #[error("unsupported activation `{0}`")]
    UnsupportedActivation(String),
    /// The kernel is not registered for this element type on this device.
    #[error("kernel `{kernel}` does not support element type {dtype} on the {device} device")]
    UnsupportedDType {
        /// Kernel name.
        kernel: &'static str,
        /// Device class name.
        device: &'static str,
        /// The rejected element type.
        dtype: DType,
    },
    /// The fused strategy was requested on a device that cannot run it.
    #[error("the `{device}` device has no fused normalization-activation kernel")]
    FusionUnavailable {
        /// Name of the device.
        device: String,
    },
    /// The rotary table width does not match half the head width.
    #[error("rotary table has {found} frequencies per position, expected {expected} (half the head width)")]
    RotaryDimMismatch {
        /// Half the per-head width.
        expected: usize,
        /// Last dimension of the rotary table.
        found: usize,
    },
    /// A token position is not covered by the rotary table.
    #[error("position {position} is beyond the {capacity} positions of the rotary table")]
    RotaryPositionOutOfRange {
        /// The token position.
        position: usize,
        /// Number of positions of the table.
        capacity: usize,
    },
    /// Only 0 (disabled) and 1 rotary dimension are supported.
    #[error("unsupported rotary_emb_dims {0}, expected 0 or 1")]
    UnsupportedRotaryDims(i32),
    /// The time step (or a sequence length) does not fit in the cache.
    #[error("time step {time_step} exceeds the cache capacity {capacity}")]
    TimeStepOutOfRange {
        /// The requested write position.
        time_step: usize,
        /// The cache capacity along the sequence axis.
        capacity: usize,
    },
    /// A time step was given without caches.
    #[error("a time step requires key/value caches")]
    TimeStepWithoutCache,
    /// Decode steps process exactly one token per sequence.
    #[error("decode steps take one token per sequence, got {0}")]
    DecodeSequenceLength(usize),
    /// The communicator does not belong to the configured ring.
    #[error("communicator belongs to ring {found}, expected ring {expected}")]
    RingMismatch {
        /// The configured ring id.
        expected: i32,
        /// The ring id of the communicator.
        found: i32,
    },
    /// A scalar option is out of its valid range.
    #[error("`{name}` = {value} is out of range: {reason}")]
    InvalidValue {
        /// Option name.
        name: &'static str,
        /// The rejected value.
        value: f32,
        /// The valid range.
        reason: &'static str,
    },
    /// A model dimension inferred from the weights is zero.
    #[error("`{what}` implies an empty {dim} dimension")]
    ZeroDimension {
        /// Name of the tensor the dimension was read from.
        what: &'static str,
        /// Name of the dimension.
        dim: &'static str,
    },
    /// A tensor holds a number of elements inconsistent with its shape.
    #[error("shape {shape:?} requires {expected} elements, got {found}")]
    ElementCount {
        /// The requested shape.
        shape: Vec<usize>,
        /// Number of elements implied by the shape.
        expected: usize,
        /// Number of elements provided.
        found: usize,
    },
}
