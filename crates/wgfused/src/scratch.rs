//! Call-scoped scratch memory for precision-converted parameters.
//!
//! A [`ScratchArena`] is created at the beginning of a kernel call and dropped at its end. Every
//! [`ScratchBuffer`] borrows the arena, so none of them can outlive the call, and each returns
//! its bytes to the arena when dropped (including on early returns through `?`).

use crate::device::DeviceMath;
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use std::cell::Cell;
use std::ops::{Deref, DerefMut};

/// Bookkeeping for the scratch allocations of a single kernel call.
pub struct ScratchArena {
    capacity: Option<usize>,
    in_use: Cell<usize>,
    peak: Cell<usize>,
}

impl ScratchArena {
    /// An arena limited only by the host allocator.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            in_use: Cell::new(0),
            peak: Cell::new(0),
        }
    }

    /// An arena that can hold at most `bytes` bytes at any given time.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::unbounded()
        }
    }

    /// Creates an arena with an optional byte capacity.
    pub fn new(capacity: Option<usize>) -> Self {
        capacity.map_or_else(Self::unbounded, Self::with_capacity)
    }

    /// Number of bytes currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// Largest number of bytes simultaneously allocated so far.
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Allocates a zeroed buffer of `len` single-precision elements.
    pub fn alloc_f32(&self, len: usize) -> Result<ScratchBuffer<'_>> {
        let requested = len
            .checked_mul(std::mem::size_of::<f32>())
            .ok_or_else(|| Error::Scratch {
                requested: usize::MAX,
                reason: "size overflow".to_string(),
            })?;
        let in_use = self
            .in_use
            .get()
            .checked_add(requested)
            .ok_or_else(|| Error::Scratch {
                requested,
                reason: "size overflow".to_string(),
            })?;

        if let Some(capacity) = self.capacity {
            if in_use > capacity {
                return Err(Error::Scratch {
                    requested,
                    reason: format!(
                        "{} of the {capacity} bytes of the arena are already in use",
                        self.in_use.get()
                    ),
                });
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| Error::Scratch {
            requested,
            reason: e.to_string(),
        })?;
        data.resize(len, 0.0);

        self.in_use.set(in_use);
        self.peak.set(self.peak.get().max(in_use));
        log::trace!("scratch: allocated {requested} bytes ({in_use} in use)");

        Ok(ScratchBuffer { arena: self, data })
    }

    /// Gets `tensor` as single-precision elements.
    ///
    /// Single-precision tensors are borrowed directly. Reduced-precision tensors are converted by
    /// `device` into a scratch buffer allocated from `self`.
    pub fn promote<'a, D: DeviceMath + ?Sized>(
        &'a self,
        device: &D,
        tensor: &'a Tensor,
    ) -> Result<F32Slice<'a>> {
        if let Some(data) = tensor.data().as_f32() {
            return Ok(F32Slice::Borrowed(data));
        }

        log::debug!(
            "promoting a {} parameter of {} elements to f32",
            tensor.dtype(),
            tensor.len()
        );
        let mut buffer = self.alloc_f32(tensor.len())?;
        device.cast_to_f32(tensor.data(), &mut buffer)?;
        Ok(F32Slice::Promoted(buffer))
    }

    /// Like [`Self::promote`], for an optional tensor.
    pub fn promote_opt<'a, D: DeviceMath + ?Sized>(
        &'a self,
        device: &D,
        tensor: Option<&'a Tensor>,
    ) -> Result<Option<F32Slice<'a>>> {
        tensor.map(|t| self.promote(device, t)).transpose()
    }
}

/// A single-precision buffer allocated from a [`ScratchArena`].
pub struct ScratchBuffer<'a> {
    arena: &'a ScratchArena,
    data: Vec<f32>,
}

impl Drop for ScratchBuffer<'_> {
    fn drop(&mut self) {
        let bytes = self.data.len() * std::mem::size_of::<f32>();
        self.arena.in_use.set(self.arena.in_use.get() - bytes);
    }
}

impl Deref for ScratchBuffer<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl DerefMut for ScratchBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

/// Single-precision elements that are either borrowed from a tensor or promoted into scratch.
pub enum F32Slice<'a> {
    /// The tensor was already single-precision.
    Borrowed(&'a [f32]),
    /// The tensor was converted into a scratch buffer.
    Promoted(ScratchBuffer<'a>),
}

impl Deref for F32Slice<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            Self::Borrowed(data) => data,
            Self::Promoted(buffer) => buffer,
        }
    }
}
