// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod overlap;

pub use overlap::OverlapStatus;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits::MAX_TENSOR_DIMS,
};
use ::std::fmt;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Element type of a tensor descriptor.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Float16 = 0,
    BFloat16 = 1,
    Float32 = 2,
    Int8 = 3,
    Int32 = 4,
}

/// How a written region participates in overlap classification. `Fuzzy`
/// regions only expose their conservative byte-range bound, so any reader
/// intersecting that bound must synchronize.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlapMode {
    Accurate = 0,
    Fuzzy = 1,
}

/// A half-open range `[begin, end)` of element or byte offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub begin: u64,
    pub end: u64,
}

/// A strided view over a device memory buffer.
///
/// `start_offset`, `strides` and `repeats` are expressed in elements of
/// `dtype`; `base_addr` and `buffer_size` are bytes. A descriptor with
/// `base_addr == 0` marks an output whose buffer the runtime allocates at
/// submission time.
///
/// Example: `start_offset=7, strides=[10, 1], repeats=[3, 6]` touches three
/// runs of six consecutive elements, ten elements apart, starting at element
/// seven of the buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TensorDesc {
    /// Device address of the underlying buffer, in bytes.
    pub base_addr: u64,
    /// Total size of the underlying buffer, in bytes.
    pub buffer_size: u64,
    /// Offset of the first element, in elements.
    pub start_offset: u64,
    /// Per-dimension stride, in elements. Only `ndims` entries are used.
    pub strides: [u64; MAX_TENSOR_DIMS],
    /// Per-dimension repeat count. Only `ndims` entries are used.
    pub repeats: [u64; MAX_TENSOR_DIMS],
    /// Number of dimensions in use.
    pub ndims: usize,
    /// Element type.
    pub dtype: DataType,
    /// Version of the buffer contents this descriptor refers to.
    pub version: i32,
    /// Overlap classification mode.
    pub overlap_mode: OverlapMode,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DataType {
    /// Returns the size of one element in bytes.
    pub fn size(&self) -> u64 {
        match self {
            DataType::Float16 => 2,
            DataType::BFloat16 => 2,
            DataType::Float32 => 4,
            DataType::Int8 => 1,
            DataType::Int32 => 4,
        }
    }
}

impl Segment {
    /// Checks whether two half-open ranges share at least one offset.
    pub fn intersects(&self, other: &Segment) -> bool {
        self.end > other.begin && other.end > self.begin
    }

    /// Checks whether `other` lies entirely within this range.
    pub fn contains(&self, other: &Segment) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }
}

/// Associated functions.
impl TensorDesc {
    /// Creates a descriptor from explicit strides and repeats. The result is
    /// normalized and validated.
    pub fn new(
        base_addr: u64,
        buffer_size: u64,
        start_offset: u64,
        strides: &[u64],
        repeats: &[u64],
        dtype: DataType,
        version: i32,
        overlap_mode: OverlapMode,
    ) -> Result<TensorDesc, Fail> {
        if strides.len() != repeats.len() {
            return Err(Fail::new(libc::EINVAL, "stride and repeat vectors must have equal rank"));
        }
        let ndims: usize = strides.len();
        if ndims == 0 || ndims > MAX_TENSOR_DIMS {
            return Err(Fail::new(libc::EINVAL, "descriptor rank out of range"));
        }

        let mut desc: TensorDesc = TensorDesc {
            base_addr,
            buffer_size,
            start_offset,
            strides: [0; MAX_TENSOR_DIMS],
            repeats: [0; MAX_TENSOR_DIMS],
            ndims,
            dtype,
            version,
            overlap_mode,
        };
        desc.strides[..ndims].copy_from_slice(strides);
        desc.repeats[..ndims].copy_from_slice(repeats);
        desc.normalize()?;
        Ok(desc)
    }

    /// Creates a 1-D unit-stride descriptor covering a whole buffer.
    pub fn contiguous_1d(base_addr: u64, size_bytes: u64, dtype: DataType, version: i32) -> Result<TensorDesc, Fail> {
        let elements: u64 = size_bytes / dtype.size();
        TensorDesc::new(
            base_addr,
            size_bytes,
            0,
            &[1],
            &[elements],
            dtype,
            version,
            OverlapMode::Accurate,
        )
    }

    /// Creates a descriptor with canonical row-major strides over `shape`.
    pub fn row_major(base_addr: u64, shape: &[u64], dtype: DataType, version: i32) -> Result<TensorDesc, Fail> {
        if shape.is_empty() || shape.len() > MAX_TENSOR_DIMS {
            return Err(Fail::new(libc::EINVAL, "descriptor rank out of range"));
        }
        let mut strides: [u64; MAX_TENSOR_DIMS] = [0; MAX_TENSOR_DIMS];
        let mut stride: u64 = 1;
        for i in (0..shape.len()).rev() {
            strides[i] = stride;
            stride = stride.checked_mul(shape[i]).ok_or(Fail::new(
                libc::EINVAL,
                "descriptor shape overflows the addressable range",
            ))?;
        }
        let size_bytes: u64 = stride * dtype.size();
        TensorDesc::new(
            base_addr,
            size_bytes,
            0,
            &strides[..shape.len()],
            shape,
            dtype,
            version,
            OverlapMode::Accurate,
        )
    }

    /// Creates a descriptor for a runtime-allocated output buffer. The
    /// address is filled in at submission time.
    pub fn alloc(size_bytes: u64, dtype: DataType) -> Result<TensorDesc, Fail> {
        TensorDesc::contiguous_1d(0, size_bytes, dtype, 0)
    }

    /// Creates a shaped descriptor for a runtime-allocated output buffer.
    pub fn alloc_shaped(shape: &[u64], dtype: DataType) -> Result<TensorDesc, Fail> {
        TensorDesc::row_major(0, shape, dtype, 0)
    }

    /// Returns the size of one element in bytes.
    pub fn element_size(&self) -> u64 {
        self.dtype.size()
    }

    /// Returns the byte address of the first element.
    pub fn data_addr(&self) -> u64 {
        self.base_addr + self.start_offset * self.element_size()
    }

    /// Returns the number of elements reachable from this descriptor.
    pub fn numel(&self) -> u64 {
        let mut total: u64 = 1;
        for i in 0..self.ndims {
            total *= self.repeats[i];
        }
        total
    }

    /// Checks whether two descriptors refer to the same underlying buffer.
    pub fn is_same_buffer(&self, other: &TensorDesc) -> bool {
        self.base_addr == other.base_addr
    }

    /// Checks whether two descriptors have identical stride vectors.
    pub fn same_strides(&self, other: &TensorDesc) -> bool {
        self.ndims == other.ndims && self.strides[..self.ndims] == other.strides[..other.ndims]
    }

    /// Returns the conservative element-offset bound
    /// `[start_offset, start_offset + sum(strides[i] * (repeats[i] - 1)) + 1)`.
    pub fn fuzzy_segment(&self) -> Segment {
        let mut end: u64 = self.start_offset;
        for i in 0..self.ndims {
            end += self.strides[i] * (self.repeats[i] - 1);
        }
        Segment {
            begin: self.start_offset,
            end: end + 1,
        }
    }

    /// Returns the fuzzy segment scaled to byte offsets.
    pub fn byte_segment(&self) -> Segment {
        let seg: Segment = self.fuzzy_segment();
        let elem: u64 = self.element_size();
        Segment {
            begin: seg.begin * elem,
            end: seg.end * elem,
        }
    }

    /// Sorts the (stride, repeat) pairs by descending stride, breaking ties
    /// by descending repeat. Sorting never changes the set of reachable
    /// offsets; it only canonicalizes dimension order.
    fn resort_strides(&mut self) {
        for i in 0..self.ndims {
            for j in (i + 1)..self.ndims {
                if self.strides[i] < self.strides[j]
                    || (self.strides[i] == self.strides[j] && self.repeats[i] < self.repeats[j])
                {
                    self.strides.swap(i, j);
                    self.repeats.swap(i, j);
                }
            }
        }
    }

    /// Checks the invariants of a normalized descriptor.
    fn validate(&self) -> Result<(), Fail> {
        if self.ndims == 0 || self.ndims > MAX_TENSOR_DIMS {
            return Err(Fail::new(libc::EINVAL, "descriptor rank out of range"));
        }
        for i in 0..self.ndims {
            if self.repeats[i] == 0 {
                return Err(Fail::new(libc::EINVAL, "descriptor has an empty dimension"));
            }
        }
        if self.strides[self.ndims - 1] != 1 {
            return Err(Fail::new(libc::EINVAL, "innermost stride must be one"));
        }
        for i in 1..self.ndims {
            // Strides are sorted in descending order:
            // strides[0] >= strides[1] >= ... >= strides[ndims-1] = 1.
            if self.strides[i] > self.strides[i - 1] {
                return Err(Fail::new(libc::EINVAL, "strides must be non-increasing"));
            }
            // Outer stride must be divisible by inner stride.
            if self.strides[i - 1] % self.strides[i] != 0 {
                return Err(Fail::new(libc::EINVAL, "outer stride must be a multiple of inner stride"));
            }
            // Inner block must not exceed outer stride.
            if self.strides[i - 1] < self.strides[i] * self.repeats[i] {
                return Err(Fail::new(libc::EINVAL, "inner block overruns outer stride"));
            }
        }
        // The last reachable byte must stay within the buffer.
        let end_byte: u64 = self.fuzzy_segment().end * self.element_size();
        if end_byte > self.buffer_size {
            return Err(Fail::new(libc::EINVAL, "descriptor reaches past the end of its buffer"));
        }
        Ok(())
    }

    /// Normalizes the descriptor in place and validates it. Idempotent.
    pub fn normalize(&mut self) -> Result<(), Fail> {
        self.resort_strides();
        self.validate()
    }

    /// Returns a normalized copy, leaving the receiver untouched.
    pub fn normalized(&self) -> Result<TensorDesc, Fail> {
        let mut copy: TensorDesc = *self;
        copy.normalize()?;
        Ok(copy)
    }

    /// Checks whether the strides form a dense row-major layout.
    pub fn is_contiguous(&self) -> bool {
        if self.strides[self.ndims - 1] != 1 {
            return false;
        }
        for i in (0..self.ndims.saturating_sub(1)).rev() {
            if self.strides[i] != self.strides[i + 1] * self.repeats[i + 1] {
                return false;
            }
        }
        true
    }

    /// Returns a window into this descriptor: same strides, repeats replaced
    /// by `shape`, and the start offset advanced by `offsets` along each
    /// dimension. Requires `shape[i] + offsets[i] <= repeats[i]`.
    pub fn view(&self, shape: &[u64], offsets: &[u64]) -> Result<TensorDesc, Fail> {
        if shape.len() != self.ndims || offsets.len() != self.ndims {
            return Err(Fail::new(libc::EINVAL, "view rank must match descriptor rank"));
        }
        for i in 0..self.ndims {
            if shape[i] + offsets[i] > self.repeats[i] {
                return Err(Fail::new(libc::EINVAL, "view reaches past the descriptor extent"));
            }
        }
        let mut result: TensorDesc = *self;
        result.start_offset = self.start_offset + self.offset_from_ndims(offsets);
        result.repeats[..self.ndims].copy_from_slice(shape);
        Ok(result)
    }

    /// Reinterprets a contiguous descriptor under a new shape. The element
    /// count must be preserved.
    pub fn reshape(&self, shape: &[u64]) -> Result<TensorDesc, Fail> {
        if shape.is_empty() || shape.len() > MAX_TENSOR_DIMS {
            return Err(Fail::new(libc::EINVAL, "descriptor rank out of range"));
        }
        if !self.is_contiguous() {
            return Err(Fail::new(libc::EINVAL, "cannot reshape a non-contiguous descriptor"));
        }
        let new_numel: u64 = shape.iter().product();
        if new_numel != self.numel() {
            return Err(Fail::new(libc::EINVAL, "reshape must preserve the element count"));
        }

        let mut result: TensorDesc = *self;
        result.ndims = shape.len();
        result.strides = [0; MAX_TENSOR_DIMS];
        result.repeats = [0; MAX_TENSOR_DIMS];
        let mut stride: u64 = 1;
        for i in (0..shape.len()).rev() {
            result.strides[i] = stride;
            result.repeats[i] = shape[i];
            stride *= shape[i];
        }
        result.validate()?;
        Ok(result)
    }

    /// Swaps two dimensions. The result is generally not normalized; callers
    /// feeding it back into the runtime go through [TensorDesc::normalized].
    pub fn transpose(&self, x: usize, y: usize) -> Result<TensorDesc, Fail> {
        if x >= self.ndims || y >= self.ndims {
            return Err(Fail::new(libc::EINVAL, "transpose axis out of range"));
        }
        let mut result: TensorDesc = *self;
        result.strides.swap(x, y);
        result.repeats.swap(x, y);
        Ok(result)
    }

    /// Decomposes the start offset into per-dimension indices. Well-defined
    /// for normalized descriptors, where strides divide each other.
    pub fn offset_to_ndims(&self, offsets: &mut [u64; MAX_TENSOR_DIMS]) {
        let mut cur: u64 = self.start_offset;
        for i in 0..self.ndims {
            offsets[i] = cur / self.strides[i];
            cur %= self.strides[i];
        }
    }

    /// Recombines per-dimension indices into a flat element offset.
    pub fn offset_from_ndims(&self, offsets: &[u64]) -> u64 {
        let mut result: u64 = 0;
        for i in 0..self.ndims {
            result += offsets[i] * self.strides[i];
        }
        result
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Debug trait implementation.
impl fmt::Debug for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorDesc")
            .field("base_addr", &self.base_addr)
            .field("buffer_size", &self.buffer_size)
            .field("start_offset", &self.start_offset)
            .field("strides", &&self.strides[..self.ndims])
            .field("repeats", &&self.repeats[..self.ndims])
            .field("dtype", &self.dtype)
            .field("version", &self.version)
            .field("overlap_mode", &self.overlap_mode)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
