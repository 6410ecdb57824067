// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::limits::MAX_TENSOR_DIMS,
    tensor::{
        OverlapMode,
        Segment,
        TensorDesc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Relation between a candidate reader and a prior writer.
///
/// `Covered` means the reader's accessed range fully contains the writer's,
/// so the writer supersedes any older producer of the same range. `Other` is
/// a partial or conservative overlap: the reader must synchronize but gains
/// no covering guarantee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlapStatus {
    NoOverlap,
    Covered,
    Other,
}

/// Lazily enumerates the innermost contiguous element runs of a descriptor,
/// in ascending offset order. A normalized descriptor yields
/// `numel / repeats[ndims-1]` runs of `repeats[ndims-1]` elements each.
struct ContiguousRuns<'a> {
    desc: &'a TensorDesc,
    indexes: [u64; MAX_TENSOR_DIMS],
    seg: Segment,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<'a> ContiguousRuns<'a> {
    fn new(desc: &'a TensorDesc) -> Self {
        Self {
            desc,
            indexes: [0; MAX_TENSOR_DIMS],
            seg: Segment {
                begin: desc.start_offset,
                end: desc.start_offset + desc.repeats[desc.ndims - 1],
            },
        }
    }

    fn is_exhausted(&self) -> bool {
        self.indexes[0] >= self.desc.repeats[0]
    }

    /// Advances to the next run, carrying indices from the innermost
    /// dimension outward.
    fn advance(&mut self) {
        let ndims: usize = self.desc.ndims;
        let inner_run: u64 = self.desc.repeats[ndims - 1];
        self.indexes[ndims - 1] += inner_run;
        self.seg.begin += inner_run;
        for i in (1..ndims).rev() {
            if self.indexes[i] == self.desc.repeats[i] {
                self.indexes[i - 1] += 1;
                self.indexes[i] = 0;
                // Jump to the next outer iteration:
                // outer_stride - inner_stride * inner_repeats.
                self.seg.begin += self.desc.strides[i - 1] - self.desc.strides[i] * self.desc.repeats[i];
            }
        }
        self.seg.end = self.seg.begin + inner_run;
    }
}

/// Associated functions for overlap classification.
impl TensorDesc {
    /// Classifies the relation between this descriptor (the candidate
    /// reader) and `writer` (a prior producer of the same buffer).
    ///
    /// The classification proceeds through a sequence of refinements:
    /// different buffers or disjoint conservative byte bounds short-circuit
    /// to `NoOverlap`; a newer reader version or a fuzzy writer degrade to
    /// `Other`; matching 1-D or hyper-rectangular layouts are classified
    /// exactly; everything else falls back to a run-by-run merge.
    pub fn overlap(&self, writer: &TensorDesc) -> OverlapStatus {
        if !self.is_same_buffer(writer) {
            return OverlapStatus::NoOverlap;
        }
        // A reader can never refer to a version the buffer has not reached.
        debug_assert!(self.version >= writer.version);
        if self.version > writer.version {
            return OverlapStatus::Other;
        }

        // Compare conservative bounds in bytes so descriptors of different
        // element types stay comparable.
        let reader_bytes: Segment = self.byte_segment();
        let writer_bytes: Segment = writer.byte_segment();
        if !reader_bytes.intersects(&writer_bytes) {
            return OverlapStatus::NoOverlap;
        }

        if writer.overlap_mode == OverlapMode::Fuzzy {
            return OverlapStatus::Other;
        }

        // 1-D fast path: both segments are exact, not fuzzy bounds.
        if self.ndims == 1 && writer.ndims == 1 {
            debug_assert!(self.strides[0] == 1);
            debug_assert!(writer.strides[0] == 1);
            if reader_bytes.contains(&writer_bytes) {
                return OverlapStatus::Covered;
            } else {
                return OverlapStatus::Other;
            }
        }

        // Hyper-rectangle fast path: same dtype and identical strides allow
        // an O(ndims) per-dimension interval comparison.
        if self.dtype == writer.dtype && self.same_strides(writer) {
            let mut reader_idx: [u64; MAX_TENSOR_DIMS] = [0; MAX_TENSOR_DIMS];
            let mut writer_idx: [u64; MAX_TENSOR_DIMS] = [0; MAX_TENSOR_DIMS];
            self.offset_to_ndims(&mut reader_idx);
            writer.offset_to_ndims(&mut writer_idx);

            let mut need_general: bool = false;
            let mut all_contain: bool = true;
            let mut any_disjoint: bool = false;
            for i in 0..self.ndims {
                let reader_dim: Segment = Segment {
                    begin: reader_idx[i],
                    end: reader_idx[i] + self.repeats[i],
                };
                let writer_dim: Segment = Segment {
                    begin: writer_idx[i],
                    end: writer_idx[i] + writer.repeats[i],
                };
                // The per-dimension comparison is only sound when each inner
                // extent stays inside one iteration of its outer stride.
                if i > 0 {
                    if reader_dim.end * self.strides[i] > self.strides[i - 1] {
                        need_general = true;
                        break;
                    }
                    if writer_dim.end * writer.strides[i] > writer.strides[i - 1] {
                        need_general = true;
                        break;
                    }
                }
                if !reader_dim.intersects(&writer_dim) {
                    any_disjoint = true;
                } else if !reader_dim.contains(&writer_dim) {
                    all_contain = false;
                }
            }
            if !need_general {
                if any_disjoint {
                    return OverlapStatus::NoOverlap;
                } else if all_contain {
                    return OverlapStatus::Covered;
                } else {
                    return OverlapStatus::Other;
                }
            }
        }

        // General path: merge the contiguous runs of both descriptors.
        if self.runs_intersect(writer) {
            OverlapStatus::Other
        } else {
            OverlapStatus::NoOverlap
        }
    }

    /// Reports whether any innermost contiguous run of this descriptor
    /// shares a byte with a run of `other`. Worst case
    /// O(prod(repeats[0..ndims-1])) over both descriptors.
    pub fn runs_intersect(&self, other: &TensorDesc) -> bool {
        path_probe::record_general_path();

        let reader_elem: u64 = self.element_size();
        let writer_elem: u64 = other.element_size();

        let mut reader_runs: ContiguousRuns = ContiguousRuns::new(self);
        let mut writer_runs: ContiguousRuns = ContiguousRuns::new(other);
        while !reader_runs.is_exhausted() && !writer_runs.is_exhausted() {
            let reader_seg: Segment = Segment {
                begin: reader_runs.seg.begin * reader_elem,
                end: reader_runs.seg.end * reader_elem,
            };
            let writer_seg: Segment = Segment {
                begin: writer_runs.seg.begin * writer_elem,
                end: writer_runs.seg.end * writer_elem,
            };

            if reader_seg.end <= writer_seg.begin {
                reader_runs.advance();
            } else if writer_seg.end <= reader_seg.begin {
                writer_runs.advance();
            } else {
                return true;
            }
        }
        false
    }
}

//======================================================================================================================
// Path Probe
//======================================================================================================================

/// Counter of general-path classifications, so tests and diagnostics can
/// tell which route classified a descriptor pair. Thread-local: the counter
/// never leaks state across harness threads.
pub mod path_probe {
    use ::std::cell::Cell;

    thread_local! {
        static GENERAL_PATH_CALLS: Cell<u64> = Cell::new(0);
    }

    /// Resets the counter on the calling thread.
    pub fn reset() {
        GENERAL_PATH_CALLS.with(|c| c.set(0));
    }

    /// Returns the number of general-path classifications since the last reset.
    pub fn general_path_calls() -> u64 {
        GENERAL_PATH_CALLS.with(|c| c.get())
    }

    pub(crate) fn record_general_path() {
        GENERAL_PATH_CALLS.with(|c| c.set(c.get() + 1));
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
