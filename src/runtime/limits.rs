// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Maximum number of dimensions in a tensor descriptor.
pub const MAX_TENSOR_DIMS: usize = 8;

/// Maximum number of packed arguments per task.
pub const MAX_TASK_ARGS: usize = 32;

/// Alignment of every shared-memory sub-region and of every device heap
/// allocation, in bytes.
pub const GM_ALIGNMENT: usize = 64;

/// Number of back-pressure iterations (each one reaps completions) before a
/// stuck pool slot, a full task window, or an exhausted heap is treated as a
/// configuration fault and the submission fails.
pub const BACKPRESSURE_SPIN_CAP: usize = 1 << 24;
