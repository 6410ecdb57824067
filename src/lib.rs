// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Device-side task orchestration runtime for heterogeneous accelerators.
//!
//! A scheduling core submits kernel launches expressed over strided tensor
//! descriptors. The runtime derives a dataflow dependency graph from
//! memory-overlap analysis and dispatches ready tasks to cube (matrix) and
//! vector compute workers through wait-free single-producer/single-consumer
//! rings laid out in a shared memory region.

mod collections;

pub mod orchestrator;
pub mod runtime;
pub mod tensor;

#[macro_use]
extern crate log;

pub use crate::{
    orchestrator::{
        worker::{
            KernelFn,
            KernelTable,
            Worker,
        },
        Orchestrator,
        Param,
        WorkerClass,
    },
    runtime::{
        config::RuntimeConfig,
        fail::Fail,
        memory::shm::{
            calculate_size,
            OwnedRegion,
            SharedMemoryHandle,
        },
    },
    tensor::{
        DataType,
        OverlapMode,
        OverlapStatus,
        TensorDesc,
    },
};

/// Asserts that two expressions are equal, bailing out of the enclosing test
/// with a descriptive error instead of panicking.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if *left != *right {
            ::anyhow::bail!(
                "ensure_eq failed: `{}` ({:?}) != `{}` ({:?})",
                stringify!($left),
                left,
                stringify!($right),
                right
            );
        }
    }};
}
