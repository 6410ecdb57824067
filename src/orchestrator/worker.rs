// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    orchestrator::{
        task::{
            TaskSlot,
            TaskState,
        },
        WorkerClass,
    },
    runtime::{
        fail::Fail,
        limits::MAX_TASK_ARGS,
        memory::shm::SharedMemoryHandle,
    },
};
use ::arrayvec::ArrayVec;
use ::core::hint;
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A compute kernel. Receives the task's packed argument vector; slot
/// semantics are kernel-specific, except that host harnesses append the
/// device heap address and size as the final two slots.
pub type KernelFn = fn(&[u64]);

/// Dense registry from kernel id to entry point. Filled before launch and
/// shared read-only between the scheduling core and the workers.
pub struct KernelTable {
    kernels: Vec<Option<KernelFn>>,
}

/// A compute worker bound to one class. Sole consumer of its ready ring and
/// one of the producers feeding the completion ring.
pub struct Worker {
    class: WorkerClass,
    sm: SharedMemoryHandle,
    kernels: Arc<KernelTable>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions for the kernel table.
impl KernelTable {
    /// Creates a table with room for `capacity` kernel ids.
    pub fn new(capacity: usize) -> KernelTable {
        KernelTable {
            kernels: vec![None; capacity],
        }
    }

    /// Registers the entry point for a kernel id.
    pub fn register(&mut self, kernel_id: i32, kernel: KernelFn) -> Result<(), Fail> {
        let index: usize = kernel_id as usize;
        if kernel_id < 0 || index >= self.kernels.len() {
            return Err(Fail::new(libc::EINVAL, "kernel id out of range"));
        }
        if self.kernels[index].is_some() {
            return Err(Fail::new(libc::EEXIST, "kernel id already registered"));
        }
        self.kernels[index] = Some(kernel);
        Ok(())
    }

    /// Looks up the entry point for a kernel id.
    pub fn get(&self, kernel_id: i32) -> Option<KernelFn> {
        if kernel_id < 0 {
            return None;
        }
        self.kernels.get(kernel_id as usize).copied().flatten()
    }

    /// Checks whether a kernel id has a registered entry point.
    pub fn contains(&self, kernel_id: i32) -> bool {
        self.get(kernel_id).is_some()
    }
}

/// Associated functions for workers.
impl Worker {
    /// Creates a worker over its own view of the shared region.
    pub fn new(class: WorkerClass, sm: SharedMemoryHandle, kernels: Arc<KernelTable>) -> Worker {
        Worker { class, sm, kernels }
    }

    /// Runs the worker loop: pop a ready task, execute its kernel, publish
    /// the completion. Exits once the orchestration is done and the ready
    /// ring has drained.
    pub fn run(&self) {
        loop {
            match self.sm.ready_ring(self.class).try_dequeue() {
                Some(task_id) => self.execute(task_id),
                None => {
                    if self.sm.header().is_done() && self.sm.ready_ring(self.class).is_empty() {
                        break;
                    }
                    hint::spin_loop();
                },
            }
        }
        trace!("run(): worker {:?} exiting", self.class);
    }

    /// Executes one dispatched task.
    fn execute(&self, task_id: i32) {
        let slot: &TaskSlot = self.sm.window_slot(task_id);
        debug_assert_eq!(slot.state(), TaskState::Ready);
        debug_assert_eq!(slot.task_id(), task_id);
        slot.set_state(TaskState::Dispatched);

        // Safety: the task id arrived through an acquire dequeue of the
        // ready ring, ordering the scheduling core's payload writes before
        // this read.
        let (kernel_id, args): (i32, ArrayVec<u64, MAX_TASK_ARGS>) = unsafe { slot.read_payload() };

        match self.kernels.get(kernel_id) {
            Some(kernel) => kernel(&args),
            None => {
                // Submission validates kernel ids, so this means the table
                // handed to the worker differs from the scheduling core's.
                // Withholding the completion stalls the watermark; the host
                // observes the stall and recovers.
                error!("execute(): task {} references unknown kernel {}", task_id, kernel_id);
                return;
            },
        }

        self.sm.completion_ring().enqueue(task_id);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::KernelTable;
    use ::anyhow::Result;

    fn kernel_noop(_args: &[u64]) {}

    /// Tests registration and lookup on the kernel table.
    #[test]
    fn register_lookup() -> Result<()> {
        let mut table: KernelTable = KernelTable::new(4);
        crate::ensure_eq!(table.contains(0), false);

        table.register(0, kernel_noop).unwrap();
        crate::ensure_eq!(table.contains(0), true);
        crate::ensure_eq!(table.get(0).is_some(), true);

        // Ids outside the table resolve to nothing.
        crate::ensure_eq!(table.contains(4), false);
        crate::ensure_eq!(table.contains(-1), false);
        Ok(())
    }

    /// Tests that double registration and out-of-range ids are rejected.
    #[test]
    fn bad_register() -> Result<()> {
        let mut table: KernelTable = KernelTable::new(4);
        table.register(1, kernel_noop).unwrap();
        match table.register(1, kernel_noop) {
            Ok(()) => anyhow::bail!("registering a kernel id twice should fail"),
            Err(e) => crate::ensure_eq!(e.errno, libc::EEXIST),
        }
        match table.register(4, kernel_noop) {
            Ok(()) => anyhow::bail!("registering an out-of-range kernel id should fail"),
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
        }
        Ok(())
    }
}
