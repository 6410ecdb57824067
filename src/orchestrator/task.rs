// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::raw_array::RawArray,
    runtime::{
        fail::Fail,
        limits::MAX_TASK_ARGS,
    },
};
use ::arrayvec::ArrayVec;
use ::core::{
    cell::UnsafeCell,
    sync::atomic::{
        AtomicI32,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle of a task slot. A slot cycles
/// `Empty -> Pending -> Ready -> Dispatched -> Completed -> Retired` and is
/// then recycled for the task id one window-length later.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Empty = 0,
    Pending = 1,
    Ready = 2,
    Dispatched = 3,
    Completed = 4,
    Retired = 5,
}

/// One slot of the circular task window, resident in shared memory.
///
/// The scheduling core fills the payload and publishes the task id through a
/// ready ring; the release/acquire pair on that ring orders the payload
/// writes before the worker's reads. The worker flips the state to
/// `Dispatched` and, after running the kernel, publishes the id through the
/// completion ring.
#[repr(C)]
pub struct TaskSlot {
    /// Task occupying this slot.
    task_id: AtomicI32,
    /// Kernel to execute.
    kernel_id: AtomicI32,
    /// Worker class the task is bound to.
    worker_class: AtomicI32,
    /// Current lifecycle state.
    state: AtomicI32,
    /// Number of predecessors that have not completed yet.
    pending_count: AtomicI32,
    /// Head of the successor list in the successor pool, or -1.
    successor_head: AtomicI32,
    /// Number of valid entries in `args`.
    num_args: AtomicI32,
    /// Packed kernel arguments.
    args: UnsafeCell<[u64; MAX_TASK_ARGS]>,
}

/// A node of a task's successor list, drawn from the shared pool.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SuccessorNode {
    pub successor_task_id: i32,
    pub next: i32,
}

/// Fixed pool of successor-list nodes threaded through a free list.
pub struct SuccessorPool {
    nodes: RawArray<SuccessorNode>,
    free_head: i32,
    free_count: usize,
}

/// Scheduling-core view of the circular task window.
pub struct TaskWindow {
    slots: RawArray<TaskSlot>,
    mask: usize,
    /// Byte addresses of each task's OUTPUT/INOUT parameters, kept until the
    /// slot is recycled.
    outputs: Vec<ArrayVec<u64, MAX_TASK_ARGS>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TaskState {
    /// Converts a raw state value read from a shared slot.
    pub fn from_i32(value: i32) -> TaskState {
        match value {
            0 => TaskState::Empty,
            1 => TaskState::Pending,
            2 => TaskState::Ready,
            3 => TaskState::Dispatched,
            4 => TaskState::Completed,
            5 => TaskState::Retired,
            _ => unreachable!("invalid task state {}", value),
        }
    }
}

/// Associated functions for task slots.
impl TaskSlot {
    /// Returns the current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_i32(self.state.load(Ordering::Acquire))
    }

    /// Moves the slot to `state`.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as i32, Ordering::Release);
    }

    /// Returns the id of the task occupying this slot.
    pub fn task_id(&self) -> i32 {
        self.task_id.load(Ordering::Relaxed)
    }

    /// Returns the worker class the task is bound to.
    pub fn worker_class_raw(&self) -> i32 {
        self.worker_class.load(Ordering::Relaxed)
    }

    /// Returns the number of predecessors that have not completed.
    pub fn pending_count(&self) -> i32 {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// Records one more uncompleted predecessor.
    pub fn add_pending(&self) {
        self.pending_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the completion of one predecessor, returning the number of
    /// predecessors still outstanding.
    pub fn complete_predecessor(&self) -> i32 {
        self.pending_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Returns the head of the successor list, or -1.
    pub fn successor_head(&self) -> i32 {
        self.successor_head.load(Ordering::Relaxed)
    }

    /// Replaces the head of the successor list.
    pub fn set_successor_head(&self, head: i32) {
        self.successor_head.store(head, Ordering::Relaxed);
    }

    /// Fills the slot payload for a freshly claimed task. Called by the
    /// scheduling core only, before the task id is published anywhere.
    pub fn fill(&self, task_id: i32, kernel_id: i32, worker_class: i32, args: &[u64]) {
        debug_assert!(args.len() <= MAX_TASK_ARGS);
        self.task_id.store(task_id, Ordering::Relaxed);
        self.kernel_id.store(kernel_id, Ordering::Relaxed);
        self.worker_class.store(worker_class, Ordering::Relaxed);
        self.pending_count.store(0, Ordering::Relaxed);
        self.successor_head.store(-1, Ordering::Relaxed);
        self.num_args.store(args.len() as i32, Ordering::Relaxed);
        // Safety: the slot is in the Empty or Retired state, so no worker
        // holds a reference to the argument vector.
        unsafe {
            (&mut *self.args.get())[..args.len()].copy_from_slice(args);
        }
        self.set_state(TaskState::Pending);
    }

    /// Reads the kernel id and packed arguments of a dispatched task.
    ///
    /// # Safety
    ///
    /// The caller must have observed the task id through an acquire read of
    /// a ready ring, which orders the scheduling core's payload writes
    /// before this read.
    pub unsafe fn read_payload(&self) -> (i32, ArrayVec<u64, MAX_TASK_ARGS>) {
        let kernel_id: i32 = self.kernel_id.load(Ordering::Relaxed);
        let num_args: usize = (self.num_args.load(Ordering::Relaxed) as usize).min(MAX_TASK_ARGS);
        let mut args: ArrayVec<u64, MAX_TASK_ARGS> = ArrayVec::new();
        args.extend((&*self.args.get())[..num_args].iter().copied());
        (kernel_id, args)
    }
}

/// Associated functions for the successor pool.
impl SuccessorPool {
    /// Builds a pool over a node array, threading the free list through it.
    pub(crate) fn new(mut nodes: RawArray<SuccessorNode>) -> SuccessorPool {
        let capacity: usize = nodes.capacity();
        for i in 0..capacity {
            nodes[i] = SuccessorNode {
                successor_task_id: -1,
                next: if i + 1 < capacity { (i + 1) as i32 } else { -1 },
            };
        }
        SuccessorPool {
            nodes,
            free_head: 0,
            free_count: capacity,
        }
    }

    /// Takes a node off the free list, linking it in front of `next`.
    pub fn alloc(&mut self, successor_task_id: i32, next: i32) -> Result<i32, Fail> {
        let index: i32 = self.free_head;
        if index < 0 {
            let cause: &str = "successor pool exhausted";
            error!("alloc(): {}", cause);
            return Err(Fail::new(libc::EAGAIN, cause));
        }
        self.free_head = self.nodes[index as usize].next;
        self.free_count -= 1;
        self.nodes[index as usize] = SuccessorNode {
            successor_task_id,
            next,
        };
        Ok(index)
    }

    /// Reads the node at `index`.
    pub fn node(&self, index: i32) -> SuccessorNode {
        self.nodes[index as usize]
    }

    /// Returns a whole successor chain to the free list.
    pub fn free_chain(&mut self, head: i32) {
        let mut cursor: i32 = head;
        while cursor >= 0 {
            let next: i32 = self.nodes[cursor as usize].next;
            self.nodes[cursor as usize] = SuccessorNode {
                successor_task_id: -1,
                next: self.free_head,
            };
            self.free_head = cursor;
            self.free_count += 1;
            cursor = next;
        }
    }

    /// Returns the number of free nodes.
    pub fn free_count(&self) -> usize {
        self.free_count
    }
}

/// Associated functions for the task window.
impl TaskWindow {
    /// Builds the scheduling-core view over the shared slot array.
    pub(crate) fn new(slots: RawArray<TaskSlot>) -> Result<TaskWindow, Fail> {
        let capacity: usize = slots.capacity();
        if !capacity.is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "task window size must be a power of two"));
        }
        let mut outputs: Vec<ArrayVec<u64, MAX_TASK_ARGS>> = Vec::with_capacity(capacity);
        outputs.resize_with(capacity, ArrayVec::new);
        Ok(TaskWindow {
            slots,
            mask: capacity - 1,
            outputs,
        })
    }

    /// Returns the number of slots in the window.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns the slot index a task id maps to.
    pub fn slot_index(&self, task_id: i32) -> usize {
        task_id as usize & self.mask
    }

    /// Returns the slot a task id maps to.
    pub fn slot(&self, task_id: i32) -> &TaskSlot {
        &self.slots[self.slot_index(task_id)]
    }

    /// Claims the slot for a new task id, recording its output addresses.
    /// The previous occupant must have been retired.
    pub fn claim(&mut self, task_id: i32, outputs: &ArrayVec<u64, MAX_TASK_ARGS>) {
        let index: usize = self.slot_index(task_id);
        debug_assert!(matches!(self.slots[index].state(), TaskState::Empty | TaskState::Retired));
        self.outputs[index] = outputs.clone();
    }

    /// Returns the byte address of the `output_index`-th OUTPUT/INOUT
    /// parameter of `task_id`. Valid until the slot is recycled.
    pub fn output(&self, task_id: i32, output_index: usize) -> Result<u64, Fail> {
        let index: usize = self.slot_index(task_id);
        if self.slots[index].task_id() != task_id {
            return Err(Fail::new(libc::EINVAL, "task slot was recycled"));
        }
        match self.outputs[index].get(output_index) {
            Some(addr) => Ok(*addr),
            None => Err(Fail::new(libc::EINVAL, "output index out of range")),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: every field is either atomic or, in the case of the argument
// vector, written only while the slot is unpublished and read only after an
// acquire on the publishing ring.
unsafe impl Sync for TaskSlot {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        SuccessorNode,
        SuccessorPool,
        TaskSlot,
        TaskState,
        TaskWindow,
    };
    use crate::collections::raw_array::RawArray;
    use ::anyhow::Result;
    use ::arrayvec::ArrayVec;

    const POOL_SIZE: usize = 16;
    const WINDOW_SIZE: usize = 8;

    fn make_pool() -> SuccessorPool {
        SuccessorPool::new(RawArray::<SuccessorNode>::new_zeroed(POOL_SIZE).unwrap())
    }

    /// Tests allocation and chain release on the successor pool.
    #[test]
    fn successor_pool_alloc_free() -> Result<()> {
        let mut pool: SuccessorPool = make_pool();
        crate::ensure_eq!(pool.free_count(), POOL_SIZE);

        // Build a three-node chain: 12 -> 11 -> 10.
        let mut head: i32 = -1;
        for succ in 10..13 {
            head = pool.alloc(succ, head).unwrap();
        }
        crate::ensure_eq!(pool.free_count(), POOL_SIZE - 3);

        // Walk it back in LIFO order.
        let mut seen: Vec<i32> = Vec::new();
        let mut cursor: i32 = head;
        while cursor >= 0 {
            let node: SuccessorNode = pool.node(cursor);
            seen.push(node.successor_task_id);
            cursor = node.next;
        }
        crate::ensure_eq!(seen, vec![12, 11, 10]);

        pool.free_chain(head);
        crate::ensure_eq!(pool.free_count(), POOL_SIZE);
        Ok(())
    }

    /// Tests that pool exhaustion surfaces as an error rather than a wrap.
    #[test]
    fn successor_pool_exhaustion() -> Result<()> {
        let mut pool: SuccessorPool = make_pool();
        let mut head: i32 = -1;
        for succ in 0..POOL_SIZE as i32 {
            head = pool.alloc(succ, head).unwrap();
        }
        match pool.alloc(99, head) {
            Ok(_) => anyhow::bail!("allocating from an exhausted pool should fail"),
            Err(e) => crate::ensure_eq!(e.errno, libc::EAGAIN),
        }
        Ok(())
    }

    /// Tests the slot fill/read round-trip and state stepping.
    #[test]
    fn slot_lifecycle() -> Result<()> {
        let slots: RawArray<TaskSlot> = RawArray::<TaskSlot>::new_zeroed(WINDOW_SIZE).unwrap();
        let mut window: TaskWindow = TaskWindow::new(slots).unwrap();

        let mut outputs: ArrayVec<u64, { crate::runtime::limits::MAX_TASK_ARGS }> = ArrayVec::new();
        outputs.push(0xdead);
        window.claim(3, &outputs);
        window.slot(3).fill(3, 7, 1, &[1, 2, 3]);

        let slot: &TaskSlot = window.slot(3);
        crate::ensure_eq!(slot.state(), TaskState::Pending);
        crate::ensure_eq!(slot.task_id(), 3);
        crate::ensure_eq!(slot.pending_count(), 0);
        let (kernel_id, args) = unsafe { slot.read_payload() };
        crate::ensure_eq!(kernel_id, 7);
        crate::ensure_eq!(&args[..], &[1, 2, 3][..]);

        // Pending bookkeeping.
        slot.add_pending();
        slot.add_pending();
        crate::ensure_eq!(slot.complete_predecessor(), 1);
        crate::ensure_eq!(slot.complete_predecessor(), 0);

        // Output table survives until recycling.
        crate::ensure_eq!(window.output(3, 0)?, 0xdead);
        match window.output(3, 1) {
            Ok(_) => anyhow::bail!("out-of-range output index should fail"),
            Err(_) => {},
        }

        // A task id that maps to the same slot but is not resident fails.
        match window.output(3 + WINDOW_SIZE as i32, 0) {
            Ok(_) => anyhow::bail!("querying a non-resident task id should fail"),
            Err(_) => {},
        }

        Ok(())
    }
}
