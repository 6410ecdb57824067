// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::{
        raw_array::RawArray,
        ring::RingBuffer,
    },
    orchestrator::{
        task::{
            SuccessorNode,
            TaskSlot,
        },
        tensormap::TensorMapEntry,
        WorkerClass,
        NUM_WORKER_CLASSES,
    },
    runtime::{
        config::RuntimeConfig,
        fail::Fail,
        limits::GM_ALIGNMENT,
    },
};
use ::core::{
    alloc::Layout,
    mem,
    ptr,
    sync::atomic::{
        AtomicI32,
        AtomicU32,
        AtomicU64,
        Ordering,
    },
};
use ::std::alloc;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Stamp written by the first participant to attach to a region.
const SHARED_MAGIC: u32 = 0x5452_4e47;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Control block at the head of the shared region.
#[repr(C)]
pub struct SharedHeader {
    /// Region initialization stamp.
    magic: AtomicU32,
    /// Errno of a fatal failure, or zero.
    error: AtomicI32,
    /// Set once no further tasks will run: either the orchestration drained
    /// cleanly or a fatal error was latched.
    orchestrator_done: AtomicU32,
    /// Next task id to hand out.
    next_task_id: AtomicI32,
    /// Smallest task id that has not retired yet.
    last_task_alive: AtomicI32,
    /// Device address of the final output region, for host copy-back.
    graph_output_addr: AtomicU64,
    /// Size of the final output region in bytes.
    graph_output_size: AtomicU64,
}

/// Byte offsets of every sub-region inside the shared block.
#[derive(Clone, Copy, Debug)]
struct RegionLayout {
    ready: [usize; NUM_WORKER_CLASSES],
    completion: usize,
    ring_size: usize,
    window: usize,
    successors: usize,
    buckets: usize,
    entries: usize,
    task_heads: usize,
    heap: usize,
    total: usize,
}

/// One participant's view of the shared region. The scheduling core and
/// every worker attach their own handle over the same base pointer; the
/// first attach initializes the region.
pub struct SharedMemoryHandle {
    base: *mut u8,
    window_mask: usize,
    pub(crate) ready: [RingBuffer<i32>; NUM_WORKER_CLASSES],
    pub(crate) completion: RingBuffer<i32>,
    pub(crate) window_slots: RawArray<TaskSlot>,
    pub(crate) successors: RawArray<SuccessorNode>,
    pub(crate) buckets: RawArray<i32>,
    pub(crate) entries: RawArray<TensorMapEntry>,
    pub(crate) task_heads: RawArray<i32>,
    heap_base: *mut u8,
    heap_len: usize,
}

/// A zeroed, alignment-correct host allocation backing a shared region in
/// in-process harnesses and tests.
pub struct OwnedRegion {
    ptr: ptr::NonNull<u8>,
    layout: Layout,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Rounds `value` up to the shared-region alignment.
fn align_up(value: usize) -> usize {
    value.next_multiple_of(GM_ALIGNMENT)
}

/// Computes the sub-region offsets for a configuration.
fn compute_layout(config: &RuntimeConfig) -> Result<RegionLayout, Fail> {
    config.validate()?;

    // Rings hold twice the window so a full window of simultaneously ready
    // or completed tasks can never overflow them.
    let ring_size: usize = align_up(RingBuffer::<i32>::required_size(2 * config.task_window_size)?);

    let mut offset: usize = align_up(mem::size_of::<SharedHeader>());
    let mut take = |size: usize| -> usize {
        let at: usize = offset;
        offset += align_up(size);
        at
    };

    let ready: [usize; NUM_WORKER_CLASSES] = [take(ring_size), take(ring_size)];
    let completion: usize = take(ring_size);
    let window: usize = take(config.task_window_size * mem::size_of::<TaskSlot>());
    let successors: usize = take(config.successor_pool_size * mem::size_of::<SuccessorNode>());
    let buckets: usize = take(config.tensormap_buckets * mem::size_of::<i32>());
    let entries: usize = take(config.tensormap_pool_size * mem::size_of::<TensorMapEntry>());
    let task_heads: usize = take(config.task_window_size * mem::size_of::<i32>());
    let heap: usize = take(config.heap_size);

    Ok(RegionLayout {
        ready,
        completion,
        ring_size,
        window,
        successors,
        buckets,
        entries,
        task_heads,
        heap,
        total: offset,
    })
}

/// Returns the number of bytes of shared memory a configuration requires.
pub fn calculate_size(config: &RuntimeConfig) -> Result<usize, Fail> {
    Ok(compute_layout(config)?.total)
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions for the shared header.
impl SharedHeader {
    /// Stamps a freshly initialized region.
    fn init(&self) {
        self.error.store(0, Ordering::Relaxed);
        self.orchestrator_done.store(0, Ordering::Relaxed);
        self.next_task_id.store(0, Ordering::Relaxed);
        self.last_task_alive.store(0, Ordering::Relaxed);
        self.graph_output_addr.store(0, Ordering::Relaxed);
        self.graph_output_size.store(0, Ordering::Relaxed);
        self.magic.store(SHARED_MAGIC, Ordering::Release);
    }

    /// Verifies the stamp of an already initialized region.
    fn verify(&self) -> Result<(), Fail> {
        if self.magic.load(Ordering::Acquire) != SHARED_MAGIC {
            return Err(Fail::new(libc::EINVAL, "shared region is not initialized"));
        }
        Ok(())
    }

    /// Checks whether the orchestration has terminated.
    pub fn is_done(&self) -> bool {
        self.orchestrator_done.load(Ordering::Acquire) != 0
    }

    /// Marks the orchestration as terminated.
    pub fn set_done(&self) {
        self.orchestrator_done.store(1, Ordering::Release);
    }

    /// Returns the latched errno, or zero on a clean run.
    pub fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    /// Latches the errno of a fatal failure.
    pub fn set_error(&self, errno: i32) {
        self.error.store(errno, Ordering::Release);
    }

    /// Hands out the next task id.
    pub fn alloc_task_id(&self) -> i32 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the next task id that would be handed out.
    pub fn next_task_id(&self) -> i32 {
        self.next_task_id.load(Ordering::Relaxed)
    }

    /// Returns the retirement watermark.
    pub fn last_task_alive(&self) -> i32 {
        self.last_task_alive.load(Ordering::Acquire)
    }

    /// Publishes the retirement watermark.
    pub fn set_last_task_alive(&self, watermark: i32) {
        self.last_task_alive.store(watermark, Ordering::Release);
    }

    /// Returns the final output region `(addr, size)`.
    pub fn graph_output(&self) -> (u64, u64) {
        (
            self.graph_output_addr.load(Ordering::Acquire),
            self.graph_output_size.load(Ordering::Acquire),
        )
    }

    /// Publishes the final output region for host copy-back.
    pub fn set_graph_output(&self, addr: u64, size: u64) {
        self.graph_output_addr.store(addr, Ordering::Relaxed);
        self.graph_output_size.store(size, Ordering::Release);
    }
}

/// Associated functions for shared memory handles.
impl SharedMemoryHandle {
    /// Attaches to a shared region. The first participant passes
    /// `init = true` and initializes the control structures; later
    /// participants verify the stamp instead.
    pub fn attach(base: *mut u8, size: usize, config: &RuntimeConfig, init: bool) -> Result<SharedMemoryHandle, Fail> {
        if base.is_null() {
            return Err(Fail::new(libc::EINVAL, "cannot attach to a null region"));
        }
        if base.align_offset(GM_ALIGNMENT) != 0 {
            return Err(Fail::new(libc::EINVAL, "shared region is misaligned"));
        }
        let layout: RegionLayout = compute_layout(config)?;
        if size < layout.total {
            let cause: String = format!("shared region too small (size={}, required={})", size, layout.total);
            error!("attach(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        if init {
            // Slots must come up in the Empty state.
            unsafe {
                ptr::write_bytes(
                    base.add(layout.window),
                    0,
                    config.task_window_size * mem::size_of::<TaskSlot>(),
                );
            }
        }

        let ready: [RingBuffer<i32>; NUM_WORKER_CLASSES] = [
            RingBuffer::<i32>::from_raw_parts(init, unsafe { base.add(layout.ready[0]) }, layout.ring_size)?,
            RingBuffer::<i32>::from_raw_parts(init, unsafe { base.add(layout.ready[1]) }, layout.ring_size)?,
        ];
        let completion: RingBuffer<i32> =
            RingBuffer::<i32>::from_raw_parts(init, unsafe { base.add(layout.completion) }, layout.ring_size)?;

        let window_slots: RawArray<TaskSlot> = RawArray::from_raw_parts(
            unsafe { base.add(layout.window) } as *mut TaskSlot,
            config.task_window_size,
        )?;
        let successors: RawArray<SuccessorNode> = RawArray::from_raw_parts(
            unsafe { base.add(layout.successors) } as *mut SuccessorNode,
            config.successor_pool_size,
        )?;
        let buckets: RawArray<i32> =
            RawArray::from_raw_parts(unsafe { base.add(layout.buckets) } as *mut i32, config.tensormap_buckets)?;
        let entries: RawArray<TensorMapEntry> = RawArray::from_raw_parts(
            unsafe { base.add(layout.entries) } as *mut TensorMapEntry,
            config.tensormap_pool_size,
        )?;
        let task_heads: RawArray<i32> =
            RawArray::from_raw_parts(unsafe { base.add(layout.task_heads) } as *mut i32, config.task_window_size)?;

        let handle: SharedMemoryHandle = SharedMemoryHandle {
            base,
            window_mask: config.task_window_size - 1,
            ready,
            completion,
            window_slots,
            successors,
            buckets,
            entries,
            task_heads,
            heap_base: unsafe { base.add(layout.heap) },
            heap_len: config.heap_size,
        };

        if init {
            handle.header().init();
        } else {
            handle.header().verify()?;
        }

        Ok(handle)
    }

    /// Returns the shared control block.
    pub fn header(&self) -> &SharedHeader {
        // Safety: the header sits at the region base, which outlives the
        // handle; all header fields are atomic.
        unsafe { &*(self.base as *const SharedHeader) }
    }

    /// Returns the ready ring of a worker class.
    pub(crate) fn ready_ring(&self, class: WorkerClass) -> &RingBuffer<i32> {
        &self.ready[class as usize]
    }

    /// Returns the completion ring.
    pub(crate) fn completion_ring(&self) -> &RingBuffer<i32> {
        &self.completion
    }

    /// Returns the slot a task id maps to.
    pub fn window_slot(&self, task_id: i32) -> &TaskSlot {
        &self.window_slots[task_id as usize & self.window_mask]
    }

    /// Returns the device byte address of the heap region.
    pub fn heap_addr(&self) -> u64 {
        self.heap_base as u64
    }

    /// Returns the size of the heap region in bytes.
    pub fn heap_len(&self) -> usize {
        self.heap_len
    }
}

/// Associated functions for owned regions.
impl OwnedRegion {
    /// Allocates a zeroed region of `size` bytes at the shared alignment.
    pub fn new(size: usize) -> Result<OwnedRegion, Fail> {
        if size == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot allocate an empty region"));
        }
        let layout: Layout = match Layout::from_size_align(size, GM_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => return Err(Fail::new(libc::EINVAL, "invalid region layout")),
        };
        let ptr: ptr::NonNull<u8> = {
            let ptr: *mut u8 = unsafe { alloc::alloc_zeroed(layout) };
            match ptr::NonNull::new(ptr) {
                Some(p) => p,
                None => alloc::handle_alloc_error(layout),
            }
        };
        Ok(OwnedRegion { ptr, layout })
    }

    /// Returns the base pointer of the region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the size of the region in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Returns whether the region is empty. Never true for a live region.
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: a handle is moved to the core that uses it; every shared cell it
// exposes is either atomic or guarded by the SPSC ring protocol.
unsafe impl Send for SharedMemoryHandle {}

// Safety: the region is plain memory; synchronization is the responsibility
// of the structures laid out inside it.
unsafe impl Send for OwnedRegion {}
unsafe impl Sync for OwnedRegion {}

/// Drop trait implementation.
impl Drop for OwnedRegion {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
