// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The scheduling-core side of the runtime: dependency derivation at
//! submission time, completion reaping, and watermark-driven reclamation.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod task;
pub mod tensormap;
pub mod worker;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    orchestrator::{
        task::{
            SuccessorPool,
            TaskState,
            TaskWindow,
        },
        tensormap::{
            LookupHit,
            TensorMap,
            TensorMapStats,
        },
        worker::KernelTable,
    },
    runtime::{
        config::RuntimeConfig,
        fail::Fail,
        limits::{
            BACKPRESSURE_SPIN_CAP,
            MAX_TASK_ARGS,
        },
        memory::{
            heap::{
                DeviceHeap,
                HeapStats,
            },
            shm::{
                SharedHeader,
                SharedMemoryHandle,
            },
        },
    },
    tensor::{
        OverlapStatus,
        TensorDesc,
    },
};
use ::arrayvec::ArrayVec;
use ::core::hint;
use ::std::sync::Arc;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of worker classes.
pub const NUM_WORKER_CLASSES: usize = 2;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Class of compute core a task is bound to. Further classes hang off this
/// enum; the shared-memory layout reserves one ready ring per variant.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerClass {
    /// Matrix-unit kernels.
    Cube = 0,
    /// Elementwise and reduction kernels.
    Vector = 1,
}

/// One parameter of a task submission.
///
/// `Output` descriptors with a zero base address receive a heap buffer at
/// submission time; the address is patched into the caller's descriptor.
/// `Inout` descriptors are read from and written to in place: the runtime
/// records dependencies on prior writers, bumps the descriptor version, and
/// reinstalls it as the newest producer.
pub enum Param<'a> {
    /// Raw value, packed into the argument vector as-is.
    Scalar(u64),
    /// Read-only tensor parameter.
    Input(&'a TensorDesc),
    /// Write-only tensor parameter.
    Output(&'a mut TensorDesc),
    /// Read-then-write tensor parameter.
    Inout(&'a mut TensorDesc),
}

/// The dispatcher. Exactly one instance runs, pinned to the scheduling
/// core: it is the sole writer of the tensor map, the sole consumer of the
/// completion ring, and the sole producer of the ready rings.
pub struct Orchestrator {
    /// This participant's view of the shared region.
    sm: SharedMemoryHandle,
    /// Kernel registry, shared with the workers.
    kernels: Arc<KernelTable>,
    /// Circular task window.
    window: TaskWindow,
    /// Region-to-producer index.
    tensormap: TensorMap,
    /// Successor-list node pool.
    successors: SuccessorPool,
    /// Device heap for runtime-allocated outputs.
    heap: DeviceHeap,
    /// Open submission scopes.
    scope_depth: usize,
    /// Final output region published at drain.
    graph_output: (u64, u64),
    /// Latched once the orchestration terminated (cleanly or not).
    done: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl WorkerClass {
    /// Converts a raw class value read from a shared slot.
    pub fn from_i32(value: i32) -> Option<WorkerClass> {
        match value {
            0 => Some(WorkerClass::Cube),
            1 => Some(WorkerClass::Vector),
            _ => None,
        }
    }
}

/// Associated functions.
impl Orchestrator {
    /// Builds the dispatcher over its shared-region handle. The handle must
    /// be the initializing attach; worker handles attach afterwards.
    pub fn new(sm: SharedMemoryHandle, kernels: Arc<KernelTable>, config: &RuntimeConfig) -> Result<Orchestrator, Fail> {
        // Safety: the layout assigns the window, successor pool, and tensor
        // map arrays to the scheduling core; workers only read task slots.
        let window: TaskWindow = TaskWindow::new(unsafe { sm.window_slots.alias() })?;
        let successors: SuccessorPool = SuccessorPool::new(unsafe { sm.successors.alias() });
        let tensormap: TensorMap = TensorMap::new(
            unsafe { sm.buckets.alias() },
            unsafe { sm.entries.alias() },
            unsafe { sm.task_heads.alias() },
            config.cleanup_interval,
        )?;
        let heap: DeviceHeap = DeviceHeap::new(sm.heap_addr(), sm.heap_len())?;

        Ok(Orchestrator {
            sm,
            kernels,
            window,
            tensormap,
            successors,
            heap,
            scope_depth: 0,
            graph_output: (0, 0),
            done: false,
        })
    }

    /// Submits a task. Resolves dependencies against prior writers, installs
    /// the task's own outputs as the newest producers, and publishes the
    /// task to its worker's ready ring once no predecessor is outstanding.
    ///
    /// Any failure is fatal to the orchestration: the errno is latched into
    /// the shared header and the done flag raised before returning.
    pub fn submit_task(
        &mut self,
        kernel_id: i32,
        worker_class: WorkerClass,
        debug_name: &str,
        params: &mut [Param],
    ) -> Result<i32, Fail> {
        match self.do_submit(kernel_id, worker_class, debug_name, params) {
            Ok(task_id) => Ok(task_id),
            Err(e) => {
                // Keep the first latched errno; refused late submissions do
                // not overwrite it.
                if !self.done {
                    self.fatal(&e);
                }
                Err(e)
            },
        }
    }

    fn do_submit(
        &mut self,
        kernel_id: i32,
        worker_class: WorkerClass,
        debug_name: &str,
        params: &mut [Param],
    ) -> Result<i32, Fail> {
        if self.done {
            return Err(Fail::new(libc::ECANCELED, "orchestration already terminated"));
        }
        if params.len() > MAX_TASK_ARGS {
            return Err(Fail::new(libc::EINVAL, "too many parameters"));
        }
        if !self.kernels.contains(kernel_id) {
            let cause: String = format!("unknown kernel (kernel_id={})", kernel_id);
            error!("submit_task(): {}", cause);
            return Err(Fail::new(libc::ENOENT, &cause));
        }

        // The window holds at most one slot per in-flight task id; wait for
        // the oldest task to retire before claiming a new id.
        let mut spins: usize = 0;
        while self.sm.header().next_task_id() - self.sm.header().last_task_alive()
            >= self.window.capacity() as i32
        {
            self.reap_completions()?;
            spins += 1;
            if spins > BACKPRESSURE_SPIN_CAP {
                return Err(Fail::new(libc::EAGAIN, "task window full"));
            }
        }

        let task_id: i32 = self.sm.header().alloc_task_id();
        trace!("submit_task(): task_id={} kernel_id={} name={}", task_id, kernel_id, debug_name);

        let mut args: ArrayVec<u64, MAX_TASK_ARGS> = ArrayVec::new();
        let mut outputs: ArrayVec<u64, MAX_TASK_ARGS> = ArrayVec::new();
        let mut predecessors: Vec<i32> = Vec::new();

        for param in params.iter_mut() {
            match param {
                Param::Scalar(value) => args.push(*value),
                Param::Input(desc) => {
                    if desc.base_addr == 0 {
                        return Err(Fail::new(libc::EINVAL, "input parameter has no buffer"));
                    }
                    let key: TensorDesc = desc.normalized()?;
                    self.collect_predecessors(&key, task_id, &mut predecessors);
                    args.push(key.data_addr());
                },
                Param::Output(desc) => {
                    let with_alloc: bool = desc.base_addr == 0;
                    if with_alloc {
                        desc.base_addr = self.alloc_with_backpressure(desc.buffer_size, task_id)?;
                    }
                    let key: TensorDesc = desc.normalized()?;
                    self.install_producer(&key, task_id, with_alloc)?;
                    outputs.push(key.data_addr());
                    args.push(key.data_addr());
                },
                Param::Inout(desc) => {
                    if desc.base_addr == 0 {
                        return Err(Fail::new(libc::EINVAL, "inout parameter has no buffer"));
                    }
                    let key: TensorDesc = desc.normalized()?;
                    self.collect_predecessors(&key, task_id, &mut predecessors);
                    // Readers submitted after this task must see the newer
                    // contents.
                    desc.version += 1;
                    let key: TensorDesc = desc.normalized()?;
                    self.install_producer(&key, task_id, false)?;
                    outputs.push(key.data_addr());
                    args.push(key.data_addr());
                },
            }
        }

        self.window.claim(task_id, &outputs);
        self.window.slot(task_id).fill(task_id, kernel_id, worker_class as i32, &args);

        // Chain onto every uncompleted predecessor. A predecessor observed
        // Completed has already had its successor walk on this very thread,
        // so its writes are ordered before this task's publication.
        let mut pending: i32 = 0;
        for predecessor in predecessors.iter().copied() {
            let (skip, head): (bool, i32) = {
                let slot: &task::TaskSlot = self.window.slot(predecessor);
                debug_assert_eq!(slot.task_id(), predecessor);
                let state: TaskState = slot.state();
                (
                    matches!(state, TaskState::Completed | TaskState::Retired),
                    slot.successor_head(),
                )
            };
            if skip {
                continue;
            }
            let node: i32 = self.successors.alloc(task_id, head)?;
            self.window.slot(predecessor).set_successor_head(node);
            self.window.slot(task_id).add_pending();
            pending += 1;
        }

        if pending == 0 {
            self.make_ready(task_id)?;
        }

        Ok(task_id)
    }

    /// Records the producers overlapping a read descriptor. Hits arrive
    /// newest first; a covering writer supersedes everything older than it,
    /// so the scan for this parameter stops there.
    fn collect_predecessors(&mut self, desc: &TensorDesc, task_id: i32, predecessors: &mut Vec<i32>) {
        let hits: Vec<LookupHit> = self.tensormap.lookup(desc);
        for hit in hits {
            // A task never depends on regions it installed itself.
            if hit.producer_task_id == task_id {
                continue;
            }
            if !predecessors.contains(&hit.producer_task_id) {
                predecessors.push(hit.producer_task_id);
            }
            if hit.status == OverlapStatus::Covered {
                break;
            }
        }
    }

    /// Installs a produced region, draining the target pool slot first. The
    /// slot clears once the entry occupying it goes stale, which takes at
    /// most one window turnover in a correctly sized system.
    fn install_producer(&mut self, desc: &TensorDesc, task_id: i32, with_alloc: bool) -> Result<(), Fail> {
        let mut spins: usize = 0;
        while self.tensormap.slot_busy() {
            self.reap_completions()?;
            self.sync_tensormap();
            spins += 1;
            if spins > BACKPRESSURE_SPIN_CAP {
                let cause: &str = "tensor map pool exhausted";
                error!("install_producer(): {}", cause);
                return Err(Fail::new(libc::EAGAIN, cause));
            }
            hint::spin_loop();
        }
        self.tensormap.insert(desc, task_id, with_alloc)
    }

    /// Allocates an output buffer, reaping completions under pressure:
    /// retirement releases the heap prefix of the oldest tasks.
    fn alloc_with_backpressure(&mut self, size: u64, task_id: i32) -> Result<u64, Fail> {
        let mut spins: usize = 0;
        loop {
            match self.heap.alloc(size, task_id) {
                Ok(addr) => return Ok(addr),
                Err(e) if e.errno == libc::ENOMEM => {
                    self.reap_completions()?;
                    spins += 1;
                    if spins > BACKPRESSURE_SPIN_CAP {
                        error!("alloc_with_backpressure(): heap exhausted (size={})", size);
                        return Err(e);
                    }
                    hint::spin_loop();
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves a task to Ready and hands it to its worker.
    fn make_ready(&mut self, task_id: i32) -> Result<(), Fail> {
        let class: usize = {
            let slot: &task::TaskSlot = self.window.slot(task_id);
            debug_assert_eq!(slot.pending_count(), 0);
            slot.set_state(TaskState::Ready);
            slot.worker_class_raw() as usize
        };
        if self.sm.ready[class].try_enqueue(task_id).is_err() {
            let cause: &str = "ready ring full";
            error!("make_ready(): {}", cause);
            return Err(Fail::new(libc::ENOBUFS, cause));
        }
        trace!("make_ready(): task_id={}", task_id);
        Ok(())
    }

    /// Drains the completion ring, promotes newly unblocked successors, and
    /// advances the retirement watermark.
    pub fn reap_completions(&mut self) -> Result<(), Fail> {
        let mut reaped: bool = false;
        while let Some(task_id) = self.sm.completion.try_dequeue() {
            self.on_complete(task_id)?;
            reaped = true;
        }
        if reaped {
            self.advance_watermark();
        }
        Ok(())
    }

    /// Processes one completion: walk the successor list, decrement each
    /// successor's pending count, and promote those that reach zero.
    fn on_complete(&mut self, task_id: i32) -> Result<(), Fail> {
        let head: i32 = {
            let slot: &task::TaskSlot = self.window.slot(task_id);
            debug_assert_eq!(slot.task_id(), task_id);
            debug_assert_eq!(slot.state(), TaskState::Dispatched);
            slot.set_state(TaskState::Completed);
            let head: i32 = slot.successor_head();
            slot.set_successor_head(-1);
            head
        };

        let mut cursor: i32 = head;
        while cursor >= 0 {
            let node: task::SuccessorNode = self.successors.node(cursor);
            let now_ready: bool = {
                let successor: &task::TaskSlot = self.window.slot(node.successor_task_id);
                successor.complete_predecessor() == 0
            };
            if now_ready {
                debug_assert_eq!(self.window.slot(node.successor_task_id).state(), TaskState::Pending);
                self.make_ready(node.successor_task_id)?;
            }
            cursor = node.next;
        }
        self.successors.free_chain(head);

        trace!("on_complete(): task_id={}", task_id);
        Ok(())
    }

    /// Retires the completed prefix of the window: each advance releases the
    /// task's heap allocations and ages its tensor map entries out.
    fn advance_watermark(&mut self) {
        let mut watermark: i32 = self.sm.header().last_task_alive();
        let next_task_id: i32 = self.sm.header().next_task_id();
        let mut advanced: bool = false;

        while watermark < next_task_id {
            let completed: bool = {
                let slot: &task::TaskSlot = self.window.slot(watermark);
                slot.task_id() == watermark && slot.state() == TaskState::Completed
            };
            if !completed {
                break;
            }
            self.window.slot(watermark).set_state(TaskState::Retired);
            watermark += 1;
            self.heap.release_below(watermark);
            advanced = true;
        }

        if advanced {
            self.sm.header().set_last_task_alive(watermark);
            self.tensormap.sync_validity(watermark);
            trace!("advance_watermark(): last_task_alive={}", watermark);
        }
    }

    /// Refreshes the tensor map's validity threshold from the header.
    fn sync_tensormap(&mut self) {
        let watermark: i32 = self.sm.header().last_task_alive();
        self.tensormap.sync_validity(watermark);
    }

    /// Opens a submission scope.
    pub fn scope_begin(&mut self) {
        self.scope_depth += 1;
    }

    /// Closes a submission scope. The close is a synchronization point:
    /// completions published by the workers so far are observed before the
    /// caller continues.
    pub fn scope_end(&mut self) -> Result<(), Fail> {
        debug_assert!(self.scope_depth > 0);
        self.scope_depth -= 1;
        self.reap_completions()
    }

    /// Runs `body` inside a submission scope, closing it on every path.
    pub fn scope<F>(&mut self, body: F) -> Result<(), Fail>
    where
        F: FnOnce(&mut Orchestrator) -> Result<(), Fail>,
    {
        self.scope_begin();
        let result: Result<(), Fail> = body(self);
        let end: Result<(), Fail> = self.scope_end();
        result.and(end)
    }

    /// Signals that no more tasks will be submitted, drains until every
    /// submitted task has retired, publishes the final output region, and
    /// raises the done flag so the workers exit.
    pub fn orchestration_done(&mut self) -> Result<(), Fail> {
        if self.done {
            return match self.sm.header().error() {
                0 => Ok(()),
                errno => Err(Fail::new(errno, "orchestration terminated by a fatal error")),
            };
        }

        while self.sm.header().last_task_alive() < self.sm.header().next_task_id() {
            if let Err(e) = self.reap_completions() {
                self.fatal(&e);
                return Err(e);
            }
            hint::spin_loop();
        }

        // Nothing is alive anymore; sweep the remaining producer entries.
        let watermark: i32 = self.sm.header().last_task_alive();
        self.tensormap.flush_retired(watermark);

        let (addr, size): (u64, u64) = self.graph_output;
        self.sm.header().set_graph_output(addr, size);
        self.sm.header().set_done();
        self.done = true;
        trace!("orchestration_done(): drained {} tasks", self.sm.header().next_task_id());
        Ok(())
    }

    /// Records the final output region published to the host at drain.
    pub fn set_graph_output(&mut self, desc: &TensorDesc) {
        self.graph_output = (desc.base_addr, desc.buffer_size);
    }

    /// Returns the byte address of the `output_index`-th OUTPUT/INOUT
    /// parameter of a task.
    pub fn get_output(&self, task_id: i32, output_index: usize) -> Result<u64, Fail> {
        self.window.output(task_id, output_index)
    }

    /// Returns the shared control block.
    pub fn header(&self) -> &SharedHeader {
        self.sm.header()
    }

    /// Returns the lifecycle state of an in-window task.
    pub fn task_state(&self, task_id: i32) -> TaskState {
        self.window.slot(task_id).state()
    }

    /// Returns the number of uncompleted predecessors of an in-window task.
    pub fn pending_count(&self, task_id: i32) -> i32 {
        self.window.slot(task_id).pending_count()
    }

    /// Returns a heap occupancy snapshot.
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Returns a tensor map occupancy snapshot.
    pub fn tensormap_stats(&self) -> TensorMapStats {
        self.tensormap.stats()
    }

    /// Latches a fatal failure into the shared header.
    fn fatal(&mut self, fail: &Fail) {
        error!("fatal(): {:?}", fail);
        self.sm.header().set_error(fail.errno);
        self.sm.header().set_done();
        self.done = true;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        Orchestrator,
        Param,
        WorkerClass,
    };
    use crate::{
        orchestrator::{
            task::TaskState,
            worker::KernelTable,
        },
        runtime::{
            config::RuntimeConfig,
            memory::shm::{
                calculate_size,
                OwnedRegion,
                SharedMemoryHandle,
            },
        },
        tensor::{
            DataType,
            TensorDesc,
        },
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    const KERNEL_NOOP: i32 = 0;

    fn kernel_noop(_args: &[u64]) {}

    fn small_config() -> RuntimeConfig {
        RuntimeConfig {
            task_window_size: 32,
            successor_pool_size: 128,
            tensormap_buckets: 16,
            tensormap_pool_size: 64,
            heap_size: 64 * 1024,
            cleanup_interval: 8,
        }
    }

    struct Harness {
        _region: OwnedRegion,
        rt: Orchestrator,
    }

    /// Builds a dispatcher over a fresh region, with no workers attached.
    fn make_harness() -> Result<Harness> {
        let config: RuntimeConfig = small_config();
        let region: OwnedRegion = OwnedRegion::new(calculate_size(&config)?)?;
        let sm: SharedMemoryHandle = SharedMemoryHandle::attach(region.as_mut_ptr(), region.len(), &config, true)?;
        let mut kernels: KernelTable = KernelTable::new(8);
        kernels.register(KERNEL_NOOP, kernel_noop).unwrap();
        let rt: Orchestrator = Orchestrator::new(sm, Arc::new(kernels), &config)?;
        Ok(Harness { _region: region, rt })
    }

    /// Stands in for a worker: pops one ready task of `class`, marks it
    /// dispatched, and publishes its completion.
    fn run_one(rt: &mut Orchestrator, class: WorkerClass) -> Option<i32> {
        let task_id: i32 = rt.sm.ready[class as usize].try_dequeue()?;
        let slot = rt.sm.window_slot(task_id);
        assert_eq!(slot.state(), TaskState::Ready);
        slot.set_state(TaskState::Dispatched);
        rt.sm.completion.enqueue(task_id);
        Some(task_id)
    }

    fn external_1d(harness_buf: &mut [f32]) -> TensorDesc {
        TensorDesc::contiguous_1d(
            harness_buf.as_mut_ptr() as u64,
            (harness_buf.len() * 4) as u64,
            DataType::Float32,
            0,
        )
        .unwrap()
    }

    /// Tests the diamond: readiness, completion propagation, retirement
    /// order, and successor node recycling.
    #[test]
    fn diamond_dependencies() -> Result<()> {
        let mut h: Harness = make_harness()?;
        let mut a_buf: Vec<f32> = vec![0.0; 64];
        let mut b_buf: Vec<f32> = vec![0.0; 64];
        let a: TensorDesc = external_1d(&mut a_buf);
        let b: TensorDesc = external_1d(&mut b_buf);
        let mut c: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();
        let mut d: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();
        let mut e: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();
        let mut f: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();

        let t0: i32 = h.rt.submit_task(
            KERNEL_NOOP,
            WorkerClass::Vector,
            "add",
            &mut [Param::Input(&a), Param::Input(&b), Param::Output(&mut c)],
        )?;
        let c_read: TensorDesc = c;
        let t1: i32 = h.rt.submit_task(
            KERNEL_NOOP,
            WorkerClass::Vector,
            "add_scalar",
            &mut [Param::Input(&c_read), Param::Scalar(1), Param::Output(&mut d)],
        )?;
        let t2: i32 = h.rt.submit_task(
            KERNEL_NOOP,
            WorkerClass::Vector,
            "add_scalar",
            &mut [Param::Input(&c_read), Param::Scalar(2), Param::Output(&mut e)],
        )?;
        let d_read: TensorDesc = d;
        let e_read: TensorDesc = e;
        let t3: i32 = h.rt.submit_task(
            KERNEL_NOOP,
            WorkerClass::Vector,
            "mul",
            &mut [Param::Input(&d_read), Param::Input(&e_read), Param::Output(&mut f)],
        )?;

        // The runtime allocated the intermediates.
        crate::ensure_eq!(c.base_addr != 0, true);
        crate::ensure_eq!(d.base_addr != 0, true);

        // Only the root is ready; the rest wait on their producers.
        crate::ensure_eq!(h.rt.task_state(t0), TaskState::Ready);
        crate::ensure_eq!(h.rt.pending_count(t1), 1);
        crate::ensure_eq!(h.rt.pending_count(t2), 1);
        crate::ensure_eq!(h.rt.pending_count(t3), 2);

        // Completing t0 readies both middle tasks at once.
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t0));
        h.rt.reap_completions()?;
        crate::ensure_eq!(h.rt.task_state(t1), TaskState::Ready);
        crate::ensure_eq!(h.rt.task_state(t2), TaskState::Ready);
        crate::ensure_eq!(h.rt.task_state(t3), TaskState::Pending);

        // Finishing the middle pair readies the join.
        run_one(&mut h.rt, WorkerClass::Vector);
        run_one(&mut h.rt, WorkerClass::Vector);
        h.rt.reap_completions()?;
        crate::ensure_eq!(h.rt.task_state(t3), TaskState::Ready);

        run_one(&mut h.rt, WorkerClass::Vector);
        h.rt.orchestration_done()?;

        // Retirement advanced in id order through the whole window.
        crate::ensure_eq!(h.rt.header().last_task_alive(), 4);
        crate::ensure_eq!(h.rt.task_state(t0), TaskState::Retired);
        crate::ensure_eq!(h.rt.task_state(t3), TaskState::Retired);
        crate::ensure_eq!(h.rt.header().is_done(), true);
        crate::ensure_eq!(h.rt.header().error(), 0);

        // Every successor node went back to the pool, and the drain swept
        // every producer entry out of the tensor map.
        crate::ensure_eq!(h.rt.successors.free_count(), small_config().successor_pool_size);
        crate::ensure_eq!(h.rt.tensormap_stats().valid_entries, 0);
        crate::ensure_eq!(h.rt.tensormap_stats().stale_entries, 0);

        Ok(())
    }

    /// Tests that a reader of a partially written range depends on every
    /// partial writer.
    #[test]
    fn partial_writers_accumulate() -> Result<()> {
        let mut h: Harness = make_harness()?;
        let mut x_buf: Vec<f32> = vec![0.0; 1536];
        let x: TensorDesc = external_1d(&mut x_buf);

        // Two writers of the first 1024 elements.
        let mut w0: TensorDesc = x.view(&[1024], &[0]).unwrap();
        let mut w1: TensorDesc = x.view(&[1024], &[0]).unwrap();
        let t0: i32 =
            h.rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "fill", &mut [Param::Output(&mut w0)])?;
        let t1: i32 =
            h.rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "fill", &mut [Param::Output(&mut w1)])?;

        // A reader of elements 512..1536 overlaps both writers partially.
        let reader_view: TensorDesc = x.view(&[1024], &[512]).unwrap();
        let mut out: TensorDesc = TensorDesc::alloc(4096, DataType::Float32).unwrap();
        let t2: i32 = h.rt.submit_task(
            KERNEL_NOOP,
            WorkerClass::Vector,
            "consume",
            &mut [Param::Input(&reader_view), Param::Output(&mut out)],
        )?;

        crate::ensure_eq!(h.rt.pending_count(t2), 2);

        // Writers hand off in submission order.
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t0));
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t1));
        h.rt.reap_completions()?;
        crate::ensure_eq!(h.rt.task_state(t2), TaskState::Ready);
        run_one(&mut h.rt, WorkerClass::Vector);
        h.rt.orchestration_done()?;
        Ok(())
    }

    /// Tests that a reader at the bumped version depends only on the
    /// in-place writer, not on the superseded one.
    #[test]
    fn version_skip() -> Result<()> {
        let mut h: Harness = make_harness()?;
        let mut x_buf: Vec<f32> = vec![0.0; 1024];
        let mut x: TensorDesc = external_1d(&mut x_buf);

        // Version-0 writer of the whole buffer.
        let t0: i32 = h.rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "init", &mut [Param::Output(&mut x)])?;

        // In-place update: reads version 0, writes version 1.
        let t1: i32 = h.rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "update", &mut [Param::Inout(&mut x)])?;
        crate::ensure_eq!(x.version, 1);
        crate::ensure_eq!(h.rt.pending_count(t1), 1);

        // Reader of version 1 sees the in-place writer covering its whole
        // range; the version-0 writer is superseded.
        let mut out: TensorDesc = TensorDesc::alloc(4096, DataType::Float32).unwrap();
        let t2: i32 = h.rt.submit_task(
            KERNEL_NOOP,
            WorkerClass::Vector,
            "consume",
            &mut [Param::Input(&x), Param::Output(&mut out)],
        )?;
        crate::ensure_eq!(h.rt.pending_count(t2), 1);

        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t0));
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t1));
        h.rt.reap_completions()?;
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t2));
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), None);
        h.rt.orchestration_done()?;
        crate::ensure_eq!(h.rt.header().last_task_alive(), 3);
        Ok(())
    }

    /// Tests that a predecessor observed Completed (but not yet retired,
    /// because an older task still runs) is not counted as pending.
    #[test]
    fn completed_predecessor_not_counted() -> Result<()> {
        let mut h: Harness = make_harness()?;
        let mut slow_buf: Vec<f32> = vec![0.0; 64];
        let mut fast_buf: Vec<f32> = vec![0.0; 64];
        let mut slow: TensorDesc = external_1d(&mut slow_buf);
        let mut fast: TensorDesc = external_1d(&mut fast_buf);

        let t0: i32 = h.rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "slow", &mut [Param::Output(&mut slow)])?;
        let t1: i32 = h.rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "fast", &mut [Param::Output(&mut fast)])?;

        // Dispatch both, but only the younger one completes: the watermark
        // stays pinned behind the older task.
        let first: i32 = h.rt.sm.ready[WorkerClass::Vector as usize].try_dequeue().unwrap();
        crate::ensure_eq!(first, t0);
        h.rt.sm.window_slot(t0).set_state(TaskState::Dispatched);
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t1));
        h.rt.reap_completions()?;
        crate::ensure_eq!(h.rt.task_state(t1), TaskState::Completed);
        crate::ensure_eq!(h.rt.header().last_task_alive(), 0);

        // A reader of the completed writer's region starts with nothing
        // pending: that completion was already processed on this thread.
        let reader: TensorDesc = fast;
        let mut out: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();
        let t2: i32 = h.rt.submit_task(
            KERNEL_NOOP,
            WorkerClass::Vector,
            "consume",
            &mut [Param::Input(&reader), Param::Output(&mut out)],
        )?;
        crate::ensure_eq!(h.rt.pending_count(t2), 0);
        crate::ensure_eq!(h.rt.task_state(t2), TaskState::Ready);

        // Let the straggler finish and drain.
        h.rt.sm.completion.enqueue(t0);
        crate::ensure_eq!(run_one(&mut h.rt, WorkerClass::Vector), Some(t2));
        h.rt.orchestration_done()?;
        crate::ensure_eq!(h.rt.header().last_task_alive(), 3);
        Ok(())
    }

    /// Tests output address bookkeeping and the graph output surface.
    #[test]
    fn outputs_and_graph_output() -> Result<()> {
        let mut h: Harness = make_harness()?;
        let mut c: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();
        let t0: i32 = h.rt.submit_task(KERNEL_NOOP, WorkerClass::Cube, "fill", &mut [Param::Output(&mut c)])?;

        crate::ensure_eq!(h.rt.get_output(t0, 0)?, c.base_addr);
        if h.rt.get_output(t0, 1).is_ok() {
            anyhow::bail!("querying a missing output index should fail");
        }

        h.rt.set_graph_output(&c);
        run_one(&mut h.rt, WorkerClass::Cube);
        h.rt.orchestration_done()?;
        crate::ensure_eq!(h.rt.header().graph_output(), (c.base_addr, 256));
        Ok(())
    }

    /// Tests that an unknown kernel is fatal and latched in the header.
    #[test]
    fn unknown_kernel_is_fatal() -> Result<()> {
        let mut h: Harness = make_harness()?;
        let mut c: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();
        match h.rt.submit_task(7, WorkerClass::Vector, "missing", &mut [Param::Output(&mut c)]) {
            Ok(_) => anyhow::bail!("submitting an unregistered kernel should fail"),
            Err(e) => crate::ensure_eq!(e.errno, libc::ENOENT),
        }
        crate::ensure_eq!(h.rt.header().is_done(), true);
        crate::ensure_eq!(h.rt.header().error(), libc::ENOENT);

        // Further submissions are refused.
        match h.rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "late", &mut [Param::Output(&mut c)]) {
            Ok(_) => anyhow::bail!("submitting after a fatal error should fail"),
            Err(e) => crate::ensure_eq!(e.errno, libc::ECANCELED),
        }
        Ok(())
    }

    /// Tests the scope helper closes on both paths.
    #[test]
    fn scope_closes() -> Result<()> {
        let mut h: Harness = make_harness()?;
        let mut c: TensorDesc = TensorDesc::alloc(256, DataType::Float32).unwrap();
        h.rt.scope(|rt| {
            rt.submit_task(KERNEL_NOOP, WorkerClass::Vector, "fill", &mut [Param::Output(&mut c)])?;
            Ok(())
        })?;
        crate::ensure_eq!(h.rt.scope_depth, 0);
        run_one(&mut h.rt, WorkerClass::Vector);
        h.rt.orchestration_done()?;
        Ok(())
    }
}
