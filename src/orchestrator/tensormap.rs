// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::raw_array::RawArray,
    runtime::fail::Fail,
    tensor::{
        OverlapStatus,
        TensorDesc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One entry of the tensor map: a region some task wrote, resident in the
/// ring-buffered entry pool. Entries are doubly linked through pool indices
/// into their hash bucket and singly linked into their producer task's entry
/// list, so the pool is relocation-safe.
#[repr(C)]
pub struct TensorMapEntry {
    /// The written region.
    pub desc: TensorDesc,
    /// Task that produced the region.
    pub producer_task_id: i32,
    /// Was the region's buffer allocated by the runtime at submission?
    pub with_alloc: bool,
    /// Is the entry linked into a bucket chain?
    pub in_bucket: bool,
    bucket_next: i32,
    bucket_prev: i32,
    task_next: i32,
    task_prev: i32,
}

/// A non-disjoint lookup result.
#[derive(Clone, Copy, Debug)]
pub struct LookupHit {
    /// Pool index of the matching entry.
    pub entry: usize,
    /// Task that produced the overlapping region.
    pub producer_task_id: i32,
    /// Overlap class between the probe and the entry.
    pub status: OverlapStatus,
}

/// Hash index from written memory regions to their producer tasks.
///
/// The hash key is the base address alone: every region backed by the same
/// buffer lands in the same bucket, so a lookup sees every prior writer that
/// could overlap the probe. Entries are invalidated lazily against the
/// retirement watermark: because insertion is head-only and task ids grow
/// monotonically, a bucket chain is descending by producer id, and the first
/// stale entry found during a walk proves the whole suffix stale.
pub struct TensorMap {
    /// Bucket heads, -1 when empty.
    buckets: RawArray<i32>,
    /// Ring-buffered entry pool.
    entries: RawArray<TensorMapEntry>,
    /// Per-window-slot head of the producer task's entry list, -1 when empty.
    task_heads: RawArray<i32>,
    /// Mask mapping task ids to window slots.
    window_mask: usize,
    /// Next pool slot to hand out.
    pool_head: usize,
    /// Smallest task id still alive; anything older is stale.
    last_task_alive: i32,
    /// Watermark at the time of the last eager cleanup.
    last_cleanup: i32,
    /// Watermark advances between eager cleanups.
    cleanup_interval: i32,
}

/// Occupancy snapshot of the map.
#[derive(Clone, Copy, Debug)]
pub struct TensorMapStats {
    pub valid_entries: usize,
    pub stale_entries: usize,
    pub max_chain: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions.
impl TensorMap {
    /// Builds the map over its shared-region arrays and initializes them.
    pub(crate) fn new(
        buckets: RawArray<i32>,
        entries: RawArray<TensorMapEntry>,
        task_heads: RawArray<i32>,
        cleanup_interval: i32,
    ) -> Result<TensorMap, Fail> {
        if !buckets.capacity().is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "bucket count must be a power of two"));
        }
        if !task_heads.capacity().is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "task head count must be a power of two"));
        }
        if cleanup_interval <= 0 {
            return Err(Fail::new(libc::EINVAL, "cleanup interval must be positive"));
        }
        let window_mask: usize = task_heads.capacity() - 1;
        let mut map: TensorMap = TensorMap {
            buckets,
            entries,
            task_heads,
            window_mask,
            pool_head: 0,
            last_task_alive: 0,
            last_cleanup: 0,
            cleanup_interval,
        };
        map.reset();
        Ok(map)
    }

    /// Clears all buckets, entries, and task lists.
    pub fn reset(&mut self) {
        for i in 0..self.buckets.capacity() {
            self.buckets[i] = -1;
        }
        for i in 0..self.entries.capacity() {
            let entry: &mut TensorMapEntry = &mut self.entries[i];
            entry.producer_task_id = -1;
            entry.with_alloc = false;
            entry.in_bucket = false;
            entry.bucket_next = -1;
            entry.bucket_prev = -1;
            entry.task_next = -1;
            entry.task_prev = -1;
        }
        for i in 0..self.task_heads.capacity() {
            self.task_heads[i] = -1;
        }
        self.pool_head = 0;
        self.last_task_alive = 0;
        self.last_cleanup = 0;
    }

    /// Hashes a base address to a bucket. Device pointers carry aligned low
    /// bits, so the high halves are folded in before masking.
    fn hash(&self, base_addr: u64) -> usize {
        let mut key: u64 = base_addr;
        key ^= key >> 16;
        key ^= key >> 32;
        (key & (self.buckets.capacity() as u64 - 1)) as usize
    }

    /// Checks whether the next pool slot is still occupied by a live entry.
    /// The caller relieves the pressure by advancing the watermark and
    /// re-syncing before retrying.
    pub fn slot_busy(&self) -> bool {
        self.entries[self.pool_head].in_bucket
    }

    /// Installs a region with its producer. The caller must have drained the
    /// target pool slot (see [TensorMap::slot_busy]).
    pub fn insert(&mut self, desc: &TensorDesc, producer_task_id: i32, with_alloc: bool) -> Result<(), Fail> {
        if self.slot_busy() {
            let cause: String = format!(
                "entry pool slot {} still occupied by task {}",
                self.pool_head, self.entries[self.pool_head].producer_task_id
            );
            error!("insert(): {}", cause);
            return Err(Fail::new(libc::EAGAIN, &cause));
        }

        let index: usize = self.pool_head;
        self.pool_head = (self.pool_head + 1) % self.entries.capacity();

        let bucket: usize = self.hash(desc.base_addr);
        let old_bucket_head: i32 = self.buckets[bucket];
        let task_slot: usize = producer_task_id as usize & self.window_mask;
        let old_task_head: i32 = self.task_heads[task_slot];

        {
            let entry: &mut TensorMapEntry = &mut self.entries[index];
            entry.desc = *desc;
            entry.producer_task_id = producer_task_id;
            entry.with_alloc = with_alloc;

            // Head insertion keeps the chain descending by producer id.
            entry.bucket_next = old_bucket_head;
            entry.bucket_prev = -1;
            entry.in_bucket = true;
            entry.task_next = old_task_head;
            entry.task_prev = -1;
        }
        if old_bucket_head >= 0 {
            self.entries[old_bucket_head as usize].bucket_prev = index as i32;
        }
        self.buckets[bucket] = index as i32;
        if old_task_head >= 0 {
            self.entries[old_task_head as usize].task_prev = index as i32;
        }
        self.task_heads[task_slot] = index as i32;

        Ok(())
    }

    /// Walks the probe's bucket and returns every entry whose region is not
    /// disjoint from it, newest producer first. The first stale entry found
    /// proves the rest of the chain stale; the suffix is unlinked on the
    /// spot and never reaches the overlap engine.
    pub fn lookup(&mut self, desc: &TensorDesc) -> Vec<LookupHit> {
        let bucket: usize = self.hash(desc.base_addr);
        let mut hits: Vec<LookupHit> = Vec::new();

        let mut prev: i32 = -1;
        let mut cursor: i32 = self.buckets[bucket];
        while cursor >= 0 {
            let index: usize = cursor as usize;
            if self.entries[index].producer_task_id < self.last_task_alive {
                // Truncate: terminate the chain at the predecessor and mark
                // the whole suffix as out of its bucket.
                if prev < 0 {
                    self.buckets[bucket] = -1;
                } else {
                    self.entries[prev as usize].bucket_next = -1;
                }
                let mut stale: i32 = cursor;
                while stale >= 0 {
                    let next: i32 = self.entries[stale as usize].bucket_next;
                    let entry: &mut TensorMapEntry = &mut self.entries[stale as usize];
                    entry.in_bucket = false;
                    entry.bucket_next = -1;
                    entry.bucket_prev = -1;
                    stale = next;
                }
                return hits;
            }

            let status: OverlapStatus = desc.overlap(&self.entries[index].desc);
            if status != OverlapStatus::NoOverlap {
                hits.push(LookupHit {
                    entry: index,
                    producer_task_id: self.entries[index].producer_task_id,
                    status,
                });
            }

            prev = cursor;
            cursor = self.entries[index].bucket_next;
        }

        hits
    }

    /// Publishes a new retirement watermark and, once enough tasks have
    /// retired since the last pass, eagerly unlinks their entries.
    pub fn sync_validity(&mut self, new_watermark: i32) {
        self.last_task_alive = new_watermark;
        if new_watermark - self.last_cleanup >= self.cleanup_interval {
            self.cleanup_retired(self.last_cleanup, new_watermark);
            self.last_cleanup = new_watermark;
        }
    }

    /// Unlinks every remaining entry of retired producers regardless of the
    /// cleanup interval. After a full drain, no linked entry refers to a
    /// retired task anymore.
    pub fn flush_retired(&mut self, new_watermark: i32) {
        self.last_task_alive = new_watermark;
        if new_watermark > self.last_cleanup {
            self.cleanup_retired(self.last_cleanup, new_watermark);
            self.last_cleanup = new_watermark;
        }
    }

    /// Unlinks every entry produced by the retired task range
    /// `[old_watermark, new_watermark)`. Window slots may already host
    /// entries of newer tasks, so only entries still carrying the retiring
    /// producer id are touched.
    fn cleanup_retired(&mut self, old_watermark: i32, new_watermark: i32) {
        for task_id in old_watermark..new_watermark {
            let task_slot: usize = task_id as usize & self.window_mask;
            let mut cursor: i32 = self.task_heads[task_slot];
            while cursor >= 0 {
                let next: i32 = self.entries[cursor as usize].task_next;
                if self.entries[cursor as usize].producer_task_id == task_id {
                    self.remove_from_bucket(cursor as usize);
                    self.remove_from_task(cursor as usize);
                }
                cursor = next;
            }
        }
        trace!("cleanup_retired(): [{}, {})", old_watermark, new_watermark);
    }

    /// Unlinks an entry from its bucket chain in O(1).
    fn remove_from_bucket(&mut self, index: usize) {
        if !self.entries[index].in_bucket {
            return;
        }
        let bucket_prev: i32 = self.entries[index].bucket_prev;
        let bucket_next: i32 = self.entries[index].bucket_next;
        if bucket_prev < 0 {
            let bucket: usize = self.hash(self.entries[index].desc.base_addr);
            self.buckets[bucket] = bucket_next;
        } else {
            self.entries[bucket_prev as usize].bucket_next = bucket_next;
        }
        if bucket_next >= 0 {
            self.entries[bucket_next as usize].bucket_prev = bucket_prev;
        }
        let entry: &mut TensorMapEntry = &mut self.entries[index];
        entry.in_bucket = false;
        entry.bucket_next = -1;
        entry.bucket_prev = -1;
    }

    /// Unlinks an entry from its producer task's list in O(1).
    fn remove_from_task(&mut self, index: usize) {
        let task_prev: i32 = self.entries[index].task_prev;
        let task_next: i32 = self.entries[index].task_next;
        if task_prev < 0 {
            let task_slot: usize = self.entries[index].producer_task_id as usize & self.window_mask;
            self.task_heads[task_slot] = task_next;
        } else {
            self.entries[task_prev as usize].task_next = task_next;
        }
        if task_next >= 0 {
            self.entries[task_next as usize].task_prev = task_prev;
        }
        let entry: &mut TensorMapEntry = &mut self.entries[index];
        entry.task_next = -1;
        entry.task_prev = -1;
    }

    /// Counts the entries that are linked and still valid.
    pub fn valid_count(&self) -> usize {
        let mut count: usize = 0;
        for i in 0..self.entries.capacity() {
            if self.entries[i].in_bucket && self.entries[i].producer_task_id >= self.last_task_alive {
                count += 1;
            }
        }
        count
    }

    /// Returns the length of the bucket chain a base address hashes to.
    pub fn chain_length(&self, base_addr: u64) -> usize {
        let mut length: usize = 0;
        let mut cursor: i32 = self.buckets[self.hash(base_addr)];
        while cursor >= 0 {
            length += 1;
            cursor = self.entries[cursor as usize].bucket_next;
        }
        length
    }

    /// Returns an occupancy snapshot.
    pub fn stats(&self) -> TensorMapStats {
        let mut valid: usize = 0;
        let mut stale: usize = 0;
        for i in 0..self.entries.capacity() {
            if self.entries[i].in_bucket {
                if self.entries[i].producer_task_id >= self.last_task_alive {
                    valid += 1;
                } else {
                    stale += 1;
                }
            }
        }
        let mut max_chain: usize = 0;
        for b in 0..self.buckets.capacity() {
            let mut length: usize = 0;
            let mut cursor: i32 = self.buckets[b];
            while cursor >= 0 {
                length += 1;
                cursor = self.entries[cursor as usize].bucket_next;
            }
            max_chain = max_chain.max(length);
        }
        TensorMapStats {
            valid_entries: valid,
            stale_entries: stale,
            max_chain,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
