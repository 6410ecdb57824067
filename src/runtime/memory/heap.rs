// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits::GM_ALIGNMENT,
};
use ::std::collections::VecDeque;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One live allocation, tagged with the task that requested it.
#[derive(Clone, Copy, Debug)]
struct HeapAlloc {
    task_id: i32,
    begin: usize,
    end: usize,
}

/// A bump allocator over the device heap region.
///
/// Allocations are handed out in task-submission order and released in task-
/// retirement order, so the live set always forms one contiguous span (which
/// may wrap around the end of the region). Freeing is a pointer move: when
/// the retirement watermark passes a task, the prefix of allocations tagged
/// with older task ids is released at once.
pub struct DeviceHeap {
    /// Device byte address of the heap region.
    base: u64,
    /// Size of the heap region in bytes.
    capacity: usize,
    /// Offset of the next allocation.
    head: usize,
    /// Offset of the oldest live allocation.
    tail: usize,
    /// Live allocations in allocation order.
    live: VecDeque<HeapAlloc>,
    /// Number of times the bump pointer wrapped to the start of the region.
    wraps: usize,
}

/// Occupancy snapshot of the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapStats {
    pub head: usize,
    pub tail: usize,
    pub live_allocs: usize,
    pub wraps: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions.
impl DeviceHeap {
    /// Creates a heap over `capacity` bytes of device memory at `base`.
    pub fn new(base: u64, capacity: usize) -> Result<DeviceHeap, Fail> {
        if capacity == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot create a heap over an empty region"));
        }
        if base as usize % GM_ALIGNMENT != 0 {
            return Err(Fail::new(libc::EINVAL, "heap base address is misaligned"));
        }
        Ok(DeviceHeap {
            base,
            capacity,
            head: 0,
            tail: 0,
            live: VecDeque::new(),
            wraps: 0,
        })
    }

    /// Allocates `size` bytes tagged with `task_id`, returning the device
    /// byte address. Allocation sizes round up to the region alignment.
    pub fn alloc(&mut self, size: u64, task_id: i32) -> Result<u64, Fail> {
        if size == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot allocate zero bytes"));
        }
        let size: usize = match (size as usize).checked_next_multiple_of(GM_ALIGNMENT) {
            Some(size) if size <= self.capacity => size,
            _ => {
                let cause: String = format!("allocation does not fit in the heap (size={})", size);
                error!("alloc(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            },
        };

        if self.live.is_empty() {
            self.head = 0;
            self.tail = 0;
        }

        let offset: usize = if self.live.is_empty() || self.tail < self.head {
            // Free space runs from head to the end of the region, then from
            // the start of the region to tail.
            if self.head + size <= self.capacity {
                self.head
            } else if size <= self.tail {
                self.wraps += 1;
                0
            } else {
                let cause: String = format!("heap exhausted (size={}, head={}, tail={})", size, self.head, self.tail);
                error!("alloc(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            }
        } else {
            // The span wrapped: free space runs from head to tail only.
            if self.head + size <= self.tail {
                self.head
            } else {
                let cause: String = format!("heap exhausted (size={}, head={}, tail={})", size, self.head, self.tail);
                error!("alloc(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            }
        };

        self.head = offset + size;
        self.live.push_back(HeapAlloc {
            task_id,
            begin: offset,
            end: self.head,
        });
        trace!("alloc(): task_id={} offset={} size={}", task_id, offset, size);
        Ok(self.base + offset as u64)
    }

    /// Releases every allocation whose task id lies below the retirement
    /// watermark. The freed span is the prefix of the live set, so the tail
    /// simply moves to the oldest surviving allocation.
    pub fn release_below(&mut self, watermark: i32) {
        while let Some(front) = self.live.front() {
            if front.task_id < watermark {
                trace!("release_below(): task_id={} begin={} end={}", front.task_id, front.begin, front.end);
                self.live.pop_front();
            } else {
                break;
            }
        }
        match self.live.front() {
            Some(front) => self.tail = front.begin,
            None => {
                self.head = 0;
                self.tail = 0;
            },
        }
    }

    /// Returns the device byte address of the heap region.
    pub fn base_addr(&self) -> u64 {
        self.base
    }

    /// Returns the size of the heap region in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns an occupancy snapshot.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            head: self.head,
            tail: self.tail,
            live_allocs: self.live.len(),
            wraps: self.wraps,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
