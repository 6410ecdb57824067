// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::raw_array,
    runtime::fail::Fail,
};
use ::core::{
    mem,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A wait-free, single-producer single-consumer, fixed-size circular buffer.
///
/// The producer publishes an item with release ordering and the consumer
/// observes it with acquire ordering, so everything the producer wrote before
/// the enqueue is visible to the consumer after the dequeue. Task readiness
/// and completion both ride on this guarantee.
pub struct RingBuffer<T> {
    // Indexes the first empty slot after the item in the back of the ring buffer.
    back_ptr: *mut usize,
    // Indexes the first item in the front of the ring buffer.
    front_ptr: *mut usize,
    // Underlying buffer.
    buffer: raw_array::RawArray<T>,
    // Pre-computed capacity mask for the buffer.
    mask: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions.
impl<T> RingBuffer<T>
where
    T: Copy,
{
    /// Constructs a ring buffer over a foreign memory region. The region
    /// holds the front and back indices followed by the slot array; the
    /// effective length is the largest power of two that fits. When `init`
    /// is set, the indices are reset; exactly one participant may do so.
    pub fn from_raw_parts(init: bool, mut ptr: *mut u8, size: usize) -> Result<RingBuffer<T>, Fail> {
        // Check if we have a valid pointer.
        if ptr.is_null() {
            return Err(Fail::new(
                libc::EINVAL,
                "cannot construct a ring buffer from a null pointer",
            ));
        }

        // Check if the memory region is properly aligned.
        let align_of_usize: usize = mem::align_of::<usize>();
        if ptr.align_offset(align_of_usize) != 0 {
            return Err(Fail::new(
                libc::EINVAL,
                "cannot construct a ring buffer from an unaligned memory region",
            ));
        }

        const SIZE_OF_USIZE: usize = mem::size_of::<usize>();
        let size_of_t: usize = mem::size_of::<T>();
        let mut size_of_ring: usize = SIZE_OF_USIZE + SIZE_OF_USIZE;

        // Compute pointers and required padding.
        let front_ptr: *mut usize = ptr as *mut usize;
        unsafe { ptr = ptr.add(SIZE_OF_USIZE) };
        let back_ptr: *mut usize = ptr as *mut usize;
        unsafe { ptr = ptr.add(SIZE_OF_USIZE) };
        let buffer_ptr: *mut u8 = {
            let padding: usize = ptr.align_offset(size_of_t.max(1));
            size_of_ring += padding;
            unsafe { ptr.add(padding) }
        };

        // Check if memory region is big enough.
        if size < (size_of_ring + size_of_t) {
            return Err(Fail::new(
                libc::EINVAL,
                "memory region is too small to fit in a ring buffer",
            ));
        }

        // Compute length of buffer.
        // It should be the highest power of two that fits in.
        let len: usize = {
            let maxlen: usize = (size - size_of_ring) / size_of_t;
            1 << maxlen.ilog2()
        };

        // Initialize back and front indices only if requested.
        if init {
            unsafe {
                *back_ptr = 0;
                *front_ptr = 0;
            }
        }

        Ok(RingBuffer {
            back_ptr,
            front_ptr,
            buffer: raw_array::RawArray::<T>::from_raw_parts(buffer_ptr as *mut T, len)?,
            mask: len - 1,
        })
    }

    /// Returns the number of bytes a region must provide so that a ring of
    /// `capacity` slots (a power of two) fits exactly.
    pub fn required_size(capacity: usize) -> Result<usize, Fail> {
        if !capacity.is_power_of_two() {
            return Err(Fail::new(
                libc::EINVAL,
                "ring buffer capacity must be a power of two",
            ));
        }
        let size_of_t: usize = mem::size_of::<T>();
        // Two index cells, worst-case alignment padding for T, then the slots.
        Ok(2 * mem::size_of::<usize>() + size_of_t.max(1) + capacity * size_of_t)
    }

    /// Returns the effective capacity of the target ring buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity() - 1
    }

    /// Peeks the target ring buffer and checks if it is full.
    #[allow(unused)]
    pub fn is_full(&self) -> bool {
        let front_cached: usize = self.get_front();
        let back_cached: usize = self.get_back();

        (back_cached + 1) & self.mask == front_cached
    }

    /// Peeks the target ring buffer and checks if it is empty.
    pub fn is_empty(&self) -> bool {
        let front_cached: usize = self.get_front();
        let back_cached: usize = self.get_back();

        back_cached == front_cached
    }

    /// Attempts to insert an item at the back of the target ring buffer.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let front_cached: usize = self.get_front();
        let back_cached: usize = self.get_back();

        // Check if the ring buffer is full.
        if (back_cached + 1) & self.mask == front_cached {
            return Err(item);
        }

        // Write.
        unsafe {
            let data: &mut [T] = self.buffer.get_mut();
            data[back_cached] = item;
        }

        // Commit write. Release pairs with the consumer's acquire of `back`.
        self.set_back((back_cached + 1) & self.mask);

        Ok(())
    }

    /// Inserts an item at the back of the target ring buffer. This function may block (spin).
    #[allow(unused)]
    pub fn enqueue(&self, item: T) {
        loop {
            if self.try_enqueue(item).is_ok() {
                break;
            }
        }
    }

    /// Attempts to remove the item from the front of the target ring buffer.
    pub fn try_dequeue(&self) -> Option<T> {
        let front_cached: usize = self.get_front();
        let back_cached: usize = self.get_back();

        // Check if the ring buffer is empty.
        if back_cached == front_cached {
            return None;
        }

        // Read.
        let item: T = unsafe {
            let data: &[T] = self.buffer.get();
            data[front_cached]
        };

        // Commit read. Release pairs with the producer's acquire of `front`.
        self.set_front((front_cached + 1) & self.mask);

        Some(item)
    }

    /// Removes the item from the front of the target ring buffer. This function may block (spin).
    #[allow(unused)]
    pub fn dequeue(&self) -> T {
        loop {
            if let Some(item) = self.try_dequeue() {
                break item;
            }
        }
    }

    /// Atomically gets the `front` index.
    fn get_front(&self) -> usize {
        self.front_atomic().load(Ordering::Acquire)
    }

    /// Atomically sets the `front` index.
    fn set_front(&self, val: usize) {
        self.front_atomic().store(val, Ordering::Release);
    }

    /// Atomically gets the `back` index.
    fn get_back(&self) -> usize {
        self.back_atomic().load(Ordering::Acquire)
    }

    /// Atomically sets the `back` index.
    fn set_back(&self, val: usize) {
        self.back_atomic().store(val, Ordering::Release);
    }

    /// Views the `front` index cell as an atomic.
    fn front_atomic(&self) -> &AtomicUsize {
        // Safety: AtomicUsize has the same in-memory representation as usize,
        // and the cell is only ever accessed atomically through this view.
        unsafe { &*(self.front_ptr as *const AtomicUsize) }
    }

    /// Views the `back` index cell as an atomic.
    fn back_atomic(&self) -> &AtomicUsize {
        // Safety: see [Self::front_atomic].
        unsafe { &*(self.back_ptr as *const AtomicUsize) }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Send trait implementation.
unsafe impl<T> Send for RingBuffer<T> {}

/// Sync trait implementation.
unsafe impl<T> Sync for RingBuffer<T> {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::RingBuffer;
    use ::anyhow::Result;
    use ::std::thread;

    /// Capacity for ring buffer.
    const RING_BUFFER_CAPACITY: usize = 4096;

    /// Backing storage for a ring of `RING_BUFFER_CAPACITY` task ids. Backed
    /// by u64 words so the index cells are naturally aligned.
    fn make_storage() -> Vec<u64> {
        let size: usize = RingBuffer::<i32>::required_size(RING_BUFFER_CAPACITY).unwrap();
        vec![0u64; size.div_ceil(8)]
    }

    /// Constructs a ring buffer over plain memory.
    fn do_from_raw(storage: &mut [u64]) -> Result<RingBuffer<i32>> {
        let size: usize = storage.len() * 8;
        let ring: RingBuffer<i32> = match RingBuffer::<i32>::from_raw_parts(true, storage.as_mut_ptr() as *mut u8, size)
        {
            Ok(ring) => ring,
            Err(e) => anyhow::bail!("constructing a ring buffer over a valid region should be possible: {:?}", e),
        };

        // Check if buffer has expected effective capacity.
        crate::ensure_eq!(ring.capacity(), RING_BUFFER_CAPACITY - 1);

        // Check if buffer state is consistent.
        crate::ensure_eq!(ring.is_empty(), true);
        crate::ensure_eq!(ring.is_full(), false);

        Ok(ring)
    }

    /// Tests if we succeed to construct a ring buffer from raw parts.
    #[test]
    fn from_raw_parts() -> Result<()> {
        let mut storage: Vec<u64> = make_storage();
        let _: RingBuffer<i32> = do_from_raw(&mut storage)?;
        Ok(())
    }

    /// Tests if we fail to construct a ring buffer from a null pointer.
    #[test]
    fn bad_from_raw_parts() -> Result<()> {
        match RingBuffer::<i32>::from_raw_parts(true, core::ptr::null_mut(), 256) {
            Ok(_) => anyhow::bail!("constructing a ring buffer from a null pointer should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests if we succeed to sequentially enqueue and dequeue task ids.
    #[test]
    fn enqueue_dequeue_sequential() -> Result<()> {
        let mut storage: Vec<u64> = make_storage();
        let ring: RingBuffer<i32> = do_from_raw(&mut storage)?;

        // Insert task ids in the ring buffer.
        for task_id in 0..ring.capacity() as i32 {
            ring.enqueue(task_id);
        }

        // Check if buffer state is consistent.
        crate::ensure_eq!(ring.is_empty(), false);
        crate::ensure_eq!(ring.is_full(), true);

        // A full ring must reject a push instead of overwriting.
        crate::ensure_eq!(ring.try_enqueue(-1).is_err(), true);

        // Remove task ids from the ring buffer.
        for task_id in 0..ring.capacity() as i32 {
            let item: i32 = ring.dequeue();
            crate::ensure_eq!(item, task_id);
        }

        // Check if buffer state is consistent.
        crate::ensure_eq!(ring.is_empty(), true);
        crate::ensure_eq!(ring.is_full(), false);

        Ok(())
    }

    /// Tests if a second participant attaching to the same region observes
    /// the items published by the first one.
    #[test]
    fn attach_existing() -> Result<()> {
        let mut storage: Vec<u64> = make_storage();
        let producer: RingBuffer<i32> = do_from_raw(&mut storage)?;

        producer.enqueue(7);
        producer.enqueue(8);

        let size: usize = storage.len() * 8;
        let consumer: RingBuffer<i32> =
            match RingBuffer::<i32>::from_raw_parts(false, storage.as_mut_ptr() as *mut u8, size) {
                Ok(ring) => ring,
                Err(e) => anyhow::bail!("attaching to an initialized ring should be possible: {:?}", e),
            };

        crate::ensure_eq!(consumer.dequeue(), 7);
        crate::ensure_eq!(consumer.dequeue(), 8);
        crate::ensure_eq!(consumer.is_empty(), true);

        Ok(())
    }

    /// Tests if we succeed to access a ring buffer concurrently.
    #[test]
    fn enqueue_dequeue_concurrent() -> Result<()> {
        let mut storage: Vec<u64> = make_storage();
        let ring: RingBuffer<i32> = do_from_raw(&mut storage)?;

        thread::scope(|s| {
            let writer: thread::ScopedJoinHandle<()> = s.spawn(|| {
                for task_id in 0..ring.capacity() as i32 {
                    ring.enqueue(task_id);
                }
            });
            let reader: thread::ScopedJoinHandle<()> = s.spawn(|| {
                for task_id in 0..ring.capacity() as i32 {
                    let item: i32 = ring.dequeue();
                    assert_eq!(item, task_id);
                }
            });

            writer.join().unwrap();
            reader.join().unwrap();
        });

        Ok(())
    }
}
