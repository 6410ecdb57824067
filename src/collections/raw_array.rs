// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::core::{
    alloc::Layout,
    ops::{
        Deref,
        DerefMut,
    },
    ptr,
    slice,
};
use ::std::alloc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A fixed-capacity typed array.
///
/// Pools in this crate (task window, successor pool, tensor-map buckets and
/// entries) are index-linked arrays carved out of a shared memory region, so
/// this type supports both owned allocations and views over foreign memory.
pub struct RawArray<T> {
    /// Capacity of the array.
    cap: usize,
    /// Pointer to the underlying data.
    ptr: ptr::NonNull<T>,
    /// Is the underlying memory managed by this module?
    is_managed: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions.
impl<T> RawArray<T> {
    /// Creates a managed raw array with zero-initialized storage. Pools rely
    /// on all-zero bytes denoting the unoccupied state of a slot.
    pub fn new_zeroed(cap: usize) -> Result<RawArray<T>, Fail> {
        // Check if capacity is invalid.
        if cap == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot create a raw array with zero capacity"));
        }

        // Allocate underlying memory.
        let layout: Layout = match Layout::array::<T>(cap) {
            Ok(layout) => layout,
            Err(_) => return Err(Fail::new(libc::EAGAIN, "failed to create memory layout for raw array")),
        };
        let ptr: ptr::NonNull<T> = {
            let ptr: *mut u8 = unsafe { alloc::alloc_zeroed(layout) };
            match ptr::NonNull::new(ptr as *mut T) {
                Some(p) => p,
                None => alloc::handle_alloc_error(layout),
            }
        };

        Ok(RawArray {
            ptr,
            cap,
            is_managed: true,
        })
    }

    /// Constructs an unmanaged raw array over a foreign memory region.
    pub fn from_raw_parts(ptr: *mut T, len: usize) -> Result<RawArray<T>, Fail> {
        // Check if capacity is invalid.
        if len == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot create a raw array with zero capacity"));
        }

        // Check and cast the provided pointer.
        let ptr: ptr::NonNull<T> = match ptr::NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return Err(Fail::new(libc::EINVAL, "cannot create raw array from null pointer")),
        };

        Ok(RawArray {
            ptr,
            cap: len,
            is_managed: false,
        })
    }

    /// Creates another unmanaged view over the same memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure that at most one view mutates any given slot;
    /// the shared-region layout assigns each pool to exactly one owner.
    pub unsafe fn alias(&self) -> RawArray<T> {
        RawArray {
            ptr: self.ptr,
            cap: self.cap,
            is_managed: false,
        }
    }

    /// Gets a mutable slice to the underlying data in the target raw array.
    ///
    /// # Safety
    ///
    /// The caller must uphold the aliasing discipline of the backing region:
    /// for unmanaged arrays other participants may hold views over the same
    /// memory, and only one of them may mutate a given slot.
    pub unsafe fn get_mut(&self) -> &mut [T] {
        slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap)
    }

    /// Gets a slice to the underlying data in the target raw array.
    ///
    /// # Safety
    ///
    /// See [RawArray::get_mut].
    pub unsafe fn get(&self) -> &[T] {
        slice::from_raw_parts(self.ptr.as_ptr(), self.cap)
    }

    /// Returns the capacity of the target raw array.
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Dereference trait implementation.
impl<T> Deref for RawArray<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        unsafe { self.get() }
    }
}

/// Mutable dereference trait implementation.
impl<T> DerefMut for RawArray<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.get_mut() }
    }
}

/// Drop trait implementation.
impl<T> Drop for RawArray<T> {
    fn drop(&mut self) {
        // Check if underlying memory was allocated by this module.
        if self.is_managed {
            // Release underlying memory.
            let layout: Layout = Layout::array::<T>(self.cap).unwrap();
            unsafe {
                alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout);
            }
            self.is_managed = false;
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
