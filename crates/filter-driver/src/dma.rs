// SPDX-License-Identifier: AGPL-3.0-only

//! Pinned host buffers for DMA
//!
//! Memory is allocated and pinned by the card driver; this type only gives
//! bounds-checked views of it. Ownership goes back to the driver through
//! [`CardDriver::free_pinned`](crate::CardDriver::free_pinned).

use std::ptr::NonNull;

/// Driver-allocated, page-locked host buffer
#[derive(Debug)]
pub struct PinnedBuffer {
    /// Virtual address (user-space)
    ptr: NonNull<u8>,
    /// Size in bytes
    len: usize,
}

// SAFETY: PinnedBuffer owns its memory exclusively; the driver allocation is not tied to
// the allocating thread.
unsafe impl Send for PinnedBuffer {}

impl PinnedBuffer {
    /// Wrap a driver allocation
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, not aliased
    /// elsewhere, and stay allocated until handed back to the driver.
    pub const unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Give up ownership, returning the raw allocation
    pub const fn into_raw(self) -> (NonNull<u8>, usize) {
        (self.ptr, self.len)
    }

    /// Virtual address of the first byte
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Capacity in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero capacity
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get slice view of buffer for reading
    pub const fn as_slice(&self) -> &[u8] {
        // SAFETY: (1) ptr valid for len per from_raw contract; (2) we own the allocation;
        // (3) &self ensures no concurrent mutation through this type.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get mutable slice view of buffer for writing
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: (1) ptr valid for len; (2) &mut self gives exclusive access; (3) no aliasing.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_cover_allocation() {
        let raw = Box::into_raw(vec![0u8; 64].into_boxed_slice());
        let ptr = NonNull::new(raw.cast::<u8>()).unwrap();
        // SAFETY: ptr comes from a live 64-byte boxed slice reclaimed below.
        let mut buffer = unsafe { PinnedBuffer::from_raw(ptr, 64) };

        buffer.as_mut_slice()[63] = 7;
        assert_eq!(buffer.as_slice()[63], 7);
        assert_eq!(buffer.len(), 64);

        let (ptr, len) = buffer.into_raw();
        // SAFETY: reconstructs the boxed slice leaked above.
        let boxed = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) };
        assert_eq!(boxed[63], 7);
    }
}
