// SPDX-License-Identifier: AGPL-3.0-only

//! Register space access
//!
//! The design's registers live in local bus space 0, which the vendor
//! driver maps into the process. Registers are addressed by 32-bit word
//! index. Nothing here attaches meaning to an index; see
//! [`filter_chip::regs`] for the map.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use std::fmt::Debug;
use std::ptr::NonNull;

/// Raw 32-bit register space indexed by word
pub trait RegisterSpace: Debug + Send {
    /// Read the register at `index`
    fn read(&self, index: usize) -> u32;

    /// Write `value` to the register at `index`
    fn write(&self, index: usize, value: u32);

    /// Number of addressable registers
    fn len(&self) -> usize;

    /// Whether the space has no registers
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Register space mapped by the vendor driver
///
/// The mapping belongs to the open card; it is torn down by the driver when
/// the card is closed, so this type does not unmap anything itself.
pub struct MappedRegisters {
    /// Virtual base of space 0
    base: NonNull<u32>,
    /// Number of 32-bit words in the mapping
    words: usize,
}

impl Debug for MappedRegisters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegisters")
            .field("base", &format_args!("{:p}", self.base))
            .field("words", &self.words)
            .finish()
    }
}

// SAFETY: Send - the mapping is process-wide and owned by the Communicator that owns the
// card; moving it between threads does not invalidate it. No thread-local state.
unsafe impl Send for MappedRegisters {}

impl MappedRegisters {
    /// Wrap a driver-provided mapping
    ///
    /// # Safety
    ///
    /// `base` must point to a device mapping valid for `bytes` bytes, 4-byte
    /// aligned, that stays mapped for the lifetime of the returned value.
    pub unsafe fn from_raw(base: NonNull<u8>, bytes: usize) -> Self {
        Self {
            base: base.cast(),
            words: bytes / 4,
        }
    }
}

impl RegisterSpace for MappedRegisters {
    /// # Panics
    ///
    /// Panics if `index` is outside the mapping.
    fn read(&self, index: usize) -> u32 {
        assert!(index < self.words, "Register index {index:#x} out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) base valid for words*4 bytes per from_raw contract; (2) index < words;
        // (3) u32 aligned. Caller guarantees: index in bounds (asserted).
        unsafe { std::ptr::read_volatile(self.base.as_ptr().add(index)) }
    }

    /// # Panics
    ///
    /// Panics if `index` is outside the mapping.
    fn write(&self, index: usize, value: u32) {
        assert!(index < self.words, "Register index {index:#x} out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) base valid per from_raw contract; (2) index < words; (3) u32 aligned.
        unsafe { std::ptr::write_volatile(self.base.as_ptr().add(index), value) }
    }

    fn len(&self) -> usize {
        self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_access_on_host_memory() {
        let mut backing = vec![0u32; 16];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        // SAFETY: backing outlives regs and is 4-byte aligned.
        let regs = unsafe { MappedRegisters::from_raw(base, backing.len() * 4) };

        regs.write(3, 0xdead_beef);
        assert_eq!(regs.read(3), 0xdead_beef);
        assert_eq!(regs.len(), 16);
        drop(regs);
        assert_eq!(backing[3], 0xdead_beef);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_range_index_panics() {
        let mut backing = vec![0u32; 4];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        // SAFETY: backing outlives regs.
        let regs = unsafe { MappedRegisters::from_raw(base, 16) };
        regs.read(4);
    }
}
