// SPDX-License-Identifier: AGPL-3.0-only

//! Local bus DMA parameters.
//!
//! The card's PCI bridge takes a 32-bit mode word per transfer. Its low bits
//! follow the PLX DMA mode register layout:
//!
//! ```text
//! bits 0-1  local bus width
//! bits 2-5  internal wait states
//! bit  6    honour READY#
//! bit  7    honour BTERM#
//! bit  8    local burst enable
//! ```
//!
//! Vendor drivers may add board-specific bits on top; see
//! `CardDriver::dma_mode_word` in the driver crate.

/// Direction of a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host memory to card memory.
    ToCard,
    /// Card memory to host memory.
    ToHost,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToCard => write!(f, "host→card"),
            Self::ToHost => write!(f, "card→host"),
        }
    }
}

/// Local bus data width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoWidth {
    /// 8-bit local bus.
    Bits8 = 0,
    /// 16-bit local bus.
    Bits16 = 1,
    /// 32-bit local bus.
    Bits32 = 3,
}

/// Mode word flags.
pub mod mode {
    /// Mask of the width field.
    pub const WIDTH_MASK: u32 = 0x3;
    /// Shift of the wait state field.
    pub const WAIT_SHIFT: u32 = 2;
    /// Mask of the wait state field (after shifting).
    pub const WAIT_MASK: u32 = 0xf;
    /// Honour the READY# input.
    pub const USE_READY: u32 = 1 << 6;
    /// Honour the BTERM# input.
    pub const USE_BTERM: u32 = 1 << 7;
    /// Enable local bus bursts.
    pub const BURST_ENABLE: u32 = 1 << 8;

    /// Flags used by every transfer of the filter design.
    pub const FILTER_FLAGS: u32 = USE_READY | USE_BTERM | BURST_ENABLE;
}

/// Build a mode word from its fields. Wait states above 15 are clamped.
#[must_use]
pub const fn mode_word(width: IoWidth, wait_states: u32, flags: u32) -> u32 {
    let wait = if wait_states > mode::WAIT_MASK {
        mode::WAIT_MASK
    } else {
        wait_states
    };
    (width as u32 & mode::WIDTH_MASK) | (wait << mode::WAIT_SHIFT) | flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_mode_word() {
        let word = mode_word(IoWidth::Bits32, 0, mode::FILTER_FLAGS);
        assert_eq!(word, 0x1c3);
    }

    #[test]
    fn wait_states_clamped() {
        let word = mode_word(IoWidth::Bits8, 40, 0);
        assert_eq!(word, 0xf << mode::WAIT_SHIFT);
    }
}
