// SPDX-License-Identifier: AGPL-3.0-only

//! Card driver abstraction
//!
//! The vendor driver is a flat C API (open/close, info queries, clock
//! synthesiser, configuration, pinned memory, DMA). [`CardDriver`] is that
//! API with Rust types, so the [`Communicator`](crate::Communicator) can run
//! against real hardware or the simulated card.

use crate::dma::PinnedBuffer;
use crate::mmio::RegisterSpace;
use filter_chip::dma::{mode_word, Direction, IoWidth};
use std::fmt::Debug;
use std::path::Path;

/// Result of a raw driver call
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

/// Non-success status returned by the vendor driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    /// Raw status code
    pub code: i32,
    /// Status string reported by the driver
    pub message: String,
}

impl DriverStatus {
    /// Create a status from code and message
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status {})", self.message, self.code)
    }
}

/// Open card handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardHandle(i32);

impl CardHandle {
    /// Handle value the driver uses for "no card"
    pub const INVALID: Self = Self(-1);

    /// Wrap a raw handle
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether the handle refers to an open card
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

/// Opaque DMA descriptor returned by the driver for one pinned buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaDescriptor(u32);

impl DmaDescriptor {
    /// Wrap a raw descriptor
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw descriptor value
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Programmable clocks on the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Local bus / logic clock
    Local,
    /// Memory clock
    Memory,
}

impl Clock {
    /// Driver clock index
    pub const fn index(self) -> u32 {
        match self {
            Self::Local => 0,
            Self::Memory => 1,
        }
    }

    /// Human-readable name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Memory => "memory",
        }
    }
}

/// Card capability information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardInfo {
    /// Board type code
    pub board_type: u32,
    /// FPGA type code
    pub fpga_type: u32,
    /// Serial number
    pub serial: u64,
    /// Number of memory banks the board has slots for
    pub ram_banks: u32,
    /// Bitmask of fitted banks
    pub banks_fitted: u32,
}

impl CardInfo {
    /// Whether bank `bank` is reported as fitted
    pub const fn is_fitted(&self, bank: usize) -> bool {
        bank < 32 && bank < self.ram_banks as usize && self.banks_fitted & (1 << bank) != 0
    }
}

/// Per-bank descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankInfo {
    /// Memory type flags
    pub kind: u32,
    /// Data width in bits
    pub width: u32,
    /// Size in words of `width` bits
    pub size: u32,
}

impl BankInfo {
    /// Bank capacity in bytes
    pub const fn size_bytes(&self) -> u64 {
        self.size as u64 * (self.width as u64 / 8)
    }
}

/// One DMA transfer between a pinned buffer and the local bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRequest {
    /// Descriptor of the pinned buffer
    pub descriptor: DmaDescriptor,
    /// Offset into the pinned buffer
    pub buffer_offset: usize,
    /// Number of bytes
    pub length: usize,
    /// Local bus address
    pub local_address: u32,
    /// Transfer direction
    pub direction: Direction,
    /// Mode word
    pub mode: u32,
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Vendor ADM-XRC2 driver
    Admxrc2,

    /// Simulated card, no hardware required
    Simulated,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admxrc2 => write!(f, "ADM-XRC2"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Raw card driver interface
///
/// Every call maps onto one vendor driver entry point. Release calls
/// (`close_card`, `free_pinned`, `unsetup_dma`) cannot fail.
pub trait CardDriver: Debug + Send {
    /// Register space view handed out by [`map_registers`](Self::map_registers)
    type Registers: RegisterSpace;

    /// Open the first available card
    ///
    /// # Errors
    ///
    /// Returns the driver status if no card is available or it is in use.
    fn open_card(&mut self) -> DriverResult<CardHandle>;

    /// Close a card opened by [`open_card`](Self::open_card)
    fn close_card(&mut self, handle: CardHandle);

    /// Query card capability information
    ///
    /// # Errors
    ///
    /// Returns the driver status on failure.
    fn card_info(&mut self, handle: CardHandle) -> DriverResult<CardInfo>;

    /// Map the register space (local bus space 0)
    ///
    /// # Errors
    ///
    /// Returns the driver status if the space has no virtual mapping.
    fn map_registers(&mut self, handle: CardHandle) -> DriverResult<Self::Registers>;

    /// Query one bank descriptor
    ///
    /// # Errors
    ///
    /// Returns the driver status on failure.
    fn bank_info(&mut self, handle: CardHandle, bank: usize) -> DriverResult<BankInfo>;

    /// Program a clock, returning the frequency actually achieved in Hz
    ///
    /// # Errors
    ///
    /// Returns the driver status if the synthesiser rejects the rate.
    fn set_clock_rate(&mut self, handle: CardHandle, clock: Clock, hz: f64) -> DriverResult<f64>;

    /// Load a bitstream onto the FPGA
    ///
    /// # Errors
    ///
    /// Returns the driver status on a bad path or rejected bitstream.
    fn configure_from_file(&mut self, handle: CardHandle, path: &Path) -> DriverResult<()>;

    /// Allocate pinned host memory
    ///
    /// # Errors
    ///
    /// Returns the driver status if memory cannot be pinned.
    fn alloc_pinned(&mut self, size: usize) -> DriverResult<PinnedBuffer>;

    /// Release memory from [`alloc_pinned`](Self::alloc_pinned)
    fn free_pinned(&mut self, buffer: PinnedBuffer);

    /// Register a pinned buffer with the DMA engine
    ///
    /// # Errors
    ///
    /// Returns the driver status on failure.
    fn setup_dma(&mut self, handle: CardHandle, buffer: &PinnedBuffer) -> DriverResult<DmaDescriptor>;

    /// Release a descriptor from [`setup_dma`](Self::setup_dma)
    fn unsetup_dma(&mut self, handle: CardHandle, descriptor: DmaDescriptor);

    /// Build the DMA mode word for this card
    ///
    /// Defaults to a 32-bit local bus with no wait states.
    fn dma_mode_word(&self, info: &CardInfo, flags: u32) -> u32 {
        let _ = info;
        mode_word(IoWidth::Bits32, 0, flags)
    }

    /// Run one blocking DMA transfer
    ///
    /// # Errors
    ///
    /// Returns the driver status if the transfer fails.
    fn do_dma(&mut self, handle: CardHandle, request: &DmaRequest) -> DriverResult<()>;

    /// Backend type for logging
    fn backend_type(&self) -> BackendType;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitted_mask_respects_bank_count() {
        let info = CardInfo {
            ram_banks: 2,
            banks_fitted: 0b111,
            ..CardInfo::default()
        };
        assert!(info.is_fitted(0));
        assert!(info.is_fitted(1));
        assert!(!info.is_fitted(2));
        assert!(!info.is_fitted(40));
    }

    #[test]
    fn invalid_handle() {
        assert!(!CardHandle::INVALID.is_valid());
        assert!(CardHandle::new(3).is_valid());
    }

    #[test]
    fn bank_size_in_bytes() {
        let bank = BankInfo {
            kind: 0,
            width: 36,
            size: 512 * 1024,
        };
        assert_eq!(bank.size_bytes(), 2 * 1024 * 1024);
    }
}
