// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for accelerator operations

use crate::trigger::RegisterSnapshot;
use filter_chip::dma::Direction;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for accelerator operations
pub type Result<T> = std::result::Result<T, FilterError>;

/// Errors that can occur while driving the accelerator
#[derive(Debug, Error)]
pub enum FilterError {
    /// Requested local clock outside the range the design closes timing at
    #[error("Local clock {mhz} MHz outside {min}-{max} MHz")]
    InvalidClock {
        /// Requested frequency
        mhz: f64,
        /// Lowest accepted frequency
        min: f64,
        /// Highest accepted frequency
        max: f64,
    },

    /// Bring-up parameters rejected before touching the card
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for rejection
        reason: String,
    },

    /// Vendor driver library could not be loaded
    #[error("Driver library unavailable: {reason}")]
    DriverUnavailable {
        /// Reason for failure
        reason: String,
    },

    /// No card available, or the card is already in use
    #[error("Failed to open card: {reason}")]
    DeviceOpen {
        /// Driver status string
        reason: String,
    },

    /// Card info or register space mapping unavailable
    #[error("Failed to query card: {reason}")]
    DeviceQuery {
        /// Driver status string
        reason: String,
    },

    /// Bank descriptor query failed for a fitted bank
    #[error("Failed to get info for bank {bank}: {reason}")]
    BankQuery {
        /// Bank index
        bank: usize,
        /// Driver status string
        reason: String,
    },

    /// Clock synthesiser rejected the requested rate
    #[error("Failed to set {clock} clock: {reason}")]
    ClockConfiguration {
        /// Which clock
        clock: &'static str,
        /// Driver status string
        reason: String,
    },

    /// Bitstream could not be loaded onto the card
    #[error("Failed to configure from {}: {reason}", .path.display())]
    ConfigurationLoad {
        /// Bitstream path
        path: PathBuf,
        /// Driver status string
        reason: String,
    },

    /// Local clock DCM did not lock after configuration
    #[error("LCLK DCM is not locked (status {status:#010x})")]
    ClockLock {
        /// Status register value
        status: u32,
    },

    /// Driver could not pin host memory for DMA
    #[error("Failed to allocate {size} byte DMA buffer: {reason}")]
    BufferAllocation {
        /// Requested capacity
        size: usize,
        /// Driver status string
        reason: String,
    },

    /// Driver could not set up a DMA descriptor
    #[error("Failed to set up DMA: {reason}")]
    DmaSetup {
        /// Driver status string
        reason: String,
    },

    /// Memory banks did not lock or train after reset
    #[error("Memory training failed: {reason} (status {status:#010x}, memstat {memstat:#010x})")]
    MemoryTraining {
        /// Which check failed
        reason: &'static str,
        /// Status register value
        status: u32,
        /// Memory status register value
        memstat: u32,
    },

    /// Transfer addressed a bank that is not fitted
    #[error("Bank {bank} is not fitted")]
    BankNotFitted {
        /// Bank index
        bank: usize,
    },

    /// Transfer larger than the pinned DMA buffer
    #[error("Transfer of {length} bytes exceeds {capacity} byte DMA buffer")]
    TransferTooLarge {
        /// Requested length
        length: usize,
        /// Pinned buffer capacity
        capacity: usize,
    },

    /// Transfer range runs past the end of the bank
    #[error("Transfer of {length} bytes at {offset:#x} runs past the {size} byte bank {bank}")]
    OutOfBank {
        /// Bank index
        bank: usize,
        /// Start offset within the bank
        offset: u64,
        /// Requested length
        length: usize,
        /// Bank capacity in bytes
        size: u64,
    },

    /// DMA transfer failed
    #[error("DMA {direction} failed: {reason}")]
    DmaTransfer {
        /// Transfer direction
        direction: Direction,
        /// Driver status string
        reason: String,
    },

    /// Finish flag never rose within the poll bound
    #[error("Processing timed out after {polls} polls ({snapshot})")]
    ProtocolTimeout {
        /// Number of finish polls performed
        polls: u32,
        /// Register values captured before disabling
        snapshot: RegisterSnapshot,
    },

    /// Frame geometry does not match what the operation expects
    #[error("Frame mismatch: {reason}")]
    FrameMismatch {
        /// Reason for failure
        reason: String,
    },

    /// I/O error while reading or writing frames
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Image encoding or decoding failed
    #[error("Image error: {source}")]
    Image {
        /// Underlying image error
        #[from]
        source: image::ImageError,
    },
}

impl FilterError {
    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a driver unavailable error
    pub fn driver_unavailable(reason: impl Into<String>) -> Self {
        Self::DriverUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a device open error
    pub fn device_open(reason: impl Into<String>) -> Self {
        Self::DeviceOpen {
            reason: reason.into(),
        }
    }

    /// Create a device query error
    pub fn device_query(reason: impl Into<String>) -> Self {
        Self::DeviceQuery {
            reason: reason.into(),
        }
    }

    /// Create a DMA setup error
    pub fn dma_setup(reason: impl Into<String>) -> Self {
        Self::DmaSetup {
            reason: reason.into(),
        }
    }

    /// Create a DMA transfer error
    pub fn dma_transfer(direction: Direction, reason: impl Into<String>) -> Self {
        Self::DmaTransfer {
            direction,
            reason: reason.into(),
        }
    }

    /// Create a frame mismatch error
    pub fn frame_mismatch(reason: impl Into<String>) -> Self {
        Self::FrameMismatch {
            reason: reason.into(),
        }
    }

    /// Whether this error can only come out of bring-up.
    ///
    /// These are fatal: no communicator exists afterwards.
    pub const fn is_bring_up(&self) -> bool {
        matches!(
            self,
            Self::InvalidClock { .. }
                | Self::InvalidConfig { .. }
                | Self::DriverUnavailable { .. }
                | Self::DeviceOpen { .. }
                | Self::DeviceQuery { .. }
                | Self::BankQuery { .. }
                | Self::ClockConfiguration { .. }
                | Self::ConfigurationLoad { .. }
                | Self::ClockLock { .. }
                | Self::BufferAllocation { .. }
                | Self::DmaSetup { .. }
                | Self::MemoryTraining { .. }
        )
    }

    /// Whether the frame loop may skip the current frame and carry on.
    pub const fn is_per_frame(&self) -> bool {
        matches!(self, Self::ProtocolTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bring_up_classification() {
        assert!(FilterError::device_open("busy").is_bring_up());
        assert!(FilterError::ClockLock { status: 0 }.is_bring_up());
        assert!(!FilterError::dma_transfer(Direction::ToCard, "abort").is_bring_up());
        assert!(!FilterError::BankNotFitted { bank: 3 }.is_per_frame());
    }

    #[test]
    fn dma_error_carries_status_string() {
        let err = FilterError::dma_transfer(Direction::ToHost, "DMA timed out");
        assert_eq!(err.to_string(), "DMA card→host failed: DMA timed out");
    }
}
