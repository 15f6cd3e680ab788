// SPDX-License-Identifier: AGPL-3.0-only

//! Bring-up configuration
//!
//! Everything the [`Communicator`](crate::Communicator) needs to open and
//! configure a card. Parameters are checked by [`BringUpConfig::validate`]
//! before the first driver call.

use crate::error::{FilterError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lowest local clock the design closes timing at (MHz)
pub const LOCAL_CLOCK_MIN_MHZ: f64 = 24.0;

/// Highest local clock the design closes timing at (MHz)
pub const LOCAL_CLOCK_MAX_MHZ: f64 = 66.0;

/// Memory banks whose lock and trained flags must be set after reset
pub const DEFAULT_MEMORY_BANKS: u32 = 3;

/// Delays used during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringUpTiming {
    /// Wait after configuration before checking the clock DCM
    pub clock_settle: Duration,
    /// Memory reset pulse width
    pub reset_hold: Duration,
    /// Wait after releasing memory reset
    pub memory_settle: Duration,
}

impl Default for BringUpTiming {
    fn default() -> Self {
        Self {
            clock_settle: Duration::from_millis(500),
            reset_hold: Duration::from_millis(1),
            memory_settle: Duration::from_millis(500),
        }
    }
}

impl BringUpTiming {
    /// No delays. For the simulated card, whose flags settle instantly.
    pub const fn immediate() -> Self {
        Self {
            clock_settle: Duration::ZERO,
            reset_hold: Duration::ZERO,
            memory_settle: Duration::ZERO,
        }
    }
}

/// Card bring-up parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BringUpConfig {
    /// Local clock in MHz
    pub local_clock_mhz: f64,

    /// Memory clock in MHz (left at the board default when `None`)
    pub memory_clock_mhz: Option<f64>,

    /// FPGA bitstream
    pub bitstream: PathBuf,

    /// Capacity of each pinned DMA buffer in bytes
    pub buffer_size: usize,

    /// Banks checked for lock/training after memory reset
    pub memory_banks: u32,

    /// Bring-up delays
    pub timing: BringUpTiming,
}

impl BringUpConfig {
    /// Create a configuration with default memory clock, bank count and timing
    pub fn new(local_clock_mhz: f64, bitstream: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            local_clock_mhz,
            memory_clock_mhz: None,
            bitstream: bitstream.into(),
            buffer_size,
            memory_banks: DEFAULT_MEMORY_BANKS,
            timing: BringUpTiming::default(),
        }
    }

    /// Program the memory clock as well
    #[must_use]
    pub fn with_memory_clock(mut self, mhz: f64) -> Self {
        self.memory_clock_mhz = Some(mhz);
        self
    }

    /// Override the number of banks checked after memory reset
    #[must_use]
    pub fn with_memory_banks(mut self, banks: u32) -> Self {
        self.memory_banks = banks;
        self
    }

    /// Override bring-up delays
    #[must_use]
    pub fn with_timing(mut self, timing: BringUpTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Bitstream path
    pub fn bitstream(&self) -> &Path {
        &self.bitstream
    }

    /// Check parameters without touching any hardware
    ///
    /// # Errors
    ///
    /// Returns `InvalidClock` if the local clock is outside
    /// [`LOCAL_CLOCK_MIN_MHZ`]..=[`LOCAL_CLOCK_MAX_MHZ`], or `InvalidConfig`
    /// for a non-positive memory clock, an empty buffer or an empty bitstream
    /// path.
    pub fn validate(&self) -> Result<()> {
        // NaN fails both comparisons
        if !(LOCAL_CLOCK_MIN_MHZ..=LOCAL_CLOCK_MAX_MHZ).contains(&self.local_clock_mhz) {
            return Err(FilterError::InvalidClock {
                mhz: self.local_clock_mhz,
                min: LOCAL_CLOCK_MIN_MHZ,
                max: LOCAL_CLOCK_MAX_MHZ,
            });
        }

        if let Some(mhz) = self.memory_clock_mhz {
            if !mhz.is_finite() || mhz <= 0.0 {
                return Err(FilterError::invalid_config(format!(
                    "memory clock must be positive, got {mhz} MHz"
                )));
            }
        }

        if self.buffer_size == 0 {
            return Err(FilterError::invalid_config("DMA buffer size must be non-zero"));
        }

        if self.bitstream.as_os_str().is_empty() {
            return Err(FilterError::invalid_config("no bitstream given"));
        }

        Ok(())
    }
}

/// MHz to Hz as the clock synthesiser expects
pub(crate) fn mhz_to_hz(mhz: f64) -> f64 {
    mhz * 1.0e6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mhz: f64) -> BringUpConfig {
        BringUpConfig::new(mhz, "filter.bit", 4096)
    }

    #[test]
    fn clock_range_is_inclusive() {
        assert!(config(24.0).validate().is_ok());
        assert!(config(66.0).validate().is_ok());
        assert!(config(40.0).validate().is_ok());
    }

    #[test]
    fn out_of_range_clock_rejected() {
        for mhz in [10.0, 23.99, 66.01, f64::NAN] {
            assert!(
                matches!(config(mhz).validate(), Err(FilterError::InvalidClock { .. })),
                "{mhz} MHz accepted"
            );
        }
    }

    #[test]
    fn memory_clock_must_be_positive() {
        let err = config(40.0).with_memory_clock(0.0).validate().unwrap_err();
        assert!(matches!(err, FilterError::InvalidConfig { .. }));
        assert!(config(40.0).with_memory_clock(66.67).validate().is_ok());
    }

    #[test]
    fn empty_buffer_rejected() {
        let cfg = BringUpConfig::new(40.0, "filter.bit", 0);
        assert!(matches!(cfg.validate(), Err(FilterError::InvalidConfig { .. })));
    }

    #[test]
    fn defaults_match_reference_timing() {
        let cfg = config(40.0);
        assert_eq!(cfg.memory_banks, DEFAULT_MEMORY_BANKS);
        assert_eq!(cfg.timing.clock_settle, Duration::from_millis(500));
        assert_eq!(cfg.timing.reset_hold, Duration::from_millis(1));
        assert!((mhz_to_hz(40.0) - 40.0e6).abs() < f64::EPSILON);
    }
}
