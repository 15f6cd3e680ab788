// SPDX-License-Identifier: AGPL-3.0-only

//! Communication layer for an ADM-XRC2 FPGA image filter.
//!
//! Brings the card up, moves frames through its paged 2 MiB memory window
//! and runs the refresh/enable/finish handshake that triggers one filter
//! pass per frame.
//!
//! # Backends
//!
//! ```text
//! Admxrc2Card   — vendor driver library via dlopen (real hardware)
//! SimulatedCard — register, memory and filter model (CI, development)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use filter_driver::{BringUpConfig, Communicator, SimulatedCard, run_trigger_protocol};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BringUpConfig::new(40.0, "filter.bit", 640 * 480).with_memory_clock(66.67);
//! let mut com = Communicator::open(SimulatedCard::default(), &config)?;
//!
//! let input = vec![0u8; 640 * 480];
//! let mut output = vec![0u8; 640 * 480];
//! run_trigger_protocol(&mut com, &input, &mut output, 640 * 480, 1000)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Banks
//!
//! | Bank | Use |
//! |------|-----|
//! | 0 | input plane, written before each pass |
//! | 1 | output plane, read after finish |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod banks;
pub mod backends;
mod communicator;
mod config;
mod dma;
mod driver;
mod error;
mod frame;
pub mod mmio;
mod pointer;
pub mod trigger;

pub use backends::{Admxrc2Card, BackendSelection, SimConfig, SimProbe, SimulatedCard};
pub use banks::BankTable;
pub use communicator::Communicator;
pub use config::{
    BringUpConfig, BringUpTiming, DEFAULT_MEMORY_BANKS, LOCAL_CLOCK_MAX_MHZ, LOCAL_CLOCK_MIN_MHZ,
};
pub use dma::PinnedBuffer;
pub use driver::{
    BackendType, BankInfo, CardDriver, CardHandle, CardInfo, Clock, DmaDescriptor, DmaRequest,
    DriverResult, DriverStatus,
};
pub use error::{FilterError, Result};
pub use frame::{run_colored, Converter, Frame, ImageSize, Interpolation};
pub use mmio::{MappedRegisters, RegisterSpace};
pub use pointer::{PointerRelay, PointerScope};
pub use trigger::{
    run_trigger_protocol, ProtocolState, ProtocolTiming, RegisterSnapshot, TriggerProtocol,
};

/// Register map and paging model (re-exported from filter-chip).
pub use filter_chip as chip;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        run_colored, run_trigger_protocol, BringUpConfig, CardDriver, Communicator, FilterError,
        Frame, ImageSize, PointerRelay, ProtocolTiming, Result, SimulatedCard, TriggerProtocol,
    };
}
