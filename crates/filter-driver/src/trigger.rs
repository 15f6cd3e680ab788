// SPDX-License-Identifier: AGPL-3.0-only

//! Processing trigger protocol
//!
//! One hardware pass per frame:
//!
//! ```text
//! Idle ─ write bank 0 ─► RefreshAsserted ─► RefreshCleared ─► Enabled
//!      ─► Polling ─┬─► Completed ─┬─► Disabled ─► Idle
//!                  └─► TimedOut  ─┘
//! ```
//!
//! Enable is always dropped before returning. Output is read from bank 1
//! only on completion; on timeout the caller gets
//! [`FilterError::ProtocolTimeout`] with the diagnostic registers and the
//! output buffer is left untouched.

use crate::communicator::Communicator;
use crate::driver::CardDriver;
use crate::error::{FilterError, Result};
use filter_chip::regs;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Bank the input plane is written to
pub const INPUT_BANK: usize = 0;

/// Bank the processed plane is read from
pub const OUTPUT_BANK: usize = 1;

/// Default number of finish polls before giving up
pub const DEFAULT_POLL_LIMIT: u32 = 1000;

/// Delays and poll bound of one protocol run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTiming {
    /// Refresh high time
    pub refresh_hold: Duration,
    /// Wait after refresh goes low
    pub refresh_settle: Duration,
    /// Sleep between finish polls
    pub poll_interval: Duration,
    /// Maximum number of finish polls
    pub poll_limit: u32,
}

impl Default for ProtocolTiming {
    fn default() -> Self {
        Self {
            refresh_hold: Duration::from_micros(200),
            refresh_settle: Duration::from_micros(100),
            poll_interval: Duration::from_micros(250),
            poll_limit: DEFAULT_POLL_LIMIT,
        }
    }
}

impl ProtocolTiming {
    /// No delays, default poll bound
    pub const fn immediate() -> Self {
        Self {
            refresh_hold: Duration::ZERO,
            refresh_settle: Duration::ZERO,
            poll_interval: Duration::ZERO,
            poll_limit: DEFAULT_POLL_LIMIT,
        }
    }

    /// Override the poll bound
    #[must_use]
    pub const fn with_poll_limit(mut self, poll_limit: u32) -> Self {
        self.poll_limit = poll_limit;
        self
    }
}

/// Protocol states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Nothing in flight
    Idle,
    /// Refresh register high
    RefreshAsserted,
    /// Refresh register back low
    RefreshCleared,
    /// Enable register high
    Enabled,
    /// Waiting for finish
    Polling,
    /// Finish observed
    Completed,
    /// Poll bound exhausted
    TimedOut,
    /// Enable register back low
    Disabled,
}

/// User block registers captured when a run times out
///
/// Finish is not part of the snapshot; it was just polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterSnapshot {
    /// Refresh register
    pub refresh: u32,
    /// Image size register
    pub image_size: u32,
    /// Enable register
    pub enable: u32,
    /// Debug registers following finish
    pub debug: [u32; regs::DEBUG_COUNT],
}

impl RegisterSnapshot {
    /// Read the snapshot registers
    pub fn capture<D: CardDriver>(com: &Communicator<D>) -> Self {
        let mut debug = [0; regs::DEBUG_COUNT];
        for (i, value) in debug.iter_mut().enumerate() {
            *value = com.read_register(regs::DEBUG_BASE + i);
        }
        Self {
            refresh: com.read_register(regs::REFRESH),
            image_size: com.read_register(regs::IMAGE_SIZE),
            enable: com.read_register(regs::ENABLE),
            debug,
        }
    }
}

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refresh={:#x} size={:#x} enable={:#x}",
            self.refresh, self.image_size, self.enable
        )?;
        for (i, value) in self.debug.iter().enumerate() {
            write!(f, " dbg{i}={value:#010x}")?;
        }
        Ok(())
    }
}

/// Trigger protocol runner
#[derive(Debug, Clone, Default)]
pub struct TriggerProtocol {
    timing: ProtocolTiming,
    state: Option<ProtocolState>,
}

impl TriggerProtocol {
    /// Runner with the given timing
    pub const fn new(timing: ProtocolTiming) -> Self {
        Self {
            timing,
            state: None,
        }
    }

    /// Timing in use
    pub const fn timing(&self) -> &ProtocolTiming {
        &self.timing
    }

    /// State reached by the last run (`Idle` before the first)
    pub fn state(&self) -> ProtocolState {
        self.state.unwrap_or(ProtocolState::Idle)
    }

    /// Program the image geometry of one plane
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` if either value does not fit a 32-bit
    /// register. Nothing is written in that case.
    pub fn configure<D: CardDriver>(
        &self,
        com: &Communicator<D>,
        total_size: usize,
        row_width: usize,
    ) -> Result<()> {
        let size = register_value("image size", total_size)?;
        let width = register_value("row width", row_width)?;
        debug!("Image geometry: {total_size} bytes, {row_width} pixels per row");
        com.write_register(regs::IMAGE_SIZE, size);
        com.write_register(regs::IMAGE_WIDTH, width);
        Ok(())
    }

    /// Program the plane size only
    ///
    /// # Errors
    ///
    /// Returns `FrameMismatch` if `total_size` does not fit a 32-bit register.
    pub fn set_image_size<D: CardDriver>(&self, com: &Communicator<D>, total_size: usize) -> Result<()> {
        com.write_register(regs::IMAGE_SIZE, register_value("image size", total_size)?);
        Ok(())
    }

    /// Run one pass: `input` to bank 0, trigger, `output` from bank 1
    ///
    /// Returns the number of finish polls it took.
    ///
    /// # Errors
    ///
    /// Returns transfer errors from either bank, or `ProtocolTimeout` if
    /// finish never rose within the poll bound. Enable is low again in
    /// every case past the input transfer.
    pub fn run<D: CardDriver>(
        &mut self,
        com: &mut Communicator<D>,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<u32> {
        self.enter(ProtocolState::Idle);
        com.write(INPUT_BANK, 0, input)?;

        com.write_register(regs::REFRESH, 1);
        self.enter(ProtocolState::RefreshAsserted);
        std::thread::sleep(self.timing.refresh_hold);

        com.write_register(regs::REFRESH, 0);
        self.enter(ProtocolState::RefreshCleared);
        std::thread::sleep(self.timing.refresh_settle);

        com.write_register(regs::ENABLE, 1);
        self.enter(ProtocolState::Enabled);

        self.enter(ProtocolState::Polling);
        let finished = self.poll(com);

        let outcome = match finished {
            Some(polls) => {
                self.enter(ProtocolState::Completed);
                Ok(polls)
            }
            None => {
                self.enter(ProtocolState::TimedOut);
                let snapshot = RegisterSnapshot::capture(com);
                warn!("Processing timed out after {} polls: {snapshot}", self.timing.poll_limit);
                Err(FilterError::ProtocolTimeout {
                    polls: self.timing.poll_limit,
                    snapshot,
                })
            }
        };

        com.write_register(regs::ENABLE, 0);
        self.enter(ProtocolState::Disabled);

        let polls = outcome?;
        com.read(OUTPUT_BANK, 0, output)?;
        self.enter(ProtocolState::Idle);
        debug!("Pass finished after {polls} polls");
        Ok(polls)
    }

    /// Poll finish, returning the poll count on which it was seen
    fn poll<D: CardDriver>(&self, com: &Communicator<D>) -> Option<u32> {
        for poll in 1..=self.timing.poll_limit {
            if com.read_register(regs::FINISH) != 0 {
                return Some(poll);
            }
            if poll < self.timing.poll_limit {
                std::thread::sleep(self.timing.poll_interval);
            }
        }
        None
    }

    fn enter(&mut self, state: ProtocolState) {
        trace!(?state, "trigger protocol");
        self.state = Some(state);
    }
}

/// Configure and run one pass with default delays
///
/// # Errors
///
/// Returns `FrameMismatch` if either buffer is shorter than `total_size`,
/// otherwise as [`TriggerProtocol::run`].
pub fn run_trigger_protocol<D: CardDriver>(
    com: &mut Communicator<D>,
    input: &[u8],
    output: &mut [u8],
    total_size: usize,
    poll_limit: u32,
) -> Result<u32> {
    if input.len() < total_size || output.len() < total_size {
        return Err(FilterError::frame_mismatch(format!(
            "buffers of {} and {} bytes for a {total_size} byte image",
            input.len(),
            output.len()
        )));
    }

    let mut protocol = TriggerProtocol::new(ProtocolTiming::default().with_poll_limit(poll_limit));
    protocol.set_image_size(com, total_size)?;
    protocol.run(com, &input[..total_size], &mut output[..total_size])
}

fn register_value(what: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| FilterError::frame_mismatch(format!("{what} {value} does not fit a 32-bit register")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_timing() {
        let timing = ProtocolTiming::default();
        assert_eq!(timing.refresh_hold, Duration::from_micros(200));
        assert_eq!(timing.refresh_settle, Duration::from_micros(100));
        assert_eq!(timing.poll_interval, Duration::from_micros(250));
        assert_eq!(timing.poll_limit, 1000);
    }

    #[test]
    fn snapshot_lists_debug_registers() {
        let snapshot = RegisterSnapshot {
            refresh: 0,
            image_size: 0x20,
            enable: 1,
            debug: [1, 2, 3],
        };
        let text = snapshot.to_string();
        assert!(text.starts_with("refresh=0x0 size=0x20 enable=0x1"));
        assert!(text.ends_with("dbg2=0x00000003"));
    }
}
