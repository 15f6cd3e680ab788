// SPDX-License-Identifier: AGPL-3.0-only

//! Accelerator communicator
//!
//! Owns one open card for its whole lifetime: the handle, the register
//! space, the bank table and one pinned DMA buffer per direction.
//! [`Communicator::open`] runs the full bring-up sequence and either
//! returns a ready communicator or releases everything it acquired.
//!
//! ```text
//! open card → query → banks → clocks → bitstream → DCM lock
//!           → pinned buffers → DMA descriptors → mode word
//!           → bank mode regs → memory reset → lock/training check
//! ```

use crate::banks::BankTable;
use crate::config::{mhz_to_hz, BringUpConfig};
use crate::dma::PinnedBuffer;
use crate::driver::{
    BackendType, CardDriver, CardHandle, CardInfo, Clock, DmaDescriptor, DmaRequest,
};
use crate::error::{FilterError, Result};
use crate::mmio::RegisterSpace;
use filter_chip::dma::{mode, Direction};
use filter_chip::paging::pages;
use filter_chip::regs::{self, memctl, status, MAX_BANK};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Relative deviation of an achieved clock rate that is worth a warning
const CLOCK_TOLERANCE: f64 = 0.01;

/// Pinned buffer and its DMA descriptor for one direction
#[derive(Debug)]
struct DmaChannel {
    buffer: PinnedBuffer,
    descriptor: Option<DmaDescriptor>,
}

/// Everything acquired from the driver, released on drop
///
/// Descriptors go first, then buffers, then the card, and only what was
/// actually acquired. This is what keeps a failed bring-up from leaking.
#[derive(Debug)]
struct Session<D: CardDriver> {
    driver: D,
    handle: CardHandle,
    to_card: Option<DmaChannel>,
    to_host: Option<DmaChannel>,
}

impl<D: CardDriver> Session<D> {
    const fn new(driver: D, handle: CardHandle) -> Self {
        Self {
            driver,
            handle,
            to_card: None,
            to_host: None,
        }
    }

    fn channel(&mut self, direction: Direction) -> Option<&mut DmaChannel> {
        match direction {
            Direction::ToCard => self.to_card.as_mut(),
            Direction::ToHost => self.to_host.as_mut(),
        }
    }
}

impl<D: CardDriver> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.handle.is_valid() {
            return;
        }

        let channels = [self.to_card.take(), self.to_host.take()];

        for channel in channels.iter().flatten() {
            if let Some(descriptor) = channel.descriptor {
                self.driver.unsetup_dma(self.handle, descriptor);
            }
        }
        for channel in channels.into_iter().flatten() {
            self.driver.free_pinned(channel.buffer);
        }

        self.driver.close_card(self.handle);
        self.handle = CardHandle::INVALID;
        debug!("Card closed");
    }
}

/// Write a register and read it back so the write is posted before returning
fn write_flush<R: RegisterSpace>(registers: &R, index: usize, value: u32) {
    registers.write(index, value);
    let _ = registers.read(index);
}

/// Check an achieved clock rate against the requested one
fn check_clock(clock: Clock, requested_hz: f64, achieved_hz: f64) {
    let deviation = ((achieved_hz - requested_hz) / requested_hz).abs();
    if deviation > CLOCK_TOLERANCE {
        warn!(
            "{} clock: requested {:.3} MHz, achieved {:.3} MHz",
            clock.name(),
            requested_hz / 1.0e6,
            achieved_hz / 1.0e6
        );
    } else {
        debug!("{} clock set to {:.3} MHz", clock.name(), achieved_hz / 1.0e6);
    }
}

/// Open, configured accelerator card
#[derive(Debug)]
pub struct Communicator<D: CardDriver> {
    // Declared before `session`: the mapping must go before the card is closed.
    registers: D::Registers,
    banks: BankTable,
    info: CardInfo,
    dma_mode: u32,
    local_clock_hz: f64,
    memory_clock_hz: Option<f64>,
    session: Session<D>,
}

impl<D: CardDriver> Communicator<D> {
    /// Bring up a card
    ///
    /// Parameters are validated before the driver is touched.
    ///
    /// # Errors
    ///
    /// Returns the bring-up error of the first step that fails. Everything
    /// acquired up to that point has been released when this returns.
    pub fn open(mut driver: D, config: &BringUpConfig) -> Result<Self> {
        config.validate()?;

        info!("Opening card ({} backend)", driver.backend_type());
        let handle = driver
            .open_card()
            .map_err(|status| FilterError::device_open(status.to_string()))?;
        let mut session = Session::new(driver, handle);

        let info = session
            .driver
            .card_info(handle)
            .map_err(|status| FilterError::device_query(status.to_string()))?;
        debug!(
            "Card info: board {:#x}, FPGA {:#x}, serial {}, {} banks (fitted {:#x})",
            info.board_type, info.fpga_type, info.serial, info.ram_banks, info.banks_fitted
        );

        let registers = session
            .driver
            .map_registers(handle)
            .map_err(|status| FilterError::device_query(status.to_string()))?;
        if registers.len() < regs::SPACE_WORDS {
            return Err(FilterError::device_query(format!(
                "register space has {} words, need {}",
                registers.len(),
                regs::SPACE_WORDS
            )));
        }

        let banks = query_banks(&mut session, &info)?;
        info!("{} memory banks fitted", banks.len());

        let local_hz = mhz_to_hz(config.local_clock_mhz);
        let local_clock_hz = set_clock(&mut session, Clock::Local, local_hz)?;
        let memory_clock_hz = match config.memory_clock_mhz {
            Some(mhz) => Some(set_clock(&mut session, Clock::Memory, mhz_to_hz(mhz))?),
            None => None,
        };

        info!("Configuring FPGA from {}", config.bitstream().display());
        session
            .driver
            .configure_from_file(handle, config.bitstream())
            .map_err(|status| FilterError::ConfigurationLoad {
                path: config.bitstream.clone(),
                reason: status.to_string(),
            })?;

        std::thread::sleep(config.timing.clock_settle);
        let lclk = registers.read(regs::STATUS);
        if lclk & status::LCLK_LOCKED == 0 {
            return Err(FilterError::ClockLock { status: lclk });
        }
        write_flush(&registers, regs::STATUS, status::LCLK_STICKY);
        debug!("LCLK DCM locked");

        for direction in [Direction::ToCard, Direction::ToHost] {
            let buffer = session
                .driver
                .alloc_pinned(config.buffer_size)
                .map_err(|status| FilterError::BufferAllocation {
                    size: config.buffer_size,
                    reason: status.to_string(),
                })?;
            let channel = Some(DmaChannel {
                buffer,
                descriptor: None,
            });
            match direction {
                Direction::ToCard => session.to_card = channel,
                Direction::ToHost => session.to_host = channel,
            }
        }
        debug!("Allocated 2 × {} byte pinned buffers", config.buffer_size);

        for direction in [Direction::ToCard, Direction::ToHost] {
            let Session {
                driver,
                to_card,
                to_host,
                ..
            } = &mut session;
            let channel = match direction {
                Direction::ToCard => to_card.as_mut(),
                Direction::ToHost => to_host.as_mut(),
            }
            .ok_or_else(|| FilterError::dma_setup(format!("no {direction} buffer")))?;
            let descriptor = driver
                .setup_dma(handle, &channel.buffer)
                .map_err(|status| FilterError::dma_setup(status.to_string()))?;
            channel.descriptor = Some(descriptor);
        }

        let dma_mode = session.driver.dma_mode_word(&info, mode::FILTER_FLAGS);
        debug!("DMA mode word {dma_mode:#x}");

        for bank in 0..MAX_BANK {
            write_flush(&registers, regs::mode(bank), regs::mode::ZBT_PIPELINE);
        }

        reset_memory(&registers, config.timing.reset_hold, config.timing.memory_settle);
        check_memory(&registers, config.memory_banks)?;

        info!("Card ready");
        Ok(Self {
            registers,
            banks,
            info,
            dma_mode,
            local_clock_hz,
            memory_clock_hz,
            session,
        })
    }

    /// Write `data` into bank `bank` starting at byte `offset`
    ///
    /// # Errors
    ///
    /// Returns `BankNotFitted`, `TransferTooLarge` or `OutOfBank` before
    /// any DMA, or `DmaTransfer` if a chunk fails. Bytes of earlier chunks
    /// may already be on the card in that case.
    pub fn write(&mut self, bank: usize, offset: u64, data: &[u8]) -> Result<()> {
        self.check_transfer(bank, offset, data.len())?;
        debug!("Write {} bytes to bank {bank} at {offset:#x}", data.len());
        self.select_bank(bank);

        for chunk in pages(offset, data.len() as u64) {
            trace!(?chunk, "host→card chunk");
            write_flush(&self.registers, regs::PAGE, chunk.page_register());

            let start = usize::try_from(chunk.moved).map_err(|_| self.too_large(data.len()))?;
            let len = usize::try_from(chunk.len).map_err(|_| self.too_large(data.len()))?;
            let channel = self.channel(Direction::ToCard)?;
            channel.buffer.as_mut_slice()[start..start + len].copy_from_slice(&data[start..start + len]);

            self.dma(Direction::ToCard, start, len, chunk.window_address())?;
        }
        Ok(())
    }

    /// Read `out.len()` bytes from bank `bank` starting at byte `offset`
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write). `out` is only partly filled when a
    /// chunk fails.
    pub fn read(&mut self, bank: usize, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_transfer(bank, offset, out.len())?;
        debug!("Read {} bytes from bank {bank} at {offset:#x}", out.len());
        self.select_bank(bank);

        for chunk in pages(offset, out.len() as u64) {
            trace!(?chunk, "card→host chunk");
            write_flush(&self.registers, regs::PAGE, chunk.page_register());

            let start = usize::try_from(chunk.moved).map_err(|_| self.too_large(out.len()))?;
            let len = usize::try_from(chunk.len).map_err(|_| self.too_large(out.len()))?;
            self.dma(Direction::ToHost, start, len, chunk.window_address())?;

            let channel = self.channel(Direction::ToHost)?;
            out[start..start + len].copy_from_slice(&channel.buffer.as_slice()[start..start + len]);
        }
        Ok(())
    }

    /// Write one register, followed by a read-back of the same index
    pub fn write_register(&self, index: usize, value: u32) {
        trace!("reg[{index:#04x}] ← {value:#x}");
        write_flush(&self.registers, index, value);
    }

    /// Read one register
    pub fn read_register(&self, index: usize) -> u32 {
        self.registers.read(index)
    }

    /// Fitted banks
    pub const fn bank_table(&self) -> &BankTable {
        &self.banks
    }

    /// Card information reported at bring-up
    pub const fn card_info(&self) -> &CardInfo {
        &self.info
    }

    /// Capacity of each pinned DMA buffer
    pub fn buffer_capacity(&self) -> usize {
        self.session
            .to_card
            .as_ref()
            .map_or(0, |channel| channel.buffer.len())
    }

    /// Local clock actually achieved, in Hz
    pub const fn local_clock_hz(&self) -> f64 {
        self.local_clock_hz
    }

    /// Memory clock actually achieved, in Hz, if it was programmed
    pub const fn memory_clock_hz(&self) -> Option<f64> {
        self.memory_clock_hz
    }

    /// DMA mode word used for every transfer
    pub const fn dma_mode(&self) -> u32 {
        self.dma_mode
    }

    /// Backend driving the card
    pub fn backend_type(&self) -> BackendType {
        self.session.driver.backend_type()
    }

    fn check_transfer(&self, bank: usize, offset: u64, length: usize) -> Result<()> {
        let Some(info) = self.banks.get(bank) else {
            return Err(FilterError::BankNotFitted { bank });
        };
        if length > self.buffer_capacity() {
            return Err(self.too_large(length));
        }

        // The page register is masked, so an out-of-bank page would alias
        let size = info.size_bytes();
        match offset.checked_add(length as u64) {
            Some(end) if end <= size => Ok(()),
            _ => Err(FilterError::OutOfBank {
                bank,
                offset,
                length,
                size,
            }),
        }
    }

    fn too_large(&self, length: usize) -> FilterError {
        FilterError::TransferTooLarge {
            length,
            capacity: self.buffer_capacity(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn select_bank(&self, bank: usize) {
        write_flush(&self.registers, regs::BANK, bank as u32 & regs::bank::MASK);
    }

    fn channel(&mut self, direction: Direction) -> Result<&mut DmaChannel> {
        self.session
            .channel(direction)
            .ok_or_else(|| FilterError::dma_transfer(direction, "no DMA buffer"))
    }

    fn dma(&mut self, direction: Direction, buffer_offset: usize, length: usize, local_address: u32) -> Result<()> {
        let mode = self.dma_mode;
        let handle = self.session.handle;
        let descriptor = self
            .channel(direction)?
            .descriptor
            .ok_or_else(|| FilterError::dma_transfer(direction, "no DMA descriptor"))?;

        let request = DmaRequest {
            descriptor,
            buffer_offset,
            length,
            local_address,
            direction,
            mode,
        };
        self.session
            .driver
            .do_dma(handle, &request)
            .map_err(|status| FilterError::dma_transfer(direction, status.to_string()))
    }
}

fn query_banks<D: CardDriver>(session: &mut Session<D>, info: &CardInfo) -> Result<BankTable> {
    let mut banks = BankTable::new();
    let count = MAX_BANK.min(info.ram_banks as usize);
    for bank in (0..count).filter(|&bank| info.is_fitted(bank)) {
        let bank_info = session
            .driver
            .bank_info(session.handle, bank)
            .map_err(|status| FilterError::BankQuery {
                bank,
                reason: status.to_string(),
            })?;
        debug!(
            "Bank {bank}: type {:#x}, {} bits × {} words",
            bank_info.kind, bank_info.width, bank_info.size
        );
        banks.insert(bank, bank_info);
    }
    Ok(banks)
}

fn set_clock<D: CardDriver>(session: &mut Session<D>, clock: Clock, hz: f64) -> Result<f64> {
    let achieved = session
        .driver
        .set_clock_rate(session.handle, clock, hz)
        .map_err(|status| FilterError::ClockConfiguration {
            clock: clock.name(),
            reason: status.to_string(),
        })?;
    check_clock(clock, hz, achieved);
    Ok(achieved)
}

fn reset_memory<R: RegisterSpace>(registers: &R, hold: Duration, settle: Duration) {
    debug!("Resetting memory interface");
    write_flush(registers, regs::MEMCTL, memctl::RESET);
    std::thread::sleep(hold);
    write_flush(registers, regs::MEMCTL, 0);
    std::thread::sleep(settle);
}

fn check_memory<R: RegisterSpace>(registers: &R, banks: u32) -> Result<()> {
    let flags = regs::bank_flags(banks);
    let stat = registers.read(regs::STATUS);
    let memstat = registers.read(regs::MEMSTAT);

    if (stat >> status::SHIFT_LOCKED) & flags != flags {
        return Err(FilterError::MemoryTraining {
            reason: "memory banks not locked",
            status: stat,
            memstat,
        });
    }
    if (memstat >> regs::memstat::SHIFT_TRAINED) & flags != flags {
        return Err(FilterError::MemoryTraining {
            reason: "memory banks not trained",
            status: stat,
            memstat,
        });
    }

    write_flush(registers, regs::STATUS, status::STICKY_CLEAR);
    debug!("Memory banks locked and trained (status {stat:#010x}, memstat {memstat:#010x})");
    Ok(())
}
