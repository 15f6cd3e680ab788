// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated card
//!
//! Implements [`CardDriver`] in plain Rust so the whole stack runs without an
//! ADM-XRC2 board. It models what the communicator depends on:
//!
//! 1. **Register space**: status and memory status lock flags, write-1 to
//!    clear sticky bits, the refresh/enable/finish handshake.
//! 2. **Paged memory**: bank select and page select decode DMA addresses
//!    into per-bank memories, with the window bounds the real bridge has.
//! 3. **Filter logic**: on a rising enable edge the configured filter is
//!    applied from bank 0 to bank 1 over `IMAGE_SIZE` bytes, and finish
//!    rises after a configurable number of polls.
//!
//! Tests drive it through [`SimProbe`]: the register/DMA trace, driver call
//! count, resource accounting and failure injection.

use crate::dma::PinnedBuffer;
use crate::driver::{
    BackendType, BankInfo, CardDriver, CardHandle, CardInfo, Clock, DmaDescriptor, DmaRequest,
    DriverResult, DriverStatus,
};
use crate::mmio::RegisterSpace;
use filter_chip::dma::Direction;
use filter_chip::paging::{PAGE_SHIFT, PAGE_SIZE, WINDOW_BASE};
use filter_chip::regs::{self, memctl, status, MAX_BANK};
use std::alloc::Layout;
use std::collections::HashMap;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Driver call that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Opening the card
    Open,
    /// Card info query
    CardInfo,
    /// Register space mapping
    MapRegisters,
    /// Bank descriptor query of one bank
    BankInfo(usize),
    /// Local clock programming
    LocalClock,
    /// Memory clock programming
    MemoryClock,
    /// Bitstream load
    Configure,
    /// The n-th (0-based) pinned allocation
    Allocate(usize),
    /// The n-th (0-based) DMA descriptor setup
    SetupDma(usize),
    /// Every DMA transfer once `after` have succeeded
    Dma {
        /// Transfers that succeed first
        after: usize,
    },
}

/// Simulated board
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Board type code reported in card info
    pub board_type: u32,
    /// FPGA type code reported in card info
    pub fpga_type: u32,
    /// Serial number reported in card info
    pub serial: u64,
    /// Bank slots
    pub ram_banks: u32,
    /// Fitted bank mask
    pub banks_fitted: u32,
    /// Descriptor reported for every fitted bank
    pub bank_info: BankInfo,
    /// Whether the local clock DCM locks after configuration
    pub lclk_locks: bool,
    /// Memory lock flags raised when reset is released
    pub memory_locked: u32,
    /// Training flags raised when reset is released
    pub memory_trained: u32,
    /// Poll on which finish reads high; `None` never finishes
    pub finish_after_polls: Option<u32>,
    /// Per-byte filter applied by the logic
    pub filter: fn(u8) -> u8,
    /// Size of the register space in words
    pub register_words: usize,
    /// Injected failure
    pub failure: Option<FailurePoint>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            board_type: 0x0a,
            fpga_type: 0x2b,
            serial: 1001,
            ram_banks: 4,
            banks_fitted: 0b1111,
            // 1 Mi × 32 bits = 4 MiB, two pages
            bank_info: BankInfo {
                kind: 1,
                width: 32,
                size: 1 << 20,
            },
            lclk_locks: true,
            memory_locked: 0xff,
            memory_trained: 0xff,
            finish_after_polls: Some(2),
            filter: invert,
            register_words: regs::SPACE_WORDS,
            failure: None,
        }
    }
}

/// Default filter: photographic negative
pub const fn invert(value: u8) -> u8 {
    u8::MAX - value
}

/// One observed access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Register read
    Read {
        /// Word index
        index: usize,
        /// Value returned
        value: u32,
    },
    /// Register write
    Write {
        /// Word index
        index: usize,
        /// Value written
        value: u32,
    },
    /// DMA transfer
    Dma {
        /// Transfer direction
        direction: Direction,
        /// Bank decoded from the bank select register
        bank: usize,
        /// Page decoded from the page select register
        page: u64,
        /// Local bus address
        local_address: u32,
        /// Offset into the pinned buffer
        buffer_offset: usize,
        /// Bytes moved
        length: usize,
    },
}

#[derive(Debug)]
struct Allocation {
    addr: usize,
    layout: Layout,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    registers: Vec<u32>,
    banks: Vec<Vec<u8>>,
    open: bool,
    configured: bool,
    finish_countdown: Option<u32>,
    filter_runs: usize,
    trace: Vec<Access>,
    driver_calls: usize,
    allocations: HashMap<usize, Allocation>,
    allocation_count: usize,
    descriptors: HashMap<u32, (usize, usize)>,
    descriptor_count: usize,
    next_descriptor: u32,
    dma_count: usize,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        Self {
            registers: vec![0; config.register_words],
            banks: vec![Vec::new(); MAX_BANK],
            config,
            open: false,
            configured: false,
            finish_countdown: None,
            filter_runs: 0,
            trace: Vec::new(),
            driver_calls: 0,
            allocations: HashMap::new(),
            allocation_count: 0,
            descriptors: HashMap::new(),
            descriptor_count: 0,
            next_descriptor: 1,
            dma_count: 0,
        }
    }

    fn fails(&self, point: FailurePoint) -> bool {
        self.config.failure == Some(point)
    }

    fn bank_bytes(&self) -> usize {
        usize::try_from(self.config.bank_info.size_bytes()).unwrap_or(usize::MAX)
    }

    fn is_fitted(&self, bank: usize) -> bool {
        bank < MAX_BANK && bank < self.config.ram_banks as usize && self.config.banks_fitted & (1 << bank) != 0
    }

    fn reg(&self, index: usize) -> u32 {
        self.registers.get(index).copied().unwrap_or(0)
    }

    fn set_reg(&mut self, index: usize, value: u32) {
        if let Some(slot) = self.registers.get_mut(index) {
            *slot = value;
        }
    }

    fn read_register(&mut self, index: usize) -> u32 {
        if index == regs::FINISH {
            if let Some(remaining) = self.finish_countdown {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    self.set_reg(regs::FINISH, 1);
                    self.finish_countdown = None;
                } else {
                    self.finish_countdown = Some(remaining);
                }
            }
        }
        let value = self.reg(index);
        self.trace.push(Access::Read { index, value });
        value
    }

    fn write_register(&mut self, index: usize, value: u32) {
        self.trace.push(Access::Write { index, value });
        let previous = self.reg(index);

        match index {
            regs::STATUS => {
                let sticky = status::LCLK_STICKY | status::STICKY_CLEAR;
                self.set_reg(index, previous & !(value & sticky));
            }
            regs::MEMCTL => {
                self.set_reg(index, value);
                let locked = self.config.memory_locked & 0xff;
                if value & memctl::RESET != 0 {
                    let stat = self.reg(regs::STATUS) & !(0xff << status::SHIFT_LOCKED);
                    self.set_reg(regs::STATUS, stat);
                    self.set_reg(regs::MEMSTAT, 0);
                } else if previous & memctl::RESET != 0 && self.configured {
                    let stat = self.reg(regs::STATUS)
                        | (locked << status::SHIFT_LOCKED)
                        | (locked << status::SHIFT_STICKY);
                    self.set_reg(regs::STATUS, stat);
                    self.set_reg(regs::MEMSTAT, self.config.memory_trained & 0xff);
                }
            }
            regs::REFRESH => {
                self.set_reg(index, value);
                if value != 0 {
                    self.set_reg(regs::FINISH, 0);
                    self.finish_countdown = None;
                }
            }
            regs::ENABLE => {
                self.set_reg(index, value);
                if value == 0 {
                    self.set_reg(regs::FINISH, 0);
                    self.finish_countdown = None;
                } else if previous == 0 {
                    self.apply_filter();
                    self.finish_countdown = self.config.finish_after_polls.map(|n| n.max(1));
                }
            }
            _ => self.set_reg(index, value),
        }
    }

    fn apply_filter(&mut self) {
        let size = self.reg(regs::IMAGE_SIZE) as usize;
        let filter = self.config.filter;
        let bytes = self.bank_bytes();
        let size = size.min(bytes);

        let input = &mut self.banks[0];
        if input.len() < size {
            input.resize(size, 0);
        }
        let processed: Vec<u8> = input[..size].iter().map(|&v| filter(v)).collect();

        let output = &mut self.banks[1];
        if output.len() < size {
            output.resize(size, 0);
        }
        output[..size].copy_from_slice(&processed);
        self.filter_runs += 1;
        trace!(size, "simulated filter pass");
    }

    fn bank_slice(&mut self, bank: usize, start: usize, len: usize) -> &mut [u8] {
        let memory = &mut self.banks[bank];
        if memory.len() < start + len {
            memory.resize(start + len, 0);
        }
        &mut memory[start..start + len]
    }
}

fn failure(message: &str) -> DriverStatus {
    DriverStatus::new(-1, message)
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Register space of the simulated card
#[derive(Debug, Clone)]
pub struct SimRegisters {
    state: Arc<Mutex<SimState>>,
}

impl RegisterSpace for SimRegisters {
    fn read(&self, index: usize) -> u32 {
        lock(&self.state).read_register(index)
    }

    fn write(&self, index: usize, value: u32) {
        lock(&self.state).write_register(index, value);
    }

    fn len(&self) -> usize {
        lock(&self.state).registers.len()
    }
}

/// Simulated ADM-XRC2 card
#[derive(Debug)]
pub struct SimulatedCard {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedCard {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedCard {
    /// Card described by `config`
    pub fn new(config: SimConfig) -> Self {
        debug!(
            "Simulated card: {} bank slots, fitted {:#x}",
            config.ram_banks, config.banks_fitted
        );
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    /// Observer sharing this card's state
    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn call(&self) -> MutexGuard<'_, SimState> {
        let mut state = lock(&self.state);
        state.driver_calls += 1;
        state
    }
}

impl CardDriver for SimulatedCard {
    type Registers = SimRegisters;

    fn open_card(&mut self) -> DriverResult<CardHandle> {
        let mut state = self.call();
        if state.fails(FailurePoint::Open) {
            return Err(failure("no card found"));
        }
        if state.open {
            return Err(failure("card in use"));
        }
        state.open = true;
        Ok(CardHandle::new(0))
    }

    fn close_card(&mut self, _handle: CardHandle) {
        let mut state = self.call();
        state.open = false;
        state.configured = false;
    }

    fn card_info(&mut self, _handle: CardHandle) -> DriverResult<CardInfo> {
        let state = self.call();
        if state.fails(FailurePoint::CardInfo) {
            return Err(failure("card info unavailable"));
        }
        Ok(CardInfo {
            board_type: state.config.board_type,
            fpga_type: state.config.fpga_type,
            serial: state.config.serial,
            ram_banks: state.config.ram_banks,
            banks_fitted: state.config.banks_fitted,
        })
    }

    fn map_registers(&mut self, _handle: CardHandle) -> DriverResult<SimRegisters> {
        let state = self.call();
        if state.fails(FailurePoint::MapRegisters) {
            return Err(failure("space 0 has no virtual mapping"));
        }
        Ok(SimRegisters {
            state: Arc::clone(&self.state),
        })
    }

    fn bank_info(&mut self, _handle: CardHandle, bank: usize) -> DriverResult<BankInfo> {
        let state = self.call();
        if state.fails(FailurePoint::BankInfo(bank)) || !state.is_fitted(bank) {
            return Err(failure("invalid bank"));
        }
        Ok(state.config.bank_info)
    }

    fn set_clock_rate(&mut self, _handle: CardHandle, clock: Clock, hz: f64) -> DriverResult<f64> {
        let state = self.call();
        let point = match clock {
            Clock::Local => FailurePoint::LocalClock,
            Clock::Memory => FailurePoint::MemoryClock,
        };
        if state.fails(point) {
            return Err(failure("frequency out of range"));
        }
        Ok(hz)
    }

    fn configure_from_file(&mut self, _handle: CardHandle, path: &Path) -> DriverResult<()> {
        let mut state = self.call();
        if state.fails(FailurePoint::Configure) {
            return Err(failure("configuration failed"));
        }
        let len = std::fs::metadata(path)
            .map_err(|e| failure(&format!("cannot open bitstream: {e}")))?
            .len();
        if len == 0 {
            return Err(failure("empty bitstream"));
        }

        state.configured = true;
        let mut stat = status::LCLK_STICKY;
        if state.config.lclk_locks {
            stat |= status::LCLK_LOCKED;
        }
        state.set_reg(regs::STATUS, stat);
        Ok(())
    }

    fn alloc_pinned(&mut self, size: usize) -> DriverResult<PinnedBuffer> {
        let mut state = self.call();
        let nth = state.allocation_count;
        state.allocation_count += 1;
        if state.fails(FailurePoint::Allocate(nth)) || size == 0 {
            return Err(failure("cannot lock memory"));
        }

        let layout = Layout::from_size_align(size, rustix::param::page_size())
            .map_err(|e| failure(&e.to_string()))?;
        // SAFETY: layout has non-zero size (checked above).
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| failure("out of memory"))?;

        let addr = ptr.as_ptr() as usize;
        state.allocations.insert(addr, Allocation { addr, layout });
        // SAFETY: fresh zeroed allocation of `size` bytes, owned by the buffer until free_pinned.
        Ok(unsafe { PinnedBuffer::from_raw(ptr, size) })
    }

    fn free_pinned(&mut self, buffer: PinnedBuffer) {
        let mut state = self.call();
        let (ptr, _) = buffer.into_raw();
        if let Some(allocation) = state.allocations.remove(&(ptr.as_ptr() as usize)) {
            // SAFETY: allocated in alloc_pinned with this layout and not freed before
            // (removed from the map exactly once).
            unsafe { std::alloc::dealloc(allocation.addr as *mut u8, allocation.layout) };
        }
    }

    fn setup_dma(&mut self, _handle: CardHandle, buffer: &PinnedBuffer) -> DriverResult<DmaDescriptor> {
        let mut state = self.call();
        let nth = state.descriptor_count;
        state.descriptor_count += 1;
        if state.fails(FailurePoint::SetupDma(nth)) {
            return Err(failure("cannot set up DMA"));
        }

        let id = state.next_descriptor;
        state.next_descriptor += 1;
        state.descriptors.insert(id, (buffer.as_ptr() as usize, buffer.len()));
        Ok(DmaDescriptor::new(id))
    }

    fn unsetup_dma(&mut self, _handle: CardHandle, descriptor: DmaDescriptor) {
        self.call().descriptors.remove(&descriptor.raw());
    }

    fn do_dma(&mut self, _handle: CardHandle, request: &DmaRequest) -> DriverResult<()> {
        let mut state = self.call();
        if let Some(FailurePoint::Dma { after }) = state.config.failure {
            if state.dma_count >= after {
                return Err(failure("DMA aborted"));
            }
        }

        let &(addr, capacity) = state
            .descriptors
            .get(&request.descriptor.raw())
            .ok_or_else(|| failure("invalid DMA descriptor"))?;
        if request.buffer_offset + request.length > capacity {
            return Err(failure("transfer outside pinned buffer"));
        }

        let bank = (state.reg(regs::BANK) & regs::bank::MASK) as usize;
        if !state.is_fitted(bank) {
            return Err(failure("bank not fitted"));
        }
        let page = u64::from(state.reg(regs::PAGE) & regs::page::MASK);
        let page_offset = u64::from(
            request
                .local_address
                .checked_sub(WINDOW_BASE)
                .ok_or_else(|| failure("address below memory window"))?,
        );
        if page_offset + request.length as u64 > PAGE_SIZE {
            return Err(failure("transfer crosses the memory window"));
        }
        let start = usize::try_from((page << PAGE_SHIFT) + page_offset).map_err(|_| failure("address overflow"))?;
        if start + request.length > state.bank_bytes() {
            return Err(failure("transfer beyond end of bank"));
        }

        // SAFETY: the descriptor is live, so the pinned buffer it was set up for is still
        // allocated (descriptors are released before their buffers); the range was bounds
        // checked above and the communicator holds no borrow of the buffer during DoDMA.
        let host = unsafe {
            std::slice::from_raw_parts_mut((addr as *mut u8).add(request.buffer_offset), request.length)
        };
        match request.direction {
            Direction::ToCard => state.bank_slice(bank, start, request.length).copy_from_slice(host),
            Direction::ToHost => host.copy_from_slice(state.bank_slice(bank, start, request.length)),
        }

        state.dma_count += 1;
        state.trace.push(Access::Dma {
            direction: request.direction,
            bank,
            page,
            local_address: request.local_address,
            buffer_offset: request.buffer_offset,
            length: request.length,
        });
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Simulated
    }
}

impl Drop for SimulatedCard {
    fn drop(&mut self) {
        // Anything still allocated was leaked by the caller; give it back.
        let mut state = lock(&self.state);
        for (_, allocation) in state.allocations.drain() {
            // SAFETY: each entry is an allocation from alloc_pinned that was never freed.
            unsafe { std::alloc::dealloc(allocation.addr as *mut u8, allocation.layout) };
        }
    }
}

/// Test observer of a [`SimulatedCard`]
#[derive(Debug, Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    /// Every register access and DMA so far
    pub fn trace(&self) -> Vec<Access> {
        lock(&self.state).trace.clone()
    }

    /// Forget the trace
    pub fn clear_trace(&self) {
        lock(&self.state).trace.clear();
    }

    /// Number of driver calls, release calls included
    pub fn driver_calls(&self) -> usize {
        lock(&self.state).driver_calls
    }

    /// Whether the card is open
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Pinned buffers not yet freed
    pub fn live_buffers(&self) -> usize {
        lock(&self.state).allocations.len()
    }

    /// DMA descriptors not yet released
    pub fn live_descriptors(&self) -> usize {
        lock(&self.state).descriptors.len()
    }

    /// Successful DMA transfers
    pub fn dma_count(&self) -> usize {
        lock(&self.state).dma_count
    }

    /// Filter passes run by the logic
    pub fn filter_runs(&self) -> usize {
        lock(&self.state).filter_runs
    }

    /// Current register value, without tracing the read
    pub fn register(&self, index: usize) -> u32 {
        lock(&self.state).reg(index)
    }

    /// Copy of `len` bytes of bank memory at `offset`
    pub fn bank(&self, bank: usize, offset: usize, len: usize) -> Vec<u8> {
        lock(&self.state).bank_slice(bank, offset, len).to_vec()
    }

    /// Change the poll on which finish rises
    pub fn set_finish_after_polls(&self, polls: Option<u32>) {
        lock(&self.state).config.finish_after_polls = polls;
    }

    /// Change the per-byte filter
    pub fn set_filter(&self, filter: fn(u8) -> u8) {
        lock(&self.state).config.filter = filter;
    }

    /// Change the injected failure
    pub fn set_failure(&self, failure: Option<FailurePoint>) {
        lock(&self.state).config.failure = failure;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_bits_clear_on_write_one() {
        let mut state = SimState::new(SimConfig::default());
        state.set_reg(regs::STATUS, status::LCLK_LOCKED | status::LCLK_STICKY);
        state.write_register(regs::STATUS, status::LCLK_STICKY);
        assert_eq!(state.reg(regs::STATUS), status::LCLK_LOCKED);
    }

    #[test]
    fn memory_flags_follow_reset_release() {
        let mut state = SimState::new(SimConfig::default());
        state.configured = true;
        state.write_register(regs::MEMCTL, memctl::RESET);
        assert_eq!(state.reg(regs::MEMSTAT), 0);
        state.write_register(regs::MEMCTL, 0);
        assert_eq!(state.reg(regs::MEMSTAT), 0xff);
        assert_eq!((state.reg(regs::STATUS) >> status::SHIFT_LOCKED) & 0xff, 0xff);
    }

    #[test]
    fn finish_rises_on_configured_poll() {
        let mut state = SimState::new(SimConfig {
            finish_after_polls: Some(3),
            ..SimConfig::default()
        });
        state.write_register(regs::ENABLE, 1);
        assert_eq!(state.read_register(regs::FINISH), 0);
        assert_eq!(state.read_register(regs::FINISH), 0);
        assert_eq!(state.read_register(regs::FINISH), 1);
        state.write_register(regs::ENABLE, 0);
        assert_eq!(state.read_register(regs::FINISH), 0);
    }

    #[test]
    fn enable_edge_applies_filter() {
        let mut state = SimState::new(SimConfig::default());
        state.bank_slice(0, 0, 4).copy_from_slice(&[0, 1, 254, 255]);
        state.write_register(regs::IMAGE_SIZE, 4);
        state.write_register(regs::ENABLE, 1);
        // Level held high: no second pass
        state.write_register(regs::ENABLE, 1);
        assert_eq!(state.bank_slice(1, 0, 4), &[255, 254, 1, 0]);
        assert_eq!(state.filter_runs, 1);
    }

    #[test]
    fn second_open_reports_card_in_use() {
        let mut card = SimulatedCard::default();
        assert!(card.open_card().is_ok());
        assert_eq!(card.open_card().unwrap_err().message, "card in use");
    }
}
