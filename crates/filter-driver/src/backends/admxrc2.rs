// SPDX-License-Identifier: AGPL-3.0-only

//! ADM-XRC2 vendor driver backend
//!
//! The vendor ships the driver API as a C shared library. It is loaded at
//! runtime so the crate builds and tests without the SDK installed; only
//! [`Admxrc2Card::load`] fails on machines without it.
//!
//! Library lookup: `$ADMXRC2_LIBRARY`, falling back to `libadmxrc2.so` on the
//! loader path.

use crate::dma::PinnedBuffer;
use crate::driver::{
    BackendType, BankInfo, CardDriver, CardHandle, CardInfo, Clock, DmaDescriptor, DmaRequest,
    DriverResult, DriverStatus,
};
use crate::error::{FilterError, Result};
use crate::mmio::MappedRegisters;
use filter_chip::dma::{Direction, IoWidth};
use libc::{c_char, c_double, c_int, c_uint, c_ulong, c_void};
use libloading::Library;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use tracing::{debug, info};

/// Environment variable overriding the library path
pub const LIBRARY_ENV: &str = "ADMXRC2_LIBRARY";

/// Default library name
pub const DEFAULT_LIBRARY: &str = "libadmxrc2.so";

// UNVERIFIED: the constants and `Raw*` layouts below were reconstructed
// from how the ADMXRC2 API is called, not copied from an SDK `admxrc2.h`.
// Check them against the installed SDK header before trusting a new board;
// `raw_layouts_are_pinned` fails if they change by accident.

const SUCCESS: c_int = 0;
/// Open whichever card is free
const CARD_ANY: c_uint = 0;
/// Host to local bus
const PCITOLOCAL: c_uint = 0;
/// Local bus to host
const LOCALTOPCI: c_uint = 1;
const DMACHAN_ANY: c_uint = 0xffff_ffff;
/// Vendor I/O width enumeration: 8, 16, 32, 64
const IOWIDTH_8: c_uint = 0;
const IOWIDTH_16: c_uint = 1;
const IOWIDTH_32: c_uint = 2;

const fn io_width(width: IoWidth) -> c_uint {
    match width {
        IoWidth::Bits8 => IOWIDTH_8,
        IoWidth::Bits16 => IOWIDTH_16,
        IoWidth::Bits32 => IOWIDTH_32,
    }
}

type Status = c_int;
type Handle = c_int;
type DmaDesc = u32;

// Fields not read here are still written by the driver.
#[allow(dead_code)]
#[repr(C)]
#[derive(Default)]
struct RawCardInfo {
    card_id: u32,
    serial_number: u32,
    board_type: u32,
    fpga_type: u32,
    num_space: u32,
    num_ram_bank: u32,
    ram_banks_fitted: u32,
    reserved: [u32; 32],
}

#[allow(dead_code)]
#[repr(C)]
struct RawSpaceInfo {
    virtual_base: *mut c_void,
    physical_base: u64,
    local_base: u32,
    virtual_size: u32,
    reserved: [u32; 16],
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Default)]
struct RawBankInfo {
    kind: u32,
    width: u32,
    size: u32,
    fitted: u8,
    reserved: [u32; 8],
}

/// Resolved entry points. Fn pointers stay valid while `_library` is loaded.
struct Api {
    open_card: unsafe extern "C" fn(c_uint, *mut Handle) -> Status,
    close_card: unsafe extern "C" fn(Handle) -> Status,
    get_card_info: unsafe extern "C" fn(Handle, *mut RawCardInfo) -> Status,
    get_space_info: unsafe extern "C" fn(Handle, c_ulong, *mut RawSpaceInfo) -> Status,
    get_bank_info: unsafe extern "C" fn(Handle, c_uint, *mut RawBankInfo) -> Status,
    set_clock_rate: unsafe extern "C" fn(Handle, c_uint, c_double, *mut c_double) -> Status,
    configure_from_file: unsafe extern "C" fn(Handle, *const c_char) -> Status,
    malloc: unsafe extern "C" fn(usize) -> *mut c_void,
    free: unsafe extern "C" fn(*mut c_void),
    setup_dma: unsafe extern "C" fn(Handle, *mut c_void, c_ulong, c_uint, *mut DmaDesc) -> Status,
    unsetup_dma: unsafe extern "C" fn(Handle, DmaDesc) -> Status,
    #[allow(clippy::type_complexity)]
    do_dma: unsafe extern "C" fn(
        Handle,
        DmaDesc,
        c_ulong,
        c_ulong,
        u32,
        c_uint,
        c_uint,
        u32,
        u32,
        *mut u32,
        *mut c_void,
    ) -> Status,
    build_dma_mode_word: unsafe extern "C" fn(c_uint, c_uint, c_uint, u32) -> u32,
    get_status_string: unsafe extern "C" fn(Status) -> *const c_char,
    _library: Library,
}

/// Resolve one entry point as a fn pointer of type `T`
fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    let cname = format!("{name}\0");
    // SAFETY: every caller's `T` matches the vendor header for `name`.
    let resolved = unsafe { library.get::<T>(cname.as_bytes()) }
        .map_err(|e| FilterError::driver_unavailable(format!("{name}: {e}")))?;
    Ok(*resolved)
}

impl Api {
    fn load(path: &Path) -> Result<Self> {
        // SAFETY: loading runs the library's initialisers; the vendor library has no
        // initialisers with preconditions on the caller.
        let library = unsafe { Library::new(path) }
            .map_err(|e| FilterError::driver_unavailable(format!("{}: {e}", path.display())))?;

        Ok(Self {
            open_card: symbol(&library, "ADMXRC2_OpenCard")?,
            close_card: symbol(&library, "ADMXRC2_CloseCard")?,
            get_card_info: symbol(&library, "ADMXRC2_GetCardInfo")?,
            get_space_info: symbol(&library, "ADMXRC2_GetSpaceInfo")?,
            get_bank_info: symbol(&library, "ADMXRC2_GetBankInfo")?,
            set_clock_rate: symbol(&library, "ADMXRC2_SetClockRate")?,
            configure_from_file: symbol(&library, "ADMXRC2_ConfigureFromFile")?,
            malloc: symbol(&library, "ADMXRC2_Malloc")?,
            free: symbol(&library, "ADMXRC2_Free")?,
            setup_dma: symbol(&library, "ADMXRC2_SetupDMA")?,
            unsetup_dma: symbol(&library, "ADMXRC2_UnsetupDMA")?,
            do_dma: symbol(&library, "ADMXRC2_DoDMA")?,
            build_dma_mode_word: symbol(&library, "ADMXRC2_BuildDMAModeWord")?,
            get_status_string: symbol(&library, "ADMXRC2_GetStatusString")?,
            _library: library,
        })
    }

    fn check(&self, status: Status) -> DriverResult<()> {
        if status == SUCCESS {
            return Ok(());
        }
        // SAFETY: GetStatusString returns a static NUL-terminated string or NULL.
        let text = unsafe { (self.get_status_string)(status) };
        let message = if text.is_null() {
            format!("unknown status {status}")
        } else {
            // SAFETY: non-null, static, NUL-terminated (see above).
            unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
        };
        Err(DriverStatus::new(status, message))
    }
}

/// Card driven through the vendor library
pub struct Admxrc2Card {
    api: Api,
}

impl std::fmt::Debug for Admxrc2Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admxrc2Card").finish_non_exhaustive()
    }
}

impl Admxrc2Card {
    /// Load the vendor library from `$ADMXRC2_LIBRARY` or the default name
    ///
    /// # Errors
    ///
    /// Returns `DriverUnavailable` if the library or one of its entry points
    /// cannot be found.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(LIBRARY_ENV).unwrap_or_else(|| DEFAULT_LIBRARY.into());
        Self::load_from(Path::new(&path))
    }

    /// Load the vendor library from `path`
    ///
    /// # Errors
    ///
    /// Returns `DriverUnavailable` if the library or one of its entry points
    /// cannot be found.
    pub fn load_from(path: &Path) -> Result<Self> {
        info!("Loading ADM-XRC2 driver from {}", path.display());
        Ok(Self {
            api: Api::load(path)?,
        })
    }
}

impl CardDriver for Admxrc2Card {
    type Registers = MappedRegisters;

    fn open_card(&mut self) -> DriverResult<CardHandle> {
        let mut handle: Handle = CardHandle::INVALID.raw();
        // SAFETY: handle is a valid out-pointer for the duration of the call.
        self.api.check(unsafe { (self.api.open_card)(CARD_ANY, &mut handle) })?;
        Ok(CardHandle::new(handle))
    }

    fn close_card(&mut self, handle: CardHandle) {
        // SAFETY: handle came from open_card and is closed once (Session::drop).
        let status = unsafe { (self.api.close_card)(handle.raw()) };
        if let Err(e) = self.api.check(status) {
            debug!("CloseCard: {e}");
        }
    }

    fn card_info(&mut self, handle: CardHandle) -> DriverResult<CardInfo> {
        let mut raw = RawCardInfo::default();
        // SAFETY: raw is a valid out-pointer sized for the vendor struct.
        self.api.check(unsafe { (self.api.get_card_info)(handle.raw(), &mut raw) })?;
        Ok(CardInfo {
            board_type: raw.board_type,
            fpga_type: raw.fpga_type,
            serial: u64::from(raw.serial_number),
            ram_banks: raw.num_ram_bank,
            banks_fitted: raw.ram_banks_fitted,
        })
    }

    fn map_registers(&mut self, handle: CardHandle) -> DriverResult<MappedRegisters> {
        let mut raw = RawSpaceInfo {
            virtual_base: ptr::null_mut(),
            physical_base: 0,
            local_base: 0,
            virtual_size: 0,
            reserved: [0; 16],
        };
        // SAFETY: raw is a valid out-pointer; space 0 is the register space.
        self.api.check(unsafe { (self.api.get_space_info)(handle.raw(), 0, &mut raw) })?;

        let base = NonNull::new(raw.virtual_base.cast::<u8>())
            .ok_or_else(|| DriverStatus::new(-1, "space 0 has no virtual mapping"))?;
        // SAFETY: the driver maps VirtualSize bytes of space 0 at VirtualBase, word aligned,
        // for as long as the card stays open; the Communicator drops the mapping first.
        Ok(unsafe { MappedRegisters::from_raw(base, raw.virtual_size as usize) })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn bank_info(&mut self, handle: CardHandle, bank: usize) -> DriverResult<BankInfo> {
        let mut raw = RawBankInfo::default();
        // SAFETY: raw is a valid out-pointer.
        self.api.check(unsafe { (self.api.get_bank_info)(handle.raw(), bank as c_uint, &mut raw) })?;
        Ok(BankInfo {
            kind: raw.kind,
            width: raw.width,
            size: raw.size,
        })
    }

    fn set_clock_rate(&mut self, handle: CardHandle, clock: Clock, hz: f64) -> DriverResult<f64> {
        let mut actual: c_double = 0.0;
        // SAFETY: actual is a valid out-pointer.
        self.api.check(unsafe {
            (self.api.set_clock_rate)(handle.raw(), clock.index(), hz, &mut actual)
        })?;
        Ok(actual)
    }

    fn configure_from_file(&mut self, handle: CardHandle, path: &Path) -> DriverResult<()> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| DriverStatus::new(-1, "bitstream path contains NUL"))?;
        // SAFETY: path is NUL-terminated and outlives the call.
        self.api.check(unsafe { (self.api.configure_from_file)(handle.raw(), path.as_ptr()) })
    }

    fn alloc_pinned(&mut self, size: usize) -> DriverResult<PinnedBuffer> {
        // SAFETY: plain allocation call.
        let raw = unsafe { (self.api.malloc)(size) };
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| DriverStatus::new(-1, format!("ADMXRC2_Malloc({size}) returned NULL")))?;
        // SAFETY: the driver returned `size` bytes of locked memory, released in free_pinned.
        Ok(unsafe { PinnedBuffer::from_raw(ptr, size) })
    }

    fn free_pinned(&mut self, buffer: PinnedBuffer) {
        let (ptr, _) = buffer.into_raw();
        // SAFETY: ptr came from ADMXRC2_Malloc and ownership ends here.
        unsafe { (self.api.free)(ptr.as_ptr().cast()) };
    }

    fn setup_dma(&mut self, handle: CardHandle, buffer: &PinnedBuffer) -> DriverResult<DmaDescriptor> {
        let mut descriptor: DmaDesc = 0;
        let len = c_ulong::try_from(buffer.len()).map_err(|_| DriverStatus::new(-1, "buffer too large"))?;
        // SAFETY: buffer stays allocated until after unsetup_dma (Session drop order).
        self.api.check(unsafe {
            (self.api.setup_dma)(handle.raw(), buffer.as_ptr().cast(), len, 0, &mut descriptor)
        })?;
        Ok(DmaDescriptor::new(descriptor))
    }

    fn unsetup_dma(&mut self, handle: CardHandle, descriptor: DmaDescriptor) {
        // SAFETY: descriptor came from setup_dma on this handle and is released once.
        let status = unsafe { (self.api.unsetup_dma)(handle.raw(), descriptor.raw()) };
        if let Err(e) = self.api.check(status) {
            debug!("UnsetupDMA: {e}");
        }
    }

    fn dma_mode_word(&self, info: &CardInfo, flags: u32) -> u32 {
        // SAFETY: pure function of its arguments.
        unsafe { (self.api.build_dma_mode_word)(info.board_type, io_width(IoWidth::Bits32), 0, flags) }
    }

    fn do_dma(&mut self, handle: CardHandle, request: &DmaRequest) -> DriverResult<()> {
        let direction = match request.direction {
            Direction::ToCard => PCITOLOCAL,
            Direction::ToHost => LOCALTOPCI,
        };
        let offset = c_ulong::try_from(request.buffer_offset).map_err(|_| DriverStatus::new(-1, "offset too large"))?;
        let length = c_ulong::try_from(request.length).map_err(|_| DriverStatus::new(-1, "length too large"))?;
        // SAFETY: the descriptor covers the pinned buffer and the communicator keeps
        // offset + length within it; blocking call, no event, default timeout.
        self.api.check(unsafe {
            (self.api.do_dma)(
                handle.raw(),
                request.descriptor.raw(),
                offset,
                length,
                request.local_address,
                direction,
                DMACHAN_ANY,
                request.mode,
                0,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        })
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Admxrc2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_driver_unavailable() {
        let err = Admxrc2Card::load_from(Path::new("/nonexistent/libadmxrc2.so")).unwrap_err();
        assert!(matches!(err, FilterError::DriverUnavailable { .. }));
        assert!(err.is_bring_up());
    }

    #[test]
    fn raw_layouts_are_pinned() {
        use std::mem::size_of;
        assert_eq!(size_of::<RawCardInfo>(), 39 * 4);
        // `fitted` is padded out to the reserved words
        assert_eq!(size_of::<RawBankInfo>(), 48);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(size_of::<RawSpaceInfo>(), 88);
        assert_eq!(DMACHAN_ANY, u32::MAX);
        assert_eq!((PCITOLOCAL, LOCALTOPCI), (0, 1));
    }

    #[test]
    #[ignore] // Requires hardware
    fn test_card_info() {
        let mut card = Admxrc2Card::load().expect("ADM-XRC2 library");
        let handle = card.open_card().expect("open card");
        let info = card.card_info(handle).expect("card info");
        println!("Board {:#x}, FPGA {:#x}, serial {}", info.board_type, info.fpga_type, info.serial);
        println!("  Banks: {} (fitted {:#x})", info.ram_banks, info.banks_fitted);
        card.close_card(handle);
    }
}
