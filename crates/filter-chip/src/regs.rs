// SPDX-License-Identifier: AGPL-3.0-only

//! Register map of the filter design.
//!
//! All registers are 32 bits wide and addressed by **word index** into the
//! card's first local-bus space, not by byte offset.
//!
//! ```text
//! 0x00        bank select          (4 bits)
//! 0x01        page select          (11 bits)
//! 0x02        memory control
//! 0x04        status               (clock / memory lock, sticky flags)
//! 0x06        memory status        (training flags)
//! 0x10..0x20  per-bank memory port mode
//! 0x40..0x47  user block, host → logic
//! 0x60..0x64  user block, logic → host
//! ```

/// Number of memory bank slots the register interface can address.
pub const MAX_BANK: usize = 16;

// ── Memory interface ─────────────────────────────────────────────────────────

/// Bank select. Only the low four bits are decoded.
pub const BANK: usize = 0x00;
/// Page select for the 2 MiB memory window.
pub const PAGE: usize = 0x01;
/// Memory control (reset).
pub const MEMCTL: usize = 0x02;
/// Status: local clock DCM and memory lock flags.
pub const STATUS: usize = 0x04;
/// Memory status: training flags.
pub const MEMSTAT: usize = 0x06;
/// First per-bank mode register; bank `n` lives at `MODE_BASE + n`.
pub const MODE_BASE: usize = 0x10;

/// Mode register index for bank `n`.
#[must_use]
pub const fn mode(n: usize) -> usize {
    MODE_BASE + n
}

// ── User block ───────────────────────────────────────────────────────────────

/// Refresh pulse. The logic resets its pipeline on a 1 → 0 edge.
pub const REFRESH: usize = 0x40;
/// Enable level. Held high while a frame is being processed.
pub const ENABLE: usize = 0x41;
/// Total image size in bytes for one plane.
pub const IMAGE_SIZE: usize = 0x42;
/// Image row width in pixels.
pub const IMAGE_WIDTH: usize = 0x43;
/// Pointer click flag.
pub const CLICK: usize = 0x44;
/// Pointer x coordinate.
pub const CLICK_X: usize = 0x45;
/// Pointer y coordinate.
pub const CLICK_Y: usize = 0x46;
/// Finish level, set by the logic when the output bank is complete.
pub const FINISH: usize = 0x60;
/// First debug register.
pub const DEBUG_BASE: usize = 0x61;
/// Number of debug registers following `FINISH`.
pub const DEBUG_COUNT: usize = 3;

/// Smallest register space that covers every index above.
pub const SPACE_WORDS: usize = 0x80;

// ── Bit definitions ──────────────────────────────────────────────────────────

/// Bank select register.
pub mod bank {
    /// Decoded bits of the bank select register.
    pub const MASK: u32 = 0xf;
}

/// Page select register.
pub mod page {
    /// Decoded bits of the page select register.
    pub const MASK: u32 = 0x7ff;
}

/// Memory control register.
pub mod memctl {
    /// Hold the memory subsystem in reset while set.
    pub const RESET: u32 = 1 << 0;
}

/// Status register.
pub mod status {
    /// Local clock DCM is locked.
    pub const LCLK_LOCKED: u32 = 1 << 0;
    /// Local clock DCM lost lock at some point (write 1 to clear).
    pub const LCLK_STICKY: u32 = 1 << 1;
    /// Shift of the per-bank memory lock flags.
    pub const SHIFT_LOCKED: u32 = 8;
    /// Shift of the per-bank sticky loss-of-lock flags.
    pub const SHIFT_STICKY: u32 = 16;
    /// Write value clearing every sticky memory flag.
    pub const STICKY_CLEAR: u32 = 0xff << SHIFT_STICKY;
}

/// Memory status register.
pub mod memstat {
    /// Shift of the per-bank trained flags.
    pub const SHIFT_TRAINED: u32 = 0;
}

/// Per-bank mode registers.
pub mod mode {
    /// ZBT SSRAM port in pipelined mode.
    pub const ZBT_PIPELINE: u32 = 1 << 0;
}

/// Mask covering the low `banks` per-bank flags (at most eight).
#[must_use]
pub const fn bank_flags(banks: u32) -> u32 {
    if banks >= 8 {
        0xff
    } else {
        (1 << banks) - 1
    }
}
