// SPDX-License-Identifier: AGPL-3.0-only

//! Pointer relay
//!
//! An input thread records clicks; the control thread flushes them into the
//! click registers once per frame. The relay is the only state shared across
//! threads, so every field is atomic.

use crate::communicator::Communicator;
use crate::driver::CardDriver;
use filter_chip::regs;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::trace;

/// Latest pointer click, shared between threads
#[derive(Debug, Default)]
pub struct PointerRelay {
    clicked: AtomicBool,
    x: AtomicU32,
    y: AtomicU32,
}

impl PointerRelay {
    /// Relay with no pending click
    pub const fn new() -> Self {
        Self {
            clicked: AtomicBool::new(false),
            x: AtomicU32::new(0),
            y: AtomicU32::new(0),
        }
    }

    /// Record a click at `(x, y)`
    pub fn record_click(&self, x: u32, y: u32) {
        self.x.store(x, Ordering::Relaxed);
        self.y.store(y, Ordering::Relaxed);
        // Release pairs with the Acquire swap in `flush`
        self.clicked.store(true, Ordering::Release);
    }

    /// Whether a click is waiting to be flushed
    pub fn is_pending(&self) -> bool {
        self.clicked.load(Ordering::Acquire)
    }

    /// Scope whose end writes the click registers
    ///
    /// The returned guard derefs to the communicator so the frame can be
    /// processed through it.
    pub fn scope<'a, D: CardDriver>(&'a self, com: &'a mut Communicator<D>) -> PointerScope<'a, D> {
        PointerScope { relay: self, com }
    }

    fn flush<D: CardDriver>(&self, com: &Communicator<D>) {
        let clicked = self.clicked.swap(false, Ordering::Acquire);
        let x = self.x.load(Ordering::Relaxed);
        let y = self.y.load(Ordering::Relaxed);
        trace!(clicked, x, y, "pointer flush");
        com.write_register(regs::CLICK, u32::from(clicked));
        com.write_register(regs::CLICK_X, x);
        com.write_register(regs::CLICK_Y, y);
    }
}

/// Guard from [`PointerRelay::scope`]
#[derive(Debug)]
pub struct PointerScope<'a, D: CardDriver> {
    relay: &'a PointerRelay,
    com: &'a mut Communicator<D>,
}

impl<D: CardDriver> Deref for PointerScope<'_, D> {
    type Target = Communicator<D>;

    fn deref(&self) -> &Self::Target {
        self.com
    }
}

impl<D: CardDriver> DerefMut for PointerScope<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.com
    }
}

impl<D: CardDriver> Drop for PointerScope<'_, D> {
    fn drop(&mut self) {
        self.relay.flush(self.com);
    }
}
