// SPDX-License-Identifier: AGPL-3.0-only

//! Shared setup for the simulated-card integration tests

#![allow(dead_code)]

use filter_driver::backends::Access;
use filter_driver::{BringUpConfig, BringUpTiming, Communicator, SimConfig, SimProbe, SimulatedCard};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Non-empty stand-in bitstream
pub fn bitstream() -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp bitstream");
    file.write_all(b"\xff\xff\xaa\x99 filter bitstream").expect("write bitstream");
    file
}

/// 40 MHz local, 66.67 MHz memory, no bring-up delays
pub fn config(bitstream: &Path, buffer_size: usize) -> BringUpConfig {
    BringUpConfig::new(40.0, bitstream, buffer_size)
        .with_memory_clock(66.67)
        .with_timing(BringUpTiming::immediate())
}

/// Bring up a simulated card described by `sim`
pub fn open(sim: SimConfig, buffer_size: usize) -> (Communicator<SimulatedCard>, SimProbe, NamedTempFile) {
    let file = bitstream();
    let card = SimulatedCard::new(sim);
    let probe = card.probe();
    let com = Communicator::open(card, &config(file.path(), buffer_size)).expect("bring-up");
    (com, probe, file)
}

/// Deterministic non-repeating-per-page test pattern
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(7) % 251) as u8).collect()
}

/// Position of the first access matching `pred`
pub fn position(trace: &[Access], pred: impl Fn(&Access) -> bool) -> usize {
    trace.iter().position(pred).expect("access not in trace")
}

/// Position of the last access matching `pred`
pub fn last_position(trace: &[Access], pred: impl Fn(&Access) -> bool) -> usize {
    trace.iter().rposition(pred).expect("access not in trace")
}

pub fn is_write(index: usize, value: u32) -> impl Fn(&Access) -> bool {
    move |a| *a == Access::Write { index, value }
}

pub fn is_read(index: usize) -> impl Fn(&Access) -> bool {
    move |a| matches!(a, Access::Read { index: i, .. } if *i == index)
}

pub fn count(trace: &[Access], pred: impl Fn(&Access) -> bool) -> usize {
    trace.iter().filter(|a| pred(a)).count()
}
