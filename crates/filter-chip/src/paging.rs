// SPDX-License-Identifier: AGPL-3.0-only

//! Paged memory window.
//!
//! The card exposes each memory bank through a fixed 2 MiB window at local
//! address [`WINDOW_BASE`]. The page select register chooses which 2 MiB
//! page of the bank is visible, so a transfer spanning several pages must be
//! split at every page boundary.
//!
//! ```text
//! bank offset  ─┬─ page   = offset >> PAGE_SHIFT   → page select register
//!               └─ in-page = offset & (PAGE_SIZE-1) → WINDOW_BASE + in-page
//! ```
//!
//! [`pages`] yields the chunk sequence for a transfer without touching any
//! hardware, so the arithmetic can be tested on its own.

use crate::regs;

/// log2 of the window size.
pub const PAGE_SHIFT: u32 = 21;
/// Window size in bytes (2 MiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Local bus address of the memory window.
pub const WINDOW_BASE: u32 = 0x20_0000;

/// One window-sized piece of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Page index within the bank (unmasked).
    pub page: u64,
    /// Offset of the chunk inside the page.
    pub page_offset: u64,
    /// Chunk length in bytes.
    pub len: u64,
    /// Bytes of the transfer moved before this chunk.
    pub moved: u64,
}

impl Chunk {
    /// Value written to the page select register.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn page_register(&self) -> u32 {
        (self.page as u32) & regs::page::MASK
    }

    /// Local bus address of the first byte of the chunk.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn window_address(&self) -> u32 {
        // page_offset < PAGE_SIZE, so this stays inside the window
        WINDOW_BASE + self.page_offset as u32
    }

    /// End of the chunk inside its page.
    #[must_use]
    pub const fn page_end(&self) -> u64 {
        self.page_offset + self.len
    }
}

/// Iterator over the chunks of a transfer. Created by [`pages`].
#[derive(Debug, Clone)]
pub struct Pages {
    offset: u64,
    remaining: u64,
    moved: u64,
}

/// Split `length` bytes starting at bank `offset` into window chunks.
///
/// A zero length yields nothing. A range running past `u64::MAX` is cut
/// there; callers bound transfers by the bank size before splitting.
#[must_use]
pub const fn pages(offset: u64, length: u64) -> Pages {
    Pages {
        offset,
        remaining: clamp_length(offset, length),
        moved: 0,
    }
}

const fn clamp_length(offset: u64, length: u64) -> u64 {
    let room = (u64::MAX - offset).saturating_add(1);
    if length < room {
        length
    } else {
        room
    }
}

impl Iterator for Pages {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.remaining == 0 {
            return None;
        }

        let page = self.offset >> PAGE_SHIFT;
        let page_offset = self.offset & (PAGE_SIZE - 1);
        let len = self.remaining.min(PAGE_SIZE - page_offset);

        let chunk = Chunk {
            page,
            page_offset,
            len,
            moved: self.moved,
        };

        // Wraps only past the final chunk of a range ending at u64::MAX
        self.offset = self.offset.wrapping_add(len);
        self.remaining -= len;
        self.moved += len;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(chunk_count(self.offset, self.remaining)).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Pages {}

impl std::iter::FusedIterator for Pages {}

/// Number of chunks a transfer of `length` bytes at `offset` is split into.
#[must_use]
pub const fn chunk_count(offset: u64, length: u64) -> u64 {
    if length == 0 {
        return 0;
    }
    let first = offset >> PAGE_SHIFT;
    let last = offset.saturating_add(length - 1) >> PAGE_SHIFT;
    last - first + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_length_is_empty() {
        assert_eq!(pages(0, 0).count(), 0);
        assert_eq!(pages(PAGE_SIZE + 17, 0).count(), 0);
    }

    #[test]
    fn aligned_single_page() {
        let chunks: Vec<_> = pages(0, PAGE_SIZE).collect();
        assert_eq!(
            chunks,
            vec![Chunk {
                page: 0,
                page_offset: 0,
                len: PAGE_SIZE,
                moved: 0
            }]
        );
        assert_eq!(chunks[0].window_address(), WINDOW_BASE);
    }

    #[test]
    fn one_past_page_splits() {
        let chunks: Vec<_> = pages(0, PAGE_SIZE + 1).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].page, 1);
        assert_eq!(chunks[1].page_offset, 0);
        assert_eq!(chunks[1].len, 1);
        assert_eq!(chunks[1].moved, PAGE_SIZE);
    }

    #[test]
    fn unaligned_start_fills_rest_of_page() {
        let offset = PAGE_SIZE - 16;
        let chunks: Vec<_> = pages(offset, 64).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len, 16);
        assert_eq!(chunks[0].window_address(), WINDOW_BASE + 0x1f_fff0);
        assert_eq!(chunks[1].page, 1);
        assert_eq!(chunks[1].len, 48);
    }

    #[test]
    fn page_register_masks_to_eleven_bits() {
        let chunk = pages(0x800 * PAGE_SIZE + 4, 1).next().unwrap();
        assert_eq!(chunk.page, 0x800);
        assert_eq!(chunk.page_register(), 0);
    }

    #[test]
    fn range_ending_at_address_space_top() {
        let chunks: Vec<_> = pages(u64::MAX - 1, 2).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_end(), PAGE_SIZE);
        assert_eq!(pages(u64::MAX, 1).len(), 1);
    }

    #[test]
    fn range_past_address_space_is_cut() {
        let chunks: Vec<_> = pages(u64::MAX - 1, 4).collect();
        assert_eq!(chunks.iter().map(|c| c.len).sum::<u64>(), 2);
        assert_eq!(chunk_count(u64::MAX, 16), 1);
    }

    proptest! {
        #[test]
        fn chunks_cover_length_within_pages(
            offset in 0u64..(64 * PAGE_SIZE),
            length in 0u64..(6 * PAGE_SIZE),
        ) {
            let chunks: Vec<_> = pages(offset, length).collect();
            prop_assert_eq!(chunks.len() as u64, chunk_count(offset, length));
            prop_assert_eq!(chunks.iter().map(|c| c.len).sum::<u64>(), length);
            for c in &chunks {
                prop_assert!(c.len > 0);
                prop_assert!(c.page_end() <= PAGE_SIZE);
            }
        }

        #[test]
        fn chunk_page_tracks_bytes_moved(
            offset in 0u64..(64 * PAGE_SIZE),
            length in 1u64..(6 * PAGE_SIZE),
        ) {
            let mut moved = 0;
            for c in pages(offset, length) {
                prop_assert_eq!(c.moved, moved);
                prop_assert_eq!(c.page, (offset + moved) >> PAGE_SHIFT);
                prop_assert_eq!(c.page_offset, (offset + moved) & (PAGE_SIZE - 1));
                moved += c.len;
            }
            prop_assert_eq!(moved, length);
        }
    }
}
