// SPDX-License-Identifier: AGPL-3.0-only

//! Silicon model for the ADM-XRC image filter design.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the contract between host software and the logic loaded
//! onto the card: register indices, status bit layout, the paged memory
//! window, and the local-bus DMA mode word.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Register map (word indices) and bit definitions |
//! | [`paging`] | 2 MiB page window arithmetic and the chunk iterator |
//! | [`dma`] | DMA direction and mode word layout |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dma;
pub mod paging;
pub mod regs;
