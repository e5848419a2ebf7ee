// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Three-level translation tables
//!
//! ## Key types
//!
//! - `Pte` is a single translation entry: a frame number plus protection, global, wired and the
//!   fault-on-read/write/execute bits used to emulate referenced/modified tracking.
//! - `Level` describes the L1 (root), L2 and L3 (leaf) levels and how a virtual address is split
//!   between them.
//! - `TableStore` owns every table page in the system, indexed both by `TableId` and by the frame
//!   backing the table, and implements the read-only `lookup_l1/l2/l3` walks.
//! - `TableMeta` carries the hold and wire counts that decide when a table page goes back to the
//!   physical allocator.
#![no_std]

extern crate alloc;

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

/// Virtual address layout and per-level address decomposition.
pub mod level;
/// Provides access to the fields of a PTE.
mod pte;
/// Table pages and the store holding them.
mod table;

pub use level::Level;
pub use pte::{Pte, PteFieldBit, PteFieldBits};
pub use table::{Error, PteSlot, Result, TableId, TableMeta, TablePage, TableState, TableStore};
