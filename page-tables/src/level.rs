// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use pmap_pages::{PageSize, VirtAddr};
use static_assertions::const_assert;

/// Number of levels in the translation tree.
pub const LEVELS: usize = 3;
/// Index bits selected from the address at each level.
pub const INDEX_BITS: u64 = 9;
/// Number of entries in one table page.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;
/// Width of a translated virtual address.
pub const VA_BITS: u64 = 39;

const_assert!(ENTRIES_PER_TABLE * 8 == PageSize::Size4k as usize);
const_assert!(12 + INDEX_BITS * LEVELS as u64 == VA_BITS);

/// Bytes covered by one L1 entry.
pub const L1_SPAN: u64 = PageSize::Size1G as u64;
/// Bytes covered by one L2 entry, i.e. by one L3 table.
pub const L2_SPAN: u64 = PageSize::Size2M as u64;

/// L1 slot holding the recursive mapping of the root.
pub const VPT_L1_INDEX: usize = ENTRIES_PER_TABLE / 2;
/// First L1 slot of the kernel range.
pub const KERNEL_L1_FIRST: usize = VPT_L1_INDEX + 1;

/// Upper bound (exclusive) of user addresses.
pub const USER_MAX: u64 = (VPT_L1_INDEX as u64) * L1_SPAN;
/// Base of the window through which the root maps itself.
pub const VPT_BASE: u64 = USER_MAX;
/// Lowest kernel address.
pub const KERNEL_MIN: u64 = (KERNEL_L1_FIRST as u64) * L1_SPAN;
/// Upper bound (exclusive) of kernel addresses.
pub const KERNEL_MAX: u64 = 1 << VA_BITS;

/// Number of distinct L3 table indices; L2 table indices are numbered after them.
pub const NUM_L3_PINDEX: usize = 1 << (VA_BITS - Level::L2.addr_shift());

/// A level of the translation tree, ordered from the root down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    L1,
    L2,
    L3,
}

impl Level {
    /// Returns the size of the region mapped by one entry at this level.
    pub const fn entry_span(&self) -> PageSize {
        match self {
            Level::L1 => PageSize::Size1G,
            Level::L2 => PageSize::Size2M,
            Level::L3 => PageSize::Size4k,
        }
    }

    /// Returns the next level (in order of decreasing span) in the hierarchy. Returns `None` for
    /// the leaf level.
    pub const fn next(&self) -> Option<Self> {
        match self {
            Level::L1 => Some(Level::L2),
            Level::L2 => Some(Level::L3),
            Level::L3 => None,
        }
    }

    /// Returns the level of the table whose entry points at a table of this level.
    pub const fn parent(&self) -> Option<Self> {
        match self {
            Level::L1 => None,
            Level::L2 => Some(Level::L1),
            Level::L3 => Some(Level::L2),
        }
    }

    /// Returns the position of the table index selected from the input address at this level.
    pub const fn addr_shift(&self) -> u64 {
        match self {
            Level::L1 => 30,
            Level::L2 => 21,
            Level::L3 => 12,
        }
    }

    /// Returns if this is the leaf level.
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Level::L3)
    }

    /// Get the index into a table at this level for the address being translated.
    pub fn index_of(&self, va: VirtAddr) -> usize {
        ((va.bits() >> self.addr_shift()) & (ENTRIES_PER_TABLE as u64 - 1)) as usize
    }

    /// Returns the table-page index of the table at this level covering `va`. The root is not
    /// indexed.
    pub fn pindex_of(&self, va: VirtAddr) -> Option<usize> {
        match self {
            Level::L1 => None,
            Level::L2 => Some(NUM_L3_PINDEX + (va.bits() >> Level::L1.addr_shift()) as usize),
            Level::L3 => Some((va.bits() >> Level::L2.addr_shift()) as usize),
        }
    }
}

/// Returns the level of the table with index `pindex` and the lowest address it translates.
pub fn pindex_base(pindex: usize) -> (Level, VirtAddr) {
    if pindex < NUM_L3_PINDEX {
        (
            Level::L3,
            VirtAddr::supervisor_virt((pindex as u64) << Level::L2.addr_shift()),
        )
    } else {
        (
            Level::L2,
            VirtAddr::supervisor_virt(((pindex - NUM_L3_PINDEX) as u64) << Level::L1.addr_shift()),
        )
    }
}

/// Returns true if `va` can be mapped by a user address space.
pub fn is_user_addr(va: VirtAddr) -> bool {
    va.bits() < USER_MAX
}

/// Returns true if `va` is in the kernel range shared by every address space.
pub fn is_kernel_addr(va: VirtAddr) -> bool {
    (KERNEL_MIN..KERNEL_MAX).contains(&va.bits())
}

/// Rounds `va` up to the next boundary of an entry at `level`, saturating at the end of the
/// address space.
pub fn next_boundary(va: u64, level: Level) -> u64 {
    let span = level.entry_span() as u64;
    (va & !(span - 1)).saturating_add(span).min(KERNEL_MAX)
}
