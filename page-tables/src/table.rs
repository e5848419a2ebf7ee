// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use pmap_arena::{Arena, ArenaId};
use pmap_pages::{SupervisorPageAddr, SupervisorPfn, VirtAddr};

use crate::level::{Level, ENTRIES_PER_TABLE};
use crate::pte::{Pte, PteFieldBits};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The bookkeeping for a new table page couldn't be allocated.
    AllocFailed,
    /// The frame already backs another table page.
    FrameInUse(SupervisorPageAddr),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Handle to a table page in a `TableStore`.
pub type TableId = ArenaId<TablePage>;

/// Lifecycle of a table page, derived from its counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableState {
    /// No holders and not wired into a parent; the page may be returned to the allocator.
    Empty,
    /// Installed in its parent but nothing currently holds it.
    Wired,
    /// At least one mapping, child table or in-progress operation holds the page.
    Referenced,
}

/// Per-table-page bookkeeping.
///
/// `hold_count` counts the references keeping the page alive: one per valid entry resolved
/// through it (a leaf mapping or a child table) plus any creator that has not yet installed its
/// entry. `wire_count` is one while the page is installed in its parent entry.
#[derive(Debug)]
pub struct TableMeta {
    hold_count: u32,
    wire_count: u32,
    level: Level,
    pindex: Option<usize>,
}

impl TableMeta {
    fn new(level: Level, pindex: Option<usize>) -> Self {
        Self {
            hold_count: 0,
            wire_count: 0,
            level,
            pindex,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> TableState {
        if self.hold_count > 0 {
            TableState::Referenced
        } else if self.wire_count > 0 {
            TableState::Wired
        } else {
            TableState::Empty
        }
    }

    pub fn hold_count(&self) -> u32 {
        self.hold_count
    }

    pub fn wire_count(&self) -> u32 {
        self.wire_count
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Position of this page in its owner's table-page index. `None` for a root.
    pub fn pindex(&self) -> Option<usize> {
        self.pindex
    }

    /// Takes a reference on the page.
    pub fn hold(&mut self) -> TableState {
        self.hold_count = self.hold_count.saturating_add(1);
        self.state()
    }

    /// Records that the page has been installed in its parent.
    pub fn wire(&mut self) -> TableState {
        self.wire_count = self.wire_count.saturating_add(1);
        self.state()
    }

    /// Drops a reference. When the last one goes the parent's wiring is dropped too. Panics on
    /// underflow since that means the counts were already inconsistent.
    pub fn unhold(&mut self) -> TableState {
        self.hold_count = match self.hold_count.checked_sub(1) {
            Some(c) => c,
            None => panic!("table page hold count underflow ({:?})", self),
        };
        if self.hold_count == 0 {
            self.wire_count = match self.wire_count.checked_sub(1) {
                Some(c) => c,
                None => panic!("table page wire count underflow ({:?})", self),
            };
        }
        self.state()
    }
}

/// One table page: the frame backing it, its entries and its bookkeeping.
pub struct TablePage {
    frame: SupervisorPageAddr,
    entries: Box<[Pte; ENTRIES_PER_TABLE]>,
    meta: TableMeta,
}

impl TablePage {
    pub fn frame(&self) -> SupervisorPageAddr {
        self.frame
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut TableMeta {
        &mut self.meta
    }

    pub fn entry(&self, index: usize) -> Pte {
        self.entries[index]
    }

    pub fn set_entry(&mut self, index: usize, pte: Pte) {
        self.entries[index] = pte;
    }

    /// Returns the number of valid entries.
    pub fn valid_entries(&self) -> usize {
        self.entries.iter().filter(|pte| pte.valid()).count()
    }

    /// Returns true if every entry is zero.
    pub fn is_zeroed(&self) -> bool {
        self.entries.iter().all(|pte| pte.bits() == 0)
    }
}

/// Location of a single entry: a table page and an index into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSlot {
    pub table: TableId,
    pub index: usize,
}

/// Every table page in the system, looked up by handle or by the frame backing it. Translating a
/// frame number found in a non-leaf entry to the table it names is how walks descend the tree.
#[derive(Default)]
pub struct TableStore {
    tables: Arena<TablePage>,
    by_pfn: BTreeMap<SupervisorPfn, TableId>,
}

impl TableStore {
    pub const fn new() -> Self {
        Self {
            tables: Arena::new(),
            by_pfn: BTreeMap::new(),
        }
    }

    /// Creates a zeroed table page backed by `frame`. Its counters start at zero.
    pub fn insert(
        &mut self,
        frame: SupervisorPageAddr,
        level: Level,
        pindex: Option<usize>,
    ) -> Result<TableId> {
        if self.by_pfn.contains_key(&frame.pfn()) {
            return Err(Error::FrameInUse(frame));
        }
        let page = TablePage {
            frame,
            entries: Box::new([Pte::invalid(); ENTRIES_PER_TABLE]),
            meta: TableMeta::new(level, pindex),
        };
        let id = self
            .tables
            .try_insert(page)
            .map_err(|_| Error::AllocFailed)?;
        self.by_pfn.insert(frame.pfn(), id);
        Ok(id)
    }

    /// Removes the table page, returning the frame that backed it. Panics if the page still has
    /// entries or holders, since freeing it would leave live translations pointing at a recycled
    /// frame.
    pub fn remove(&mut self, id: TableId) -> SupervisorPageAddr {
        let page = self.page(id);
        if !page.is_zeroed() {
            panic!(
                "freeing table page {:?} with {} live entries",
                page.frame,
                page.valid_entries()
            );
        }
        if page.meta.state() != TableState::Empty {
            panic!("freeing referenced table page {:?} ({:?})", page.frame, page.meta);
        }
        let frame = page.frame;
        self.by_pfn.remove(&frame.pfn());
        self.tables.remove(id);
        frame
    }

    pub fn get(&self, id: TableId) -> Option<&TablePage> {
        self.tables.get(id)
    }

    pub fn get_mut(&mut self, id: TableId) -> Option<&mut TablePage> {
        self.tables.get_mut(id)
    }

    /// Like `get` but panics on a stale handle; used where the handle comes from the tree itself.
    pub fn page(&self, id: TableId) -> &TablePage {
        match self.tables.get(id) {
            Some(p) => p,
            None => panic!("stale table page handle {}", id),
        }
    }

    pub fn page_mut(&mut self, id: TableId) -> &mut TablePage {
        match self.tables.get_mut(id) {
            Some(p) => p,
            None => panic!("stale table page handle {}", id),
        }
    }

    /// Returns the table backed by the frame `pfn`, if there is one.
    pub fn table_for_pfn(&self, pfn: SupervisorPfn) -> Option<TableId> {
        self.by_pfn.get(&pfn).copied()
    }

    /// Returns the number of live table pages.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn pte(&self, slot: PteSlot) -> Pte {
        self.page(slot.table).entry(slot.index)
    }

    pub fn set_pte(&mut self, slot: PteSlot, pte: Pte) {
        self.page_mut(slot.table).set_entry(slot.index, pte);
    }

    /// Points `slot` at `child`.
    pub fn install_table(&mut self, slot: PteSlot, child: TableId) {
        let frame = self.page(child).frame();
        self.set_pte(slot, Pte::new(frame.pfn(), PteFieldBits::non_leaf()));
    }

    /// Returns the table the valid entry at `slot` points at.
    pub fn next_table(&self, slot: PteSlot) -> Option<TableId> {
        let pte = self.pte(slot);
        if !pte.valid() {
            return None;
        }
        self.table_for_pfn(pte.pfn())
    }

    /// Returns the root entry translating `va`. The root always exists so this never misses; the
    /// `Option` keeps the three lookups uniform.
    pub fn lookup_l1(&self, root: TableId, va: VirtAddr) -> Option<PteSlot> {
        self.get(root)?;
        Some(PteSlot {
            table: root,
            index: Level::L1.index_of(va),
        })
    }

    /// Returns the L2 entry translating `va`, or `None` if the L1 entry is invalid.
    pub fn lookup_l2(&self, root: TableId, va: VirtAddr) -> Option<PteSlot> {
        let l1 = self.lookup_l1(root, va)?;
        Some(PteSlot {
            table: self.next_table(l1)?,
            index: Level::L2.index_of(va),
        })
    }

    /// Returns the L3 entry translating `va`, or `None` if an intermediate entry is invalid.
    pub fn lookup_l3(&self, root: TableId, va: VirtAddr) -> Option<PteSlot> {
        let l2 = self.lookup_l2(root, va)?;
        Some(PteSlot {
            table: self.next_table(l2)?,
            index: Level::L3.index_of(va),
        })
    }

    /// Returns the entry at `level` translating `va`.
    pub fn lookup(&self, root: TableId, va: VirtAddr, level: Level) -> Option<PteSlot> {
        match level {
            Level::L1 => self.lookup_l1(root, va),
            Level::L2 => self.lookup_l2(root, va),
            Level::L3 => self.lookup_l3(root, va),
        }
    }
}
