// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the table pages below a pmap's root.
//!
//! A table page is created on demand by `ensure_table_page` and goes back to the page allocator
//! from `release_table_page` once its last holder is gone. Each valid entry in a table holds it
//! once: a leaf mapping holds its L3 table, an installed L3 table holds its L2 table. The wire
//! count records that the parent entry points at the page.
//!
//! Kernel tables are created by `grow_kernel` and are never released, so kernel leaf mappings
//! don't hold them.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use arrayvec::ArrayVec;
use log::warn;
use page_tables::level::{pindex_base, LEVELS, NUM_L3_PINDEX, VPT_BASE, VPT_L1_INDEX};
use page_tables::{Error as TableError, Level, PteSlot, TableId, TableState, TableStore};
use pmap_pages::{SupervisorPageAddr, VirtAddr};

use crate::platform::Platform;
use crate::pmap::{Pmap, PmapId, PmapInner};
use crate::{Error, PmapSystem, Result};

/// The most table pages a single mapping can need: an L2 and an L3.
const MAX_NEW_TABLES: usize = LEVELS - 1;

/// Zeroed frames obtained before taking the table locks.
pub(crate) type TablePrealloc = ArrayVec<SupervisorPageAddr, MAX_NEW_TABLES>;

/// Returns how many table pages are missing on the walk to the L3 entry for `va`.
pub(crate) fn missing_levels(tables: &TableStore, root: TableId, va: VirtAddr) -> usize {
    if tables.lookup_l2(root, va).is_none() {
        2
    } else if tables.lookup_l3(root, va).is_none() {
        1
    } else {
        0
    }
}

fn pindex_or_panic(level: Level, va: VirtAddr) -> usize {
    match level.pindex_of(va) {
        Some(p) => p,
        None => panic!("root has no table-page index"),
    }
}

/// Returns the address at which the self-map exposes the table page `pindex`.
pub(crate) fn vpt_addr(pindex: usize) -> VirtAddr {
    let offset = if pindex < NUM_L3_PINDEX {
        pindex as u64
    } else {
        ((VPT_L1_INDEX as u64) << Level::L2.addr_shift() >> Level::L3.addr_shift())
            + (pindex - NUM_L3_PINDEX) as u64
    };
    VirtAddr::supervisor_virt(VPT_BASE + (offset << Level::L3.addr_shift()))
}

impl<P: Platform> PmapSystem<P> {
    /// Allocates one zeroed frame for a table page.
    pub(crate) fn alloc_table_frame(&self) -> Result<SupervisorPageAddr> {
        match self.platform.alloc_zeroed_page() {
            Some(frame) => Ok(frame),
            None => {
                warn!("out of memory allocating a table page");
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Tops `prealloc` up to `needed` frames. On failure the frames already obtained are
    /// returned to the allocator.
    pub(crate) fn prealloc_tables(
        &self,
        prealloc: &mut TablePrealloc,
        needed: usize,
    ) -> Result<()> {
        while prealloc.len() < needed {
            match self.alloc_table_frame() {
                Ok(frame) => prealloc.push(frame),
                Err(e) => {
                    self.return_prealloc(core::mem::take(prealloc));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Frees the frames left unused in `prealloc`.
    pub(crate) fn return_prealloc(&self, prealloc: TablePrealloc) {
        for frame in prealloc {
            self.platform.free_page(frame);
        }
    }

    fn insert_table(
        tables: &mut TableStore,
        frame: SupervisorPageAddr,
        level: Level,
        pindex: usize,
    ) -> Result<TableId> {
        tables
            .insert(frame, level, Some(pindex))
            .map_err(|e| match e {
                TableError::AllocFailed => Error::OutOfMemory,
                TableError::FrameInUse(f) => panic!("allocator handed out live table {:?}", f),
            })
    }

    /// Returns the table page `pindex` of `pmap`, holding it once more. Missing pages, including
    /// the L2 above a missing L3, are created from `prealloc` and installed in their parent.
    pub(crate) fn ensure_table_page(
        &self,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        prealloc: &mut TablePrealloc,
        pindex: usize,
    ) -> Result<TableId> {
        if let Some(&id) = inner.ptpages.get(&pindex) {
            tables.page_mut(id).meta_mut().hold();
            return Ok(id);
        }

        let (level, base) = pindex_base(pindex);
        let (parent_slot, parent) = match level {
            Level::L3 => {
                let l2 = self.ensure_table_page(
                    pmap,
                    inner,
                    tables,
                    prealloc,
                    pindex_or_panic(Level::L2, base),
                )?;
                (
                    PteSlot {
                        table: l2,
                        index: Level::L2.index_of(base),
                    },
                    Some(l2),
                )
            }
            Level::L2 => match tables.lookup_l1(pmap.root(), base) {
                Some(slot) => (slot, None),
                None => panic!("{:?} lost its root", pmap.id()),
            },
            Level::L1 => panic!("pindex {} names a root", pindex),
        };

        let created = match prealloc.pop() {
            Some(frame) => {
                let result = Self::insert_table(tables, frame, level, pindex);
                if result.is_err() {
                    // Keep the frame for the caller to free.
                    prealloc.push(frame);
                }
                result
            }
            None => Err(Error::OutOfMemory),
        };
        let id = match created {
            Ok(id) => id,
            Err(e) => {
                // Drop the hold taken on the L2 for this table.
                if let Some(l2) = parent {
                    self.release_table_page(pmap, inner, tables, l2);
                }
                return Err(e);
            }
        };
        tables.install_table(parent_slot, id);
        let meta = tables.page_mut(id).meta_mut();
        meta.wire();
        meta.hold();
        inner.ptpages.insert(pindex, id);
        Ok(id)
    }

    /// Drops one hold on the table page `id`. Once nothing holds it the parent entry is cleared,
    /// the parent loses the hold this page had on it, and the frame goes back to the allocator.
    /// Returns true if the page was freed.
    pub(crate) fn release_table_page(
        &self,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        id: TableId,
    ) -> bool {
        let meta = tables.page_mut(id).meta_mut();
        if meta.unhold() != TableState::Empty {
            return false;
        }
        let level = meta.level();
        let pindex = match meta.pindex() {
            Some(p) => p,
            None => panic!("releasing the root of {:?}", pmap.id()),
        };
        let (_, base) = pindex_base(pindex);
        let (parent_slot, parent) = match level {
            Level::L3 => {
                let l2_pindex = pindex_or_panic(Level::L2, base);
                let l2 = match inner.ptpages.get(&l2_pindex) {
                    Some(&l2) => l2,
                    None => panic!("L3 table {} of {:?} has no L2", pindex, pmap.id()),
                };
                (
                    PteSlot {
                        table: l2,
                        index: Level::L2.index_of(base),
                    },
                    Some(l2),
                )
            }
            Level::L2 => match tables.lookup_l1(pmap.root(), base) {
                Some(slot) => (slot, None),
                None => panic!("{:?} lost its root", pmap.id()),
            },
            Level::L1 => panic!("table page {} is a root", pindex),
        };
        let invalid = page_tables::Pte::invalid();
        self.store_pte(tables, parent_slot, vpt_addr(pindex), invalid);
        inner.ptpages.remove(&pindex);
        // Panics if an entry is still valid.
        let frame = tables.remove(id);
        self.invalidate_page_locked(pmap, inner, vpt_addr(pindex));
        self.platform.free_page(frame);
        if let Some(l2) = parent {
            self.release_table_page(pmap, inner, tables, l2);
        }
        true
    }

    /// Adds the kernel tables covering the L3 table at `va`. A new L2 is also installed in every
    /// live user root.
    pub(crate) fn grow_kernel_step(
        &self,
        live: &BTreeMap<PmapId, Arc<Pmap>>,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        prealloc: &mut TablePrealloc,
        va: VirtAddr,
    ) -> Result<()> {
        let root = self.kernel.root();
        let l1_slot = match tables.lookup_l1(root, va) {
            Some(slot) => slot,
            None => panic!("kernel root missing"),
        };
        let l2 = match tables.next_table(l1_slot) {
            Some(l2) => l2,
            None => {
                let pindex = pindex_or_panic(Level::L2, va);
                let frame = prealloc.pop().ok_or(Error::OutOfMemory)?;
                let l2 = match Self::insert_table(tables, frame, Level::L2, pindex) {
                    Ok(l2) => l2,
                    Err(e) => {
                        prealloc.push(frame);
                        return Err(e);
                    }
                };
                tables.install_table(l1_slot, l2);
                tables.page_mut(l2).meta_mut().wire();
                inner.ptpages.insert(pindex, l2);
                let pte = tables.pte(l1_slot);
                for pmap in live.values().filter(|p| !p.is_kernel()) {
                    tables.set_pte(
                        PteSlot {
                            table: pmap.root(),
                            index: l1_slot.index,
                        },
                        pte,
                    );
                }
                l2
            }
        };
        let l2_slot = PteSlot {
            table: l2,
            index: Level::L2.index_of(va),
        };
        if tables.next_table(l2_slot).is_none() {
            let pindex = pindex_or_panic(Level::L3, va);
            let frame = prealloc.pop().ok_or(Error::OutOfMemory)?;
            let l3 = match Self::insert_table(tables, frame, Level::L3, pindex) {
                Ok(l3) => l3,
                Err(e) => {
                    prealloc.push(frame);
                    return Err(e);
                }
            };
            tables.install_table(l2_slot, l3);
            let meta = tables.page_mut(l3).meta_mut();
            meta.wire();
            meta.hold();
            tables.page_mut(l2).meta_mut().hold();
            inner.ptpages.insert(pindex, l3);
        }
        Ok(())
    }
}
