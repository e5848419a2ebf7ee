// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Entering, changing and removing translations in an address space.
//!
//! Managed mappings start out with all three fault-on bits set, so the first read, write and
//! execute each trap to `emulate_reference_fault`, which records the access in the page's
//! software attributes and clears the bit. That is how referenced/modified state is kept without
//! hardware R/M bits.

use bitflags::bitflags;
use log::trace;
use page_tables::level::{
    is_kernel_addr, is_user_addr, next_boundary, KERNEL_MAX, KERNEL_MIN, USER_MAX,
};
use page_tables::{Level, Pte, PteFieldBit, PteFieldBits, PteSlot, TableStore};
use page_tracking::PageAttrs;
use pmap_pages::{PageAddr, PageSize, PhysAddr, SupervisorPageAddr, VirtAddr, VmProt};

use crate::platform::Platform;
use crate::pmap::{Pmap, PmapInner};
use crate::ptpage::{missing_levels, TablePrealloc};
use crate::pv::PvIndex;
use crate::{Error, PmapSystem, Result};

bitflags! {
    /// What `mincore` found at an address.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MincoreFlags: u8 {
        /// A valid mapping exists.
        const INCORE = 1 << 0;
        /// The mapping has been read since its reference state was last cleared.
        const REFERENCED = 1 << 1;
        /// The mapping has been written since its modified state was last cleared.
        const MODIFIED = 1 << 2;
        /// The page has been read through this or some other mapping.
        const REFERENCED_OTHER = 1 << 3;
        /// The page has been written through this or some other mapping.
        const MODIFIED_OTHER = 1 << 4;
    }
}

/// The residency of one virtual page, as reported by `mincore`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Residency {
    pub flags: MincoreFlags,
    /// Set for managed mappings whose page the caller should consult for the access state of
    /// its other mappings.
    pub pa: Option<PhysAddr>,
}

/// The kind of access that trapped on a fault-on bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    Execute,
}

impl FaultKind {
    /// Fault-on bits an access of this kind proves unnecessary.
    fn cleared_bits(&self) -> u64 {
        let read = PteFieldBit::FaultOnRead.mask() | PteFieldBit::FaultOnExecute.mask();
        match self {
            FaultKind::Read | FaultKind::Execute => read,
            FaultKind::Write => read | PteFieldBit::FaultOnWrite.mask(),
        }
    }
}

/// Mask of all three fault-on bits.
pub(crate) fn fault_on_all() -> u64 {
    PteFieldBit::FaultOnRead.mask()
        | PteFieldBit::FaultOnWrite.mask()
        | PteFieldBit::FaultOnExecute.mask()
}

fn page_base(va: VirtAddr) -> VirtAddr {
    VirtAddr::supervisor_virt(PageSize::Size4k.round_down(va.bits()))
}

impl<P: Platform> PmapSystem<P> {
    /// Returns an error unless `va` belongs to the part of the address space `pmap` may map.
    fn check_range(&self, pmap: &Pmap, va: VirtAddr) -> Result<()> {
        let ok = if pmap.is_kernel() {
            is_kernel_addr(va)
        } else {
            is_user_addr(va)
        };
        if ok {
            Ok(())
        } else {
            Err(Error::AddressOutOfRange(va))
        }
    }

    /// Clamps `[start, end)` to the range `pmap` can map, page aligned.
    fn clamp_range(&self, pmap: &Pmap, start: VirtAddr, end: VirtAddr) -> (u64, u64) {
        let (lo, hi) = if pmap.is_kernel() {
            (KERNEL_MIN, KERNEL_MAX)
        } else {
            (0, USER_MAX)
        };
        let start = PageSize::Size4k.round_down(start.bits()).max(lo);
        let end = PageSize::Size4k.round_up(end.bits().min(hi));
        (start, end)
    }

    pub(crate) fn set_page_attrs(&self, page: SupervisorPageAddr, attrs: PageAttrs) -> PageAttrs {
        match self.pages.set_attrs(page, attrs) {
            Ok(prev) => prev,
            Err(e) => panic!("reverse-mapped page {:?} isn't tracked: {:?}", page, e),
        }
    }

    pub(crate) fn clear_page_attrs(
        &self,
        page: SupervisorPageAddr,
        attrs: PageAttrs,
    ) -> PageAttrs {
        match self.pages.clear_attrs(page, attrs) {
            Ok(prev) => prev,
            Err(e) => panic!("reverse-mapped page {:?} isn't tracked: {:?}", page, e),
        }
    }

    /// Maps `va` in `pmap` to `frame` with protection `prot`, replacing whatever was mapped
    /// there. Re-entering the same frame only updates protection and wiring.
    ///
    /// User address spaces get their table pages on demand; kernel addresses must already be
    /// covered by `grow_kernel`.
    pub fn enter(
        &self,
        pmap: &Pmap,
        va: VirtAddr,
        frame: SupervisorPageAddr,
        prot: VmProt,
        wired: bool,
    ) -> Result<()> {
        self.check_range(pmap, va)?;
        let va = page_base(va);
        let managed = self.pages.is_managed(frame);
        self.with_leaf_tables(pmap, va, |pv, inner, tables, prealloc| {
            self.enter_locked(
                pv,
                pmap,
                inner,
                tables,
                prealloc,
                va,
                frame,
                prot,
                wired,
                managed,
            )
        })
    }

    /// Takes the locks needed to enter a mapping at `va` and runs `f` once every table level
    /// above `va` can be built from the preallocated frames.
    fn with_leaf_tables<T, F>(&self, pmap: &Pmap, va: VirtAddr, mut f: F) -> Result<T>
    where
        F: FnMut(&mut PvIndex, &mut PmapInner, &mut TableStore, &mut TablePrealloc) -> Result<T>,
    {
        let mut prealloc = TablePrealloc::new();
        loop {
            let mut pv = self.pv.lock();
            let mut inner = pmap.lock();
            let mut tables = self.tables.lock();
            let needed = if pmap.is_kernel() {
                0
            } else {
                missing_levels(&tables, pmap.root(), va)
            };
            if prealloc.len() < needed {
                // Allocation happens with no locks held; the tree may change meanwhile, so count
                // again afterwards.
                drop(tables);
                drop(inner);
                drop(pv);
                self.prealloc_tables(&mut prealloc, needed)?;
                continue;
            }
            let result = f(&mut *pv, &mut *inner, &mut *tables, &mut prealloc);
            drop(tables);
            drop(inner);
            drop(pv);
            self.return_prealloc(prealloc);
            return result;
        }
    }

    /// Returns the L3 slot for `va`. User tables are built as needed and held once for the
    /// caller; kernel tables must exist.
    fn leaf_slot(
        &self,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        prealloc: &mut TablePrealloc,
        va: VirtAddr,
    ) -> Result<PteSlot> {
        if pmap.is_kernel() {
            return tables
                .lookup_l3(pmap.root(), va)
                .ok_or(Error::KernelTableMissing(va));
        }
        let pindex = match Level::L3.pindex_of(va) {
            Some(p) => p,
            None => panic!("no L3 index for {:?}", va),
        };
        Ok(PteSlot {
            table: self.ensure_table_page(pmap, inner, tables, prealloc, pindex)?,
            index: Level::L3.index_of(va),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_locked(
        &self,
        pv: &mut PvIndex,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        prealloc: &mut TablePrealloc,
        va: VirtAddr,
        frame: SupervisorPageAddr,
        prot: VmProt,
        wired: bool,
        managed: bool,
    ) -> Result<()> {
        let kernel = pmap.is_kernel();
        let slot = self.leaf_slot(pmap, inner, tables, prealloc, va)?;

        let mut status = PteFieldBits::from_prot(prot, kernel);
        if kernel {
            status.set_bit(PteFieldBit::Global);
        }
        if wired {
            status.set_bit(PteFieldBit::Wired);
        }
        if managed {
            status.set_bit(PteFieldBit::Managed);
        }

        let old = tables.pte(slot);
        // A kernel frame entered with kenter has no reverse-map entry, so becoming managed goes
        // through removal and insertion like a different frame.
        if old.valid() && old.pfn() == frame.pfn() && old.is_managed() == managed {
            // Same frame: only protection and wiring change. The entry already holds its table.
            if !kernel {
                self.release_table_page(pmap, inner, tables, slot.table);
            }
            match (old.is_wired(), wired) {
                (false, true) => inner.inc_wired(),
                (true, false) => inner.dec_wired(),
                _ => (),
            }
            let mut pte = Pte::new(frame.pfn(), status);
            if managed {
                pte.set_fault_bits(old.bits());
                if prot.contains(VmProt::WRITE) {
                    self.set_page_attrs(frame, PageAttrs::WRITEABLE);
                }
            }
            self.store_pte(tables, slot, va, pte);
            self.invalidate_page_locked(pmap, inner, va);
            if prot.contains(VmProt::EXECUTE) {
                self.platform.instruction_barrier();
            }
            trace!("{:?}: changed {:?} -> {:?} {:?}", pmap.id(), va, frame, prot);
            return Ok(());
        }

        if old.valid() {
            // A different frame. Our hold keeps the table alive across the removal.
            self.remove_pte_locked(pv, pmap, inner, tables, slot, va);
            self.invalidate_page_locked(pmap, inner, va);
        }

        self.install_pte(pv, pmap, inner, tables, slot, va, frame, prot, status)
    }

    /// Writes a new mapping of `frame` into the invalid entry at `slot`, which the caller holds.
    /// Managed frames get a reverse-map entry and start with every fault-on bit set. On failure
    /// the hold is dropped.
    #[allow(clippy::too_many_arguments)]
    fn install_pte(
        &self,
        pv: &mut PvIndex,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        slot: PteSlot,
        va: VirtAddr,
        frame: SupervisorPageAddr,
        prot: VmProt,
        status: PteFieldBits,
    ) -> Result<()> {
        let kernel = pmap.is_kernel();
        let mut pte = Pte::new(frame.pfn(), status);
        if pte.is_managed() {
            let table = if kernel { None } else { Some(slot.table) };
            if pv.insert(pmap.id(), va, table, frame).is_err() {
                if !kernel {
                    self.release_table_page(pmap, inner, tables, slot.table);
                }
                return Err(Error::OutOfMemory);
            }
            pte.set_fault_bits(fault_on_all());
            let mut attrs = PageAttrs::MAPPED;
            if prot.contains(VmProt::WRITE) {
                attrs |= PageAttrs::WRITEABLE;
            }
            self.set_page_attrs(frame, attrs);
        }
        inner.inc_resident(pte.is_wired());
        self.store_pte(tables, slot, va, pte);
        if prot.contains(VmProt::EXECUTE) {
            self.platform.instruction_barrier();
        }
        trace!("{:?}: entered {:?} -> {:?} {:?}", pmap.id(), va, frame, prot);
        Ok(())
    }

    /// Removes the reverse-map entry of a managed mapping and drops the hold it had on its
    /// table. Returns true if the table page was freed. Panics if there is no entry: every
    /// managed mapping has exactly one.
    fn remove_pv(
        &self,
        pv: &mut PvIndex,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        page: SupervisorPageAddr,
        va: VirtAddr,
    ) -> bool {
        let entry = match pv.remove(pmap.id(), page, va) {
            Some(e) => e,
            None => panic!("no reverse-map entry for {:?} at {:?} in {:?}", page, va, pmap.id()),
        };
        if pv.page_count(page) == 0 {
            self.clear_page_attrs(page, PageAttrs::MAPPED | PageAttrs::WRITEABLE);
        }
        match entry.table() {
            Some(table) => self.release_table_page(pmap, inner, tables, table),
            None => false,
        }
    }

    /// Clears the valid entry at `slot`, which maps `va`, and undoes its accounting. Access
    /// state the entry recorded is carried over to the page. The caller invalidates the TLB.
    /// Returns true if the L3 table page was freed.
    pub(crate) fn remove_pte_locked(
        &self,
        pv: &mut PvIndex,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        slot: PteSlot,
        va: VirtAddr,
    ) -> bool {
        let old = tables.pte(slot);
        if !old.valid() {
            panic!("removing invalid entry for {:?} in {:?}", va, pmap.id());
        }
        self.store_pte(tables, slot, va, Pte::invalid());
        inner.dec_resident(old.is_wired());
        let page = PageAddr::from_pfn(old.pfn());
        trace!("{:?}: removed {:?} -> {:?}", pmap.id(), va, page);
        if old.is_managed() {
            let mut attrs = PageAttrs::empty();
            if old.referenced() {
                attrs |= PageAttrs::REFERENCED;
            }
            if old.modified() && old.writable() {
                attrs |= PageAttrs::MODIFIED;
            }
            if !attrs.is_empty() {
                self.set_page_attrs(page, attrs);
            }
            self.remove_pv(pv, pmap, inner, tables, page, va)
        } else if !pmap.is_kernel() {
            self.release_table_page(pmap, inner, tables, slot.table)
        } else {
            false
        }
    }

    /// Walks the L3 entries of `[start, end)` in `pmap`, skipping subtrees with no tables, and
    /// calls `f` with each valid one. Stops early once `pmap` has no mappings left.
    fn for_each_valid<F>(
        &self,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        start: u64,
        end: u64,
        mut f: F,
    ) where
        F: FnMut(&mut PmapInner, &mut TableStore, PteSlot, VirtAddr),
    {
        let mut va = start;
        while va < end {
            if inner.stats.resident_count == 0 {
                return;
            }
            let addr = VirtAddr::supervisor_virt(va);
            let l2 = match tables.lookup_l2(pmap.root(), addr) {
                Some(slot) => slot,
                None => {
                    va = next_boundary(va, Level::L1);
                    continue;
                }
            };
            if tables.next_table(l2).is_none() {
                va = next_boundary(va, Level::L2);
                continue;
            }
            if let Some(slot) = tables.lookup_l3(pmap.root(), addr) {
                if tables.pte(slot).valid() {
                    f(inner, tables, slot, addr);
                }
            }
            va += PageSize::Size4k as u64;
        }
    }

    fn remove_range_inner(
        &self,
        pmap: &Pmap,
        start: VirtAddr,
        end: VirtAddr,
        invalidate_each: bool,
    ) {
        let (start, end) = self.clamp_range(pmap, start, end);
        let mut pv = self.pv.lock();
        let mut inner = pmap.lock();
        let mut tables = self.tables.lock();
        self.for_each_valid(
            pmap,
            &mut inner,
            &mut tables,
            start,
            end,
            |inner, tables, slot, va| {
                self.remove_pte_locked(&mut pv, pmap, inner, tables, slot, va);
                if invalidate_each {
                    self.invalidate_page_locked(pmap, inner, va);
                }
            },
        );
    }

    /// Removes every mapping in `[start, end)`. Unmapped parts of the range are skipped, so
    /// removing a range twice is harmless.
    pub fn remove_range(&self, pmap: &Pmap, start: VirtAddr, end: VirtAddr) {
        self.remove_range_inner(pmap, start, end, true);
    }

    /// Removes every user mapping of `pmap` with a single TLB flush at the end. Afterwards the
    /// address space holds no table pages and can be destroyed.
    pub fn remove_pages(&self, pmap: &Pmap) {
        if pmap.is_kernel() {
            panic!("tearing down the kernel pmap");
        }
        self.remove_range_inner(
            pmap,
            VirtAddr::supervisor_virt(0),
            VirtAddr::supervisor_virt(USER_MAX),
            false,
        );
        self.invalidate_all(pmap);
    }

    /// Narrows the protection of `[start, end)` to `prot`. Without read access the mappings are
    /// removed. Dropping write access leaves the fault-on-write bit set so the next write after a
    /// later upgrade still records the modification. Never widens access.
    pub fn protect(&self, pmap: &Pmap, start: VirtAddr, end: VirtAddr, prot: VmProt) {
        if !prot.contains(VmProt::READ) {
            self.remove_range(pmap, start, end);
            return;
        }
        if prot.contains(VmProt::WRITE) {
            return;
        }
        let (start, end) = self.clamp_range(pmap, start, end);
        let mut inner = pmap.lock();
        let mut tables = self.tables.lock();
        self.for_each_valid(
            pmap,
            &mut inner,
            &mut tables,
            start,
            end,
            |inner, tables, slot, va| {
                let mut pte = tables.pte(slot);
                if !pte.writable() {
                    return;
                }
                pte.clear_write();
                pte.set_fault_bits(PteFieldBit::FaultOnWrite.mask());
                self.store_pte(tables, slot, va, pte);
                self.invalidate_page_locked(pmap, inner, va);
            },
        );
    }

    /// Handles a trap on a fault-on bit at `va`. The access is recorded in the page's attributes
    /// and the bits it proves unnecessary are cleared. Fails if nothing is mapped at `va` or the
    /// mapping doesn't permit the access.
    pub fn emulate_reference_fault(
        &self,
        pmap: &Pmap,
        va: VirtAddr,
        kind: FaultKind,
    ) -> Result<()> {
        self.check_range(pmap, va)?;
        let mut inner = pmap.lock();
        let mut tables = self.tables.lock();
        let slot = tables
            .lookup_l3(pmap.root(), va)
            .filter(|slot| tables.pte(*slot).valid())
            .ok_or(Error::NotMapped(va))?;
        let mut pte = tables.pte(slot);
        let permitted = match kind {
            FaultKind::Read | FaultKind::Execute => pte.readable(),
            FaultKind::Write => pte.writable(),
        };
        if !permitted {
            return Err(Error::ProtectionViolation(va));
        }
        if !pte.is_managed() {
            return Ok(());
        }
        let mut attrs = PageAttrs::REFERENCED;
        if kind == FaultKind::Write {
            attrs |= PageAttrs::MODIFIED;
        }
        self.set_page_attrs(PageAddr::from_pfn(pte.pfn()), attrs);
        pte.clear_fault_bits(kind.cleared_bits());
        self.store_pte(&mut tables, slot, page_base(va), pte);
        self.invalidate_page_locked(pmap, &mut inner, page_base(va));
        Ok(())
    }

    /// Returns the leaf entry translating `va`, if it is valid.
    pub(crate) fn leaf_pte(&self, pmap: &Pmap, va: VirtAddr) -> Option<Pte> {
        let tables = self.tables.lock();
        let pte = tables.pte(tables.lookup_l3(pmap.root(), va)?);
        pte.valid().then_some(pte)
    }

    /// Returns the physical address `va` translates to in `pmap`.
    pub fn extract(&self, pmap: &Pmap, va: VirtAddr) -> Option<PhysAddr> {
        self.check_range(pmap, va).ok()?;
        let pte = self.leaf_pte(pmap, va)?;
        let page: SupervisorPageAddr = PageAddr::from_pfn(pte.pfn());
        Some(PhysAddr::supervisor(page.bits() + va.page_offset()))
    }

    /// Maps `frame` read/write at the kernel address `va`. The mapping is wired, global and
    /// bypasses the reverse map.
    pub fn kenter(&self, va: VirtAddr, frame: SupervisorPageAddr) -> Result<()> {
        let kernel = &self.kernel;
        self.check_range(kernel, va)?;
        let va = page_base(va);
        let mut pv = self.pv.lock();
        let mut inner = kernel.lock();
        let mut tables = self.tables.lock();
        let slot = tables
            .lookup_l3(kernel.root(), va)
            .ok_or(Error::KernelTableMissing(va))?;
        let old = tables.pte(slot);
        if old.valid() {
            self.remove_pte_locked(&mut pv, kernel, &mut inner, &mut tables, slot, va);
        }
        let status = PteFieldBits::from_prot(VmProt::READ_WRITE, true)
            .with(PteFieldBit::Global)
            .with(PteFieldBit::Wired);
        self.store_pte(&mut tables, slot, va, Pte::new(frame.pfn(), status));
        inner.inc_resident(true);
        if old.valid() {
            self.invalidate_page_locked(kernel, &mut inner, va);
        }
        Ok(())
    }

    /// Removes the kernel mapping at `va`, if any.
    pub fn kremove(&self, va: VirtAddr) {
        let kernel = &self.kernel;
        if self.check_range(kernel, va).is_err() {
            return;
        }
        let va = page_base(va);
        let mut pv = self.pv.lock();
        let mut inner = kernel.lock();
        let mut tables = self.tables.lock();
        if let Some(slot) = tables.lookup_l3(kernel.root(), va) {
            if tables.pte(slot).valid() {
                self.remove_pte_locked(&mut pv, kernel, &mut inner, &mut tables, slot, va);
                self.invalidate_page_locked(kernel, &mut inner, va);
            }
        }
    }

    /// Maps `frames` at consecutive kernel pages starting at `va`, overwriting whatever was
    /// there, then flushes the whole range at once. The mappings are like those of `kenter`.
    /// Fails without changing anything if a page of the range has no kernel table.
    pub fn qenter(&self, va: VirtAddr, frames: &[SupervisorPageAddr]) -> Result<()> {
        let kernel = &self.kernel;
        self.check_range(kernel, va)?;
        let start = PageSize::Size4k.round_down(va.bits());
        let end = start + frames.len() as u64 * PageSize::Size4k as u64;
        let mut pv = self.pv.lock();
        let mut inner = kernel.lock();
        let mut tables = self.tables.lock();
        for addr in (start..end).step_by(PageSize::Size4k as usize) {
            let page = VirtAddr::supervisor_virt(addr);
            self.check_range(kernel, page)?;
            tables
                .lookup_l3(kernel.root(), page)
                .ok_or(Error::KernelTableMissing(page))?;
        }
        let status = PteFieldBits::from_prot(VmProt::READ_WRITE, true)
            .with(PteFieldBit::Global)
            .with(PteFieldBit::Wired);
        for (i, frame) in frames.iter().enumerate() {
            let page = VirtAddr::supervisor_virt(start + i as u64 * PageSize::Size4k as u64);
            let slot = match tables.lookup_l3(kernel.root(), page) {
                Some(slot) => slot,
                None => panic!("kernel table for {:?} vanished", page),
            };
            if tables.pte(slot).valid() {
                self.remove_pte_locked(&mut pv, kernel, &mut inner, &mut tables, slot, page);
            }
            self.store_pte(&mut tables, slot, page, Pte::new(frame.pfn(), status));
            inner.inc_resident(true);
        }
        if start < end {
            self.invalidate_range_locked(kernel, &mut inner, start, end);
        }
        trace!("qenter {:#x}..{:#x}", start, end);
        Ok(())
    }

    /// Removes `count` consecutive kernel mappings starting at `va` with a single ranged flush.
    /// Pages with nothing mapped, or outside the kernel range, are skipped.
    pub fn qremove(&self, va: VirtAddr, count: usize) {
        let kernel = &self.kernel;
        let start = PageSize::Size4k.round_down(va.bits());
        let end = start.saturating_add((count as u64).saturating_mul(PageSize::Size4k as u64));
        let mut pv = self.pv.lock();
        let mut inner = kernel.lock();
        let mut tables = self.tables.lock();
        let mut removed = false;
        for addr in (start..end).step_by(PageSize::Size4k as usize) {
            let page = VirtAddr::supervisor_virt(addr);
            if self.check_range(kernel, page).is_err() {
                continue;
            }
            if let Some(slot) = tables.lookup_l3(kernel.root(), page) {
                if tables.pte(slot).valid() {
                    self.remove_pte_locked(&mut pv, kernel, &mut inner, &mut tables, slot, page);
                    removed = true;
                }
            }
        }
        if removed {
            self.invalidate_range_locked(kernel, &mut inner, start, end);
        }
    }

    /// Maps `frame` at `va` read-only (plus execute if `prot` asks for it) and unwired, unless
    /// something is already mapped there. Returns whether a mapping was entered. Meant for
    /// prefaulting, where an existing mapping is always the better one.
    pub fn enter_quick(
        &self,
        pmap: &Pmap,
        va: VirtAddr,
        frame: SupervisorPageAddr,
        prot: VmProt,
    ) -> Result<bool> {
        self.check_range(pmap, va)?;
        let va = page_base(va);
        let managed = self.pages.is_managed(frame);
        self.with_leaf_tables(pmap, va, |pv, inner, tables, prealloc| {
            self.enter_quick_locked(pv, pmap, inner, tables, prealloc, va, frame, prot, managed)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_quick_locked(
        &self,
        pv: &mut PvIndex,
        pmap: &Pmap,
        inner: &mut PmapInner,
        tables: &mut TableStore,
        prealloc: &mut TablePrealloc,
        va: VirtAddr,
        frame: SupervisorPageAddr,
        prot: VmProt,
        managed: bool,
    ) -> Result<bool> {
        let kernel = pmap.is_kernel();
        let slot = self.leaf_slot(pmap, inner, tables, prealloc, va)?;
        if tables.pte(slot).valid() {
            if !kernel {
                self.release_table_page(pmap, inner, tables, slot.table);
            }
            return Ok(false);
        }
        let prot = (prot & VmProt::EXECUTE) | VmProt::READ;
        let mut status = PteFieldBits::from_prot(prot, kernel);
        if kernel {
            status.set_bit(PteFieldBit::Global);
        }
        if managed {
            status.set_bit(PteFieldBit::Managed);
        }
        self.install_pte(pv, pmap, inner, tables, slot, va, frame, prot, status)?;
        Ok(true)
    }

    /// Prefaults the resident pages of an object: `pages[i]`, if present, is entered with
    /// `enter_quick` at `start + i * 4kB` as long as that is below `end`. Returns how many
    /// mappings were entered. Stops at the first error; what was entered before it stays.
    pub fn enter_object(
        &self,
        pmap: &Pmap,
        start: VirtAddr,
        end: VirtAddr,
        pages: &[Option<SupervisorPageAddr>],
        prot: VmProt,
    ) -> Result<usize> {
        let start = PageSize::Size4k.round_down(start.bits());
        let mut entered = 0;
        for (i, page) in pages.iter().enumerate() {
            let addr = start + i as u64 * PageSize::Size4k as u64;
            if addr >= end.bits() {
                break;
            }
            if let Some(frame) = page {
                if self.enter_quick(pmap, VirtAddr::supervisor_virt(addr), *frame, prot)? {
                    entered += 1;
                }
            }
        }
        Ok(entered)
    }

    /// Reports whether `va` is mapped in `pmap` and what accesses its mapping has seen. Both
    /// flags of a kind are set from the entry alone; when not both `_OTHER` flags are set for a
    /// managed mapping, `pa` names the page so the caller can look at its other mappings.
    pub fn mincore(&self, pmap: &Pmap, va: VirtAddr) -> Residency {
        if self.check_range(pmap, va).is_err() {
            return Residency::default();
        }
        let _inner = pmap.lock();
        let pte = match self.leaf_pte(pmap, va) {
            Some(pte) => pte,
            None => return Residency::default(),
        };
        let mut flags = MincoreFlags::INCORE;
        if pte.referenced() {
            flags |= MincoreFlags::REFERENCED | MincoreFlags::REFERENCED_OTHER;
        }
        if pte.modified() && pte.writable() {
            flags |= MincoreFlags::MODIFIED | MincoreFlags::MODIFIED_OTHER;
        }
        let both = MincoreFlags::REFERENCED_OTHER | MincoreFlags::MODIFIED_OTHER;
        let pa = (pte.is_managed() && !flags.contains(both)).then(|| {
            let page: SupervisorPageAddr = PageAddr::from_pfn(pte.pfn());
            PhysAddr::supervisor(page.bits() + va.page_offset())
        });
        Residency { flags, pa }
    }

    /// Returns true if `va` can be prefaulted in `pmap`: its L3 table exists and the entry is
    /// invalid.
    pub fn is_prefaultable(&self, pmap: &Pmap, va: VirtAddr) -> bool {
        if self.check_range(pmap, va).is_err() {
            return false;
        }
        let _inner = pmap.lock();
        let tables = self.tables.lock();
        tables
            .lookup_l3(pmap.root(), va)
            .is_some_and(|slot| !tables.pte(slot).valid())
    }

    /// Sets or clears the wired bit of the mapping at `va`.
    pub fn change_wiring(&self, pmap: &Pmap, va: VirtAddr, wired: bool) -> Result<()> {
        self.check_range(pmap, va)?;
        let mut inner = pmap.lock();
        let mut tables = self.tables.lock();
        let slot = tables
            .lookup_l3(pmap.root(), va)
            .filter(|slot| tables.pte(*slot).valid())
            .ok_or(Error::NotMapped(va))?;
        let mut pte = tables.pte(slot);
        match (pte.is_wired(), wired) {
            (false, true) => {
                pte.set_bit(PteFieldBit::Wired);
                inner.inc_wired();
            }
            (true, false) => {
                pte.clear_bit(PteFieldBit::Wired);
                inner.dec_wired();
            }
            _ => return Ok(()),
        }
        // The wired bit is software-only, no invalidation needed.
        self.store_pte(&mut tables, slot, page_base(va), pte);
        Ok(())
    }

    /// Clears the wired bit of every mapping in `[start, end)`.
    pub fn unwire(&self, pmap: &Pmap, start: VirtAddr, end: VirtAddr) {
        let (start, end) = self.clamp_range(pmap, start, end);
        let mut inner = pmap.lock();
        let mut tables = self.tables.lock();
        self.for_each_valid(
            pmap,
            &mut inner,
            &mut tables,
            start,
            end,
            |inner, tables, slot, va| {
                let mut pte = tables.pte(slot);
                if pte.is_wired() {
                    pte.clear_bit(PteFieldBit::Wired);
                    self.store_pte(tables, slot, va, pte);
                    inner.dec_wired();
                }
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use page_tables::level::{KERNEL_MIN, L2_SPAN};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::vec::Vec;

    fn va(addr: u64) -> VirtAddr {
        VirtAddr::supervisor_virt(addr)
    }

    fn pa(page: SupervisorPageAddr) -> PhysAddr {
        PhysAddr::supervisor(page.bits())
    }

    #[test]
    fn enter_protect_fault_remove_destroy() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let frame = managed_page(3);
        system
            .enter(&pmap, va(0x10000), frame, VmProt::READ_WRITE, false)
            .unwrap();
        assert_eq!(system.extract(&pmap, va(0x10000)), Some(pa(frame)));
        assert_eq!(pmap.resident_count(), 1);

        system.protect(&pmap, va(0x10000), va(0x11000), VmProt::READ_ONLY);
        assert_eq!(
            system.emulate_reference_fault(&pmap, va(0x10000), FaultKind::Write),
            Err(Error::ProtectionViolation(va(0x10000)))
        );
        assert!(system
            .emulate_reference_fault(&pmap, va(0x10000), FaultKind::Read)
            .is_ok());

        system.remove_range(&pmap, va(0x10000), va(0x11000));
        assert_eq!(system.extract(&pmap, va(0x10000)), None);
        assert_eq!(pmap.resident_count(), 0);
        assert_eq!(pmap.table_pages(), 0);
        system.destroy(pmap);
        assert_eq!(system.platform().outstanding(), system.table_pages_in_use());
    }

    #[test]
    fn extract_keeps_page_offset() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let frame = managed_page(1);
        system
            .enter(&pmap, va(0x12345), frame, VmProt::READ, false)
            .unwrap();
        assert_eq!(
            system.extract(&pmap, va(0x12abc)),
            Some(PhysAddr::supervisor(frame.bits() + 0xabc))
        );
        assert_eq!(system.extract(&pmap, va(0x13000)), None);
        // Outside the user range.
        assert_eq!(system.extract(&pmap, va(KERNEL_MIN)), None);
    }

    #[test]
    fn enter_rejects_out_of_range() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let frame = managed_page(0);
        assert_eq!(
            system.enter(&pmap, va(USER_MAX), frame, VmProt::READ, false),
            Err(Error::AddressOutOfRange(va(USER_MAX)))
        );
        let kernel = system.kernel_pmap();
        assert_eq!(
            system.enter(kernel, va(0x1000), frame, VmProt::READ, false),
            Err(Error::AddressOutOfRange(va(0x1000)))
        );
        let beyond = system.kernel_limit().bits();
        assert_eq!(
            system.enter(kernel, va(beyond), frame, VmProt::READ, false),
            Err(Error::KernelTableMissing(va(beyond)))
        );
    }

    #[test]
    fn remove_range_twice_is_noop() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        for i in 0..4 {
            system
                .enter(
                    &pmap,
                    va(0x10000 + i * 0x1000),
                    managed_page(i),
                    VmProt::READ_WRITE,
                    i == 0,
                )
                .unwrap();
        }
        assert_eq!(pmap.stats().wired_count, 1);
        system.remove_range(&pmap, va(0x10000), va(0x12000));
        assert_eq!(pmap.resident_count(), 2);
        assert_eq!(pmap.wired_count(), 0);
        system.remove_range(&pmap, va(0x10000), va(0x12000));
        assert_eq!(pmap.resident_count(), 2);
        system.remove_range(&pmap, va(0), va(USER_MAX));
        assert_eq!(pmap.resident_count(), 0);
        system.remove_range(&pmap, va(0), va(USER_MAX));
        system.destroy(pmap);
    }

    #[test]
    fn full_l3_table_is_reclaimed_once() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let allocs = system.platform().allocs();
        let frees = system.platform().frees();
        let base = 4 * L2_SPAN;
        for i in 0..512u64 {
            system
                .enter(
                    &pmap,
                    va(base + i * 0x1000),
                    managed_page(i),
                    VmProt::READ,
                    false,
                )
                .unwrap();
        }
        // One L2 and one L3.
        assert_eq!(system.platform().allocs(), allocs + 2);
        assert_eq!(pmap.table_pages(), 2);
        for i in 0..511u64 {
            system.remove_range(&pmap, va(base + i * 0x1000), va(base + (i + 1) * 0x1000));
            assert_eq!(system.platform().frees(), frees);
        }
        system.remove_range(&pmap, va(base + 511 * 0x1000), va(base + L2_SPAN));
        assert_eq!(system.platform().frees(), frees + 2);
        assert_eq!(pmap.table_pages(), 0);
        // Removing again frees nothing more.
        system.remove_range(&pmap, va(base), va(base + L2_SPAN));
        assert_eq!(system.platform().frees(), frees + 2);
        assert_eq!(system.platform().allocs(), allocs + 2);
        system.destroy(pmap);
    }

    #[test]
    fn reenter_same_frame_changes_wiring_only() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let frame = managed_page(9);
        system
            .enter(&pmap, va(0x40000), frame, VmProt::READ, false)
            .unwrap();
        system
            .emulate_reference_fault(&pmap, va(0x40000), FaultKind::Read)
            .unwrap();
        system
            .enter(&pmap, va(0x40000), frame, VmProt::READ_WRITE, true)
            .unwrap();
        assert_eq!(pmap.resident_count(), 1);
        assert_eq!(pmap.wired_count(), 1);
        assert_eq!(system.page_mappings(frame), 1);
        let pte = system.leaf_pte(&pmap, va(0x40000)).unwrap();
        // The read already seen isn't forgotten; the first write still traps.
        assert!(!pte.is_set(PteFieldBit::FaultOnRead));
        assert!(pte.is_set(PteFieldBit::FaultOnWrite));
        assert!(pte.writable());
        // Still exactly one hold on the L3 table.
        system.remove_range(&pmap, va(0x40000), va(0x41000));
        assert_eq!(pmap.table_pages(), 0);
        assert_eq!(pmap.wired_count(), 0);
    }

    #[test]
    fn enter_different_frame_replaces_mapping() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let old = managed_page(1);
        let new = managed_page(2);
        system
            .enter(&pmap, va(0x8000), old, VmProt::READ_WRITE, false)
            .unwrap();
        system
            .emulate_reference_fault(&pmap, va(0x8000), FaultKind::Write)
            .unwrap();
        system
            .enter(&pmap, va(0x8000), new, VmProt::READ, false)
            .unwrap();
        assert_eq!(system.extract(&pmap, va(0x8000)), Some(pa(new)));
        assert_eq!(pmap.resident_count(), 1);
        assert!(!system.page_exists_in(&pmap, old));
        assert!(system.page_exists_in(&pmap, new));
        assert!(!system.page_is_mapped(old));
        // The old page keeps the modification it saw.
        assert!(system.is_modified(old));
        assert!(!system.is_modified(new));
    }

    #[test]
    fn reference_and_modify_emulation() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let frame = managed_page(5);
        system
            .enter(&pmap, va(0x20000), frame, VmProt::READ_WRITE, false)
            .unwrap();
        let pte = system.leaf_pte(&pmap, va(0x20000)).unwrap();
        assert!(pte.is_set(PteFieldBit::FaultOnRead));
        assert!(pte.is_set(PteFieldBit::FaultOnWrite));
        assert!(pte.is_set(PteFieldBit::FaultOnExecute));
        assert!(!system.is_modified(frame));
        assert!(!system.is_referenced(frame));

        system
            .emulate_reference_fault(&pmap, va(0x20010), FaultKind::Write)
            .unwrap();
        assert!(system.is_modified(frame));
        assert!(system.is_referenced(frame));
        let pte = system.leaf_pte(&pmap, va(0x20000)).unwrap();
        assert!(!pte.is_set(PteFieldBit::FaultOnWrite));

        system.clear_modified(frame);
        assert!(!system.is_modified(frame));
        // The next write traps again.
        let pte = system.leaf_pte(&pmap, va(0x20000)).unwrap();
        assert!(pte.is_set(PteFieldBit::FaultOnWrite));
        system
            .emulate_reference_fault(&pmap, va(0x20000), FaultKind::Write)
            .unwrap();
        assert!(system.is_modified(frame));
    }

    #[test]
    fn fault_on_unmapped_address() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        assert_eq!(
            system.emulate_reference_fault(&pmap, va(0x30000), FaultKind::Read),
            Err(Error::NotMapped(va(0x30000)))
        );
        system
            .enter(&pmap, va(0x30000), mmio_page(), VmProt::READ, false)
            .unwrap();
        // Unmanaged mappings never carry fault-on bits.
        let pte = system.leaf_pte(&pmap, va(0x30000)).unwrap();
        assert!(!pte.is_managed());
        assert!(!pte.is_set(PteFieldBit::FaultOnRead));
        assert!(system
            .emulate_reference_fault(&pmap, va(0x30000), FaultKind::Execute)
            .is_ok());
        system.remove_pages(&pmap);
        system.destroy(pmap);
    }

    #[test]
    fn protect_without_read_removes() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        system
            .enter(&pmap, va(0x10000), managed_page(0), VmProt::READ_WRITE, false)
            .unwrap();
        system.protect(&pmap, va(0x10000), va(0x11000), VmProt::empty());
        assert_eq!(system.extract(&pmap, va(0x10000)), None);
        assert_eq!(pmap.table_pages(), 0);
    }

    #[test]
    fn protect_never_widens() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        system
            .enter(&pmap, va(0x10000), managed_page(0), VmProt::READ, false)
            .unwrap();
        system.protect(&pmap, va(0x10000), va(0x11000), VmProt::READ_WRITE);
        assert!(!system.leaf_pte(&pmap, va(0x10000)).unwrap().writable());
    }

    #[test]
    fn wiring_changes() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        for i in 0..3 {
            system
                .enter(
                    &pmap,
                    va(0x10000 + i * 0x1000),
                    managed_page(i),
                    VmProt::READ,
                    false,
                )
                .unwrap();
        }
        system.change_wiring(&pmap, va(0x10000), true).unwrap();
        system.change_wiring(&pmap, va(0x11000), true).unwrap();
        system.change_wiring(&pmap, va(0x11000), true).unwrap();
        assert_eq!(pmap.wired_count(), 2);
        assert_eq!(system.page_wired_mappings(managed_page(1)), 1);
        assert_eq!(
            system.change_wiring(&pmap, va(0x50000), true),
            Err(Error::NotMapped(va(0x50000)))
        );
        system.unwire(&pmap, va(0x10000), va(0x13000));
        assert_eq!(pmap.wired_count(), 0);
        assert_eq!(system.page_wired_mappings(managed_page(1)), 0);
    }

    #[test]
    fn kernel_enter_and_remove() {
        let system = stub_system(2);
        let kva = va(KERNEL_MIN + 0x3000);
        system.kenter(kva, mmio_page()).unwrap();
        let kernel = system.kernel_pmap();
        assert_eq!(kernel.resident_count(), 1);
        assert_eq!(kernel.wired_count(), 1);
        let pte = system.leaf_pte(kernel, kva).unwrap();
        assert!(pte.is_global());
        assert!(pte.is_wired());

        // User address spaces see kernel mappings through the shared tables.
        let pmap = system.create().unwrap();
        assert_eq!(system.leaf_pte(&pmap, kva), Some(pte));

        system.platform().reset_logs();
        system.kremove(kva);
        assert_eq!(system.extract(kernel, kva), None);
        assert_eq!(kernel.resident_count(), 0);
        // The kernel is active everywhere, so every CPU flushed the address.
        assert_eq!(system.platform().cpu_log(0).invalidated, vec![kva]);
        assert_eq!(system.platform().cpu_log(1).invalidated, vec![kva]);
        // Kernel tables stay.
        assert_eq!(kernel.table_pages(), 2);
        system.kremove(kva);
    }

    #[test]
    fn managed_kernel_mapping() {
        let system = stub_system(1);
        let kernel = system.kernel_pmap();
        let kva = va(KERNEL_MIN + 0x7000);
        let frame = managed_page(12);
        system
            .enter(kernel, kva, frame, VmProt::READ_WRITE, false)
            .unwrap();
        assert!(system.page_exists_in(kernel, frame));
        assert!(system.leaf_pte(kernel, kva).unwrap().is_global());
        system.remove_all(frame);
        assert_eq!(system.extract(kernel, kva), None);
        assert_eq!(kernel.table_pages(), 2);
    }

    #[test]
    fn enter_out_of_memory() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let outstanding = system.platform().outstanding();
        system.platform().fail_after(1);
        assert_eq!(
            system.enter(&pmap, va(0x10000), managed_page(0), VmProt::READ, false),
            Err(Error::OutOfMemory)
        );
        assert_eq!(system.platform().outstanding(), outstanding);
        assert_eq!(pmap.resident_count(), 0);
        assert!(!system.page_is_mapped(managed_page(0)));
        system.platform().clear_failure();
        system
            .enter(&pmap, va(0x10000), managed_page(0), VmProt::READ, false)
            .unwrap();
    }

    #[test]
    fn remove_pages_tears_down_everything() {
        let system = stub_system(2);
        let pmap = system.create().unwrap();
        system.activate(&pmap);
        for (i, addr) in [0x1000u64, 0x4000_0000, USER_MAX - 0x1000]
            .iter()
            .enumerate()
        {
            system
                .enter(&pmap, va(*addr), managed_page(i as u64), VmProt::READ, true)
                .unwrap();
        }
        system.platform().reset_logs();
        system.remove_pages(&pmap);
        assert_eq!(pmap.resident_count(), 0);
        assert_eq!(pmap.wired_count(), 0);
        assert_eq!(pmap.table_pages(), 0);
        assert_eq!(system.platform().cpu_log(0).flush_all, 1);
        system.deactivate(&pmap);
        system.destroy(pmap);
    }

    #[test]
    fn kenter_then_managed_enter_keeps_reverse_map() {
        let system = stub_system(1);
        let kernel = system.kernel_pmap();
        let kva = va(KERNEL_MIN + 0x5000);
        let frame = managed_page(3);
        system.kenter(kva, frame).unwrap();
        assert_eq!(system.page_mappings(frame), 0);

        system
            .enter(kernel, kva, frame, VmProt::READ_WRITE, false)
            .unwrap();
        let pte = system.leaf_pte(kernel, kva).unwrap();
        assert!(pte.is_managed());
        assert!(!pte.is_wired());
        assert_eq!(system.page_mappings(frame), 1);
        assert_eq!(kernel.resident_count(), 1);
        assert_eq!(kernel.wired_count(), 0);

        system.kremove(kva);
        assert_eq!(system.extract(kernel, kva), None);
        assert_eq!(system.page_mappings(frame), 0);
        assert!(!system.page_is_mapped(frame));
        assert_eq!(kernel.resident_count(), 0);
        assert_eq!(kernel.wired_count(), 0);
    }

    #[test]
    fn enter_frame_above_32bit_pfn() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        // The second frame shares its low 32 frame-number bits with the first table frame.
        let frames = [1u64 << 44, (1 << 44) | 0x1_0000_0000];
        for (i, bits) in frames.iter().enumerate() {
            let frame = SupervisorPageAddr::supervisor(*bits).unwrap();
            let addr = va(0x10000 + i as u64 * 0x1000);
            system
                .enter(&pmap, addr, frame, VmProt::READ_WRITE, false)
                .unwrap();
            assert!(!system.leaf_pte(&pmap, addr).unwrap().is_managed());
        }
        for (i, bits) in frames.iter().enumerate() {
            let addr = va(0x10000 + i as u64 * 0x1000 + 0x123);
            assert_eq!(
                system.extract(&pmap, addr),
                Some(PhysAddr::supervisor(bits + 0x123))
            );
        }
        system.remove_range(&pmap, va(0x10000), va(0x12000));
        assert_eq!(pmap.table_pages(), 0);
        system.destroy(pmap);
        assert_eq!(system.platform().outstanding(), system.table_pages_in_use());
    }

    #[test]
    fn qenter_overwrites_and_flushes_range() {
        let system = stub_system(2);
        let kernel = system.kernel_pmap();
        let base = KERNEL_MIN + 0x10000;
        let old = managed_page(5);
        system.kenter(va(base), mmio_page()).unwrap();
        system
            .enter(kernel, va(base + 0x1000), old, VmProt::READ_WRITE, false)
            .unwrap();
        assert_eq!(system.page_mappings(old), 1);
        system.platform().reset_logs();

        let frames = [managed_page(1), managed_page(2), managed_page(3)];
        system.qenter(va(base), &frames).unwrap();
        assert_eq!(kernel.resident_count(), 3);
        assert_eq!(kernel.wired_count(), 3);
        assert_eq!(system.page_mappings(old), 0);
        let vas: Vec<_> = (0..3).map(|i| va(base + i * 0x1000)).collect();
        for (addr, frame) in vas.iter().zip(frames.iter()) {
            assert_eq!(system.extract(kernel, *addr), Some(pa(*frame)));
            let pte = system.leaf_pte(kernel, *addr).unwrap();
            assert!(pte.is_global());
            assert!(!pte.is_managed());
            // No reverse-map entries for temporary mappings.
            assert_eq!(system.page_mappings(*frame), 0);
        }
        // One ranged flush on every CPU.
        assert_eq!(system.platform().cpu_log(0).invalidated, vas);
        assert_eq!(system.platform().cpu_log(1).invalidated, vas);
        assert_eq!(system.platform().cpu_log(1).barriers, 1);

        system.platform().reset_logs();
        system.qremove(va(base), 4);
        assert_eq!(kernel.resident_count(), 0);
        assert_eq!(kernel.wired_count(), 0);
        assert!(vas.iter().all(|addr| system.extract(kernel, *addr).is_none()));
        assert_eq!(system.platform().cpu_log(0).invalidated.len(), 4);
        // Nothing left to remove, nothing to flush.
        system.platform().reset_logs();
        system.qremove(va(base), 4);
        system.qremove(va(0x1000), 1);
        assert!(system.platform().cpu_log(0).invalidated.is_empty());
        assert_eq!(kernel.table_pages(), 2);
    }

    #[test]
    fn qenter_needs_kernel_tables() {
        let system = stub_system(1);
        let kernel = system.kernel_pmap();
        let limit = system.kernel_limit().bits();
        let frames = [managed_page(1), managed_page(2)];
        assert_eq!(
            system.qenter(va(limit - 0x1000), &frames),
            Err(Error::KernelTableMissing(va(limit)))
        );
        assert_eq!(kernel.resident_count(), 0);
        assert_eq!(system.extract(kernel, va(limit - 0x1000)), None);
        assert_eq!(
            system.qenter(va(0x1000), &frames),
            Err(Error::AddressOutOfRange(va(0x1000)))
        );
        system.qenter(va(limit - 0x1000), &[]).unwrap();
    }

    #[test]
    fn enter_quick_never_replaces() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let first = managed_page(1);
        assert!(system
            .enter_quick(&pmap, va(0x10000), first, VmProt::READ_WRITE | VmProt::EXECUTE)
            .unwrap());
        let pte = system.leaf_pte(&pmap, va(0x10000)).unwrap();
        assert!(pte.readable());
        assert!(!pte.writable());
        assert!(!pte.is_wired());
        assert!(pte.is_set(PteFieldBit::FaultOnRead));
        assert_eq!(system.page_mappings(first), 1);
        assert_eq!(pmap.table_pages(), 2);

        assert!(!system
            .enter_quick(&pmap, va(0x10000), managed_page(2), VmProt::READ)
            .unwrap());
        assert_eq!(system.extract(&pmap, va(0x10000)), Some(pa(first)));
        assert!(!system.page_is_mapped(managed_page(2)));
        assert_eq!(pmap.resident_count(), 1);
        // The refused entry left no extra hold on the table.
        system.remove_range(&pmap, va(0x10000), va(0x11000));
        assert_eq!(pmap.table_pages(), 0);

        assert_eq!(
            system.enter_quick(&pmap, va(USER_MAX), first, VmProt::READ),
            Err(Error::AddressOutOfRange(va(USER_MAX)))
        );
        system.platform().fail_after(0);
        assert_eq!(
            system.enter_quick(&pmap, va(0x10000), first, VmProt::READ),
            Err(Error::OutOfMemory)
        );
        system.platform().clear_failure();
        system.destroy(pmap);
    }

    #[test]
    fn enter_object_maps_resident_pages() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let existing = managed_page(7);
        system
            .enter(&pmap, va(0x22000), existing, VmProt::READ_WRITE, true)
            .unwrap();
        let pages = [
            Some(managed_page(0)),
            None,
            Some(managed_page(2)),
            Some(managed_page(3)),
        ];
        let entered = system
            .enter_object(&pmap, va(0x20000), va(0x23000), &pages, VmProt::READ)
            .unwrap();
        assert_eq!(entered, 1);
        assert_eq!(system.extract(&pmap, va(0x20000)), Some(pa(managed_page(0))));
        assert_eq!(system.extract(&pmap, va(0x21000)), None);
        assert_eq!(system.extract(&pmap, va(0x22000)), Some(pa(existing)));
        assert_eq!(system.extract(&pmap, va(0x23000)), None);
        assert_eq!(pmap.resident_count(), 2);
        assert_eq!(pmap.wired_count(), 1);
        system.remove_pages(&pmap);
        system.destroy(pmap);
    }

    #[test]
    fn mincore_reports_access_state() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        let frame = managed_page(4);
        assert_eq!(system.mincore(&pmap, va(0x10000)), Residency::default());
        system
            .enter(&pmap, va(0x10000), frame, VmProt::READ_WRITE, false)
            .unwrap();
        let found = system.mincore(&pmap, va(0x10042));
        assert_eq!(found.flags, MincoreFlags::INCORE);
        assert_eq!(found.pa, Some(PhysAddr::supervisor(frame.bits() + 0x42)));

        system
            .emulate_reference_fault(&pmap, va(0x10000), FaultKind::Read)
            .unwrap();
        let found = system.mincore(&pmap, va(0x10000));
        assert_eq!(
            found.flags,
            MincoreFlags::INCORE | MincoreFlags::REFERENCED | MincoreFlags::REFERENCED_OTHER
        );
        assert_eq!(found.pa, Some(pa(frame)));

        // Nothing more to learn from other mappings once both are known.
        system
            .emulate_reference_fault(&pmap, va(0x10000), FaultKind::Write)
            .unwrap();
        let found = system.mincore(&pmap, va(0x10000));
        assert!(found.flags.contains(MincoreFlags::MODIFIED | MincoreFlags::MODIFIED_OTHER));
        assert_eq!(found.pa, None);

        // Unmanaged mappings never name their frame.
        system
            .enter(&pmap, va(0x11000), mmio_page(), VmProt::READ, false)
            .unwrap();
        let found = system.mincore(&pmap, va(0x11000));
        assert!(found.flags.contains(MincoreFlags::INCORE));
        assert!(!found.flags.contains(MincoreFlags::MODIFIED));
        assert_eq!(found.pa, None);
        assert_eq!(system.mincore(&pmap, va(USER_MAX)), Residency::default());
    }

    #[test]
    fn prefaultable_needs_table_and_empty_slot() {
        let system = stub_system(1);
        let pmap = system.create().unwrap();
        assert!(!system.is_prefaultable(&pmap, va(0x10000)));
        system
            .enter(&pmap, va(0x10000), managed_page(0), VmProt::READ, false)
            .unwrap();
        assert!(!system.is_prefaultable(&pmap, va(0x10000)));
        assert!(system.is_prefaultable(&pmap, va(0x11000)));
        assert!(!system.is_prefaultable(&pmap, va(USER_MAX)));
        system.remove_range(&pmap, va(0x10000), va(0x11000));
        assert!(!system.is_prefaultable(&pmap, va(0x11000)));
        // Kernel tables always exist below the limit.
        let kernel = system.kernel_pmap();
        assert!(system.is_prefaultable(kernel, va(KERNEL_MIN + 0x1000)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn round_trip(
            page in 0u64..(USER_MAX >> 12),
            frame in 0u64..4096,
            offset in 0u64..4096,
            prot_bits in 1u8..8,
            wired in any::<bool>(),
        ) {
            let system = stub_system(1);
            let pmap = system.create().unwrap();
            let addr = va((page << 12) | offset);
            let prot = VmProt::from_bits_truncate(prot_bits);
            let frame = managed_page(frame);
            system.enter(&pmap, addr, frame, prot, wired).unwrap();
            prop_assert_eq!(
                system.extract(&pmap, addr),
                Some(PhysAddr::supervisor(frame.bits() + offset))
            );
            prop_assert_eq!(pmap.wired_count(), wired as u64);
            system.remove_range(&pmap, addr, va(addr.bits() + 1));
            prop_assert_eq!(system.extract(&pmap, addr), None);
            prop_assert_eq!(pmap.resident_count(), 0);
            system.destroy(pmap);
            prop_assert_eq!(system.platform().outstanding(), system.table_pages_in_use());
        }

        #[test]
        fn pv_lists_match_mappings(
            ops in prop::collection::vec((0usize..3, 0u64..16, 0u64..8, any::<bool>()), 1..64)
        ) {
            let system = stub_system(1);
            let pmaps: Vec<_> = (0..3).map(|_| system.create().unwrap()).collect();
            // (pmap, va page) -> frame number, as a model of what should be mapped.
            let mut model = BTreeMap::new();
            for (p, slot, frame, enter) in ops {
                let addr = va(0x10_0000 + slot * 0x1000);
                if enter {
                    system
                        .enter(&pmaps[p], addr, managed_page(frame), VmProt::READ_WRITE, false)
                        .unwrap();
                    model.insert((p, slot), frame);
                } else {
                    system.remove_range(&pmaps[p], addr, va(addr.bits() + 0x1000));
                    model.remove(&(p, slot));
                }
            }
            for frame in 0..8 {
                let page = managed_page(frame);
                let expected = model.values().filter(|f| **f == frame).count();
                prop_assert_eq!(system.page_mappings(page), expected);
                let holders = pmaps
                    .iter()
                    .enumerate()
                    .filter(|(p, _)| model.iter().any(|((mp, _), f)| mp == p && *f == frame))
                    .count();
                let existing = pmaps
                    .iter()
                    .filter(|pmap| system.page_exists_in(pmap, page))
                    .count();
                prop_assert_eq!(existing, holders);
                prop_assert_eq!(system.page_is_mapped(page), expected > 0);
            }
            for (p, pmap) in pmaps.iter().enumerate() {
                let count = model.keys().filter(|(mp, _)| *mp == p).count() as u64;
                prop_assert_eq!(pmap.resident_count(), count);
            }
        }
    }
}
