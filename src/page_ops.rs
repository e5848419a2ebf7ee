// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Operations on a physical page across every address space mapping it, driven by the reverse
//! map.

use page_tables::{PteFieldBit, PteSlot, TableStore};
use page_tracking::PageAttrs;
use pmap_pages::{SupervisorPageAddr, VirtAddr, VmProt};

use crate::mapping::fault_on_all;
use crate::platform::Platform;
use crate::pmap::{Pmap, PmapInner};
use crate::{Error, PmapSystem, Result};

impl<P: Platform> PmapSystem<P> {
    /// Calls `f` with the leaf entry of every mapping of `page`.
    fn for_each_mapping<F>(&self, page: SupervisorPageAddr, mut f: F)
    where
        F: FnMut(&Pmap, &mut PmapInner, &mut TableStore, PteSlot, VirtAddr),
    {
        let pv = self.pv.lock();
        let live = self.live.lock();
        for (_, entry) in pv.page_iter(page) {
            let pmap = match live.get(&entry.pmap()) {
                Some(p) => p,
                None => panic!("{:?} maps {:?} but isn't live", entry.pmap(), page),
            };
            let mut inner = pmap.lock();
            let mut tables = self.tables.lock();
            let slot = match tables.lookup_l3(pmap.root(), entry.va()) {
                Some(slot) => slot,
                None => panic!("no table for {:?} in {:?}", entry.va(), pmap.id()),
            };
            f(pmap, &mut inner, &mut tables, slot, entry.va());
        }
    }

    /// Removes every mapping of `page`.
    pub fn remove_all(&self, page: SupervisorPageAddr) {
        let mut pv = self.pv.lock();
        let live = self.live.lock();
        while let Some(id) = pv.first_of_page(page) {
            let (pmap_id, va) = match pv.get(id) {
                Some(entry) => (entry.pmap(), entry.va()),
                None => panic!("dangling reverse-map head for {:?}", page),
            };
            let pmap = match live.get(&pmap_id) {
                Some(p) => p,
                None => panic!("{:?} maps {:?} but isn't live", pmap_id, page),
            };
            let mut inner = pmap.lock();
            let mut tables = self.tables.lock();
            let slot = match tables.lookup_l3(pmap.root(), va) {
                Some(slot) => slot,
                None => panic!("no table for {:?} in {:?}", va, pmap_id),
            };
            self.remove_pte_locked(&mut pv, pmap, &mut inner, &mut tables, slot, va);
            self.invalidate_page_locked(pmap, &mut inner, va);
        }
    }

    /// Strips write permission from every mapping of `page`. The fault-on-write bit is set again
    /// so a later upgrade still traps on the first write.
    pub fn remove_write(&self, page: SupervisorPageAddr) {
        self.for_each_mapping(page, |pmap, inner, tables, slot, va| {
            let mut pte = tables.pte(slot);
            if pte.writable() {
                pte.clear_write();
                pte.set_fault_bits(PteFieldBit::FaultOnWrite.mask());
                self.store_pte(tables, slot, va, pte);
                self.invalidate_page_locked(pmap, inner, va);
            }
        });
        if self.pages.is_managed(page) {
            self.clear_page_attrs(page, PageAttrs::WRITEABLE);
        }
    }

    /// Lowers the access every mapping of `page` allows to `prot`: without read access all
    /// mappings go, without write access they become read-only.
    pub fn page_protect(&self, page: SupervisorPageAddr, prot: VmProt) -> Result<()> {
        if !self.pages.is_managed(page) {
            return Err(Error::UnmanagedPage(page));
        }
        if !prot.contains(VmProt::READ) {
            self.remove_all(page);
        } else if !prot.contains(VmProt::WRITE) {
            self.remove_write(page);
        }
        Ok(())
    }

    fn page_has(&self, page: SupervisorPageAddr, attrs: PageAttrs) -> bool {
        self.pages
            .attrs(page)
            .map(|a| a.contains(attrs))
            .unwrap_or(false)
    }

    /// Returns true if `page` has been written through any mapping since its modified state
    /// was last cleared.
    pub fn is_modified(&self, page: SupervisorPageAddr) -> bool {
        self.page_has(page, PageAttrs::MODIFIED)
    }

    /// Returns true if `page` has been accessed through any mapping since its referenced state
    /// was last cleared.
    pub fn is_referenced(&self, page: SupervisorPageAddr) -> bool {
        self.page_has(page, PageAttrs::REFERENCED)
    }

    /// Forgets that `page` was modified and re-arms fault-on-write on all of its mappings.
    pub fn clear_modified(&self, page: SupervisorPageAddr) {
        if !self.is_modified(page) {
            return;
        }
        self.for_each_mapping(page, |pmap, inner, tables, slot, va| {
            let mut pte = tables.pte(slot);
            if !pte.is_set(PteFieldBit::FaultOnWrite) {
                pte.set_fault_bits(PteFieldBit::FaultOnWrite.mask());
                self.store_pte(tables, slot, va, pte);
                self.invalidate_page_locked(pmap, inner, va);
            }
        });
        self.clear_page_attrs(page, PageAttrs::MODIFIED);
    }

    /// Forgets that `page` was referenced and re-arms all fault-on bits of its mappings.
    /// Returns how many mappings had been referenced.
    pub fn clear_reference(&self, page: SupervisorPageAddr) -> usize {
        if !self.is_referenced(page) {
            return 0;
        }
        let mut count = 0;
        self.for_each_mapping(page, |pmap, inner, tables, slot, va| {
            let mut pte = tables.pte(slot);
            if pte.referenced() {
                count += 1;
            }
            if pte.bits() & fault_on_all() != fault_on_all() {
                pte.set_fault_bits(fault_on_all());
                self.store_pte(tables, slot, va, pte);
                self.invalidate_page_locked(pmap, inner, va);
            }
        });
        self.clear_page_attrs(page, PageAttrs::REFERENCED);
        count
    }

    /// Returns true if `pmap` maps `page` anywhere.
    pub fn page_exists_in(&self, pmap: &Pmap, page: SupervisorPageAddr) -> bool {
        self.pv
            .lock()
            .page_iter(page)
            .any(|(_, entry)| entry.pmap() == pmap.id())
    }

    /// Returns true if `page` has any managed mapping.
    pub fn page_is_mapped(&self, page: SupervisorPageAddr) -> bool {
        self.page_has(page, PageAttrs::MAPPED)
    }

    /// Returns the number of mappings of `page`.
    pub fn page_mappings(&self, page: SupervisorPageAddr) -> usize {
        self.pv.lock().page_count(page)
    }

    /// Returns the number of wired mappings of `page`.
    pub fn page_wired_mappings(&self, page: SupervisorPageAddr) -> usize {
        let mut count = 0;
        self.for_each_mapping(page, |_, _, tables, slot, _| {
            if tables.pte(slot).is_wired() {
                count += 1;
            }
        });
        count
    }
}
