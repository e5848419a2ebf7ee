// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! TLB coherence for address spaces.
//!
//! A CPU that isn't running in an address space can't hold translations tagged with its ASN, so
//! invalidating there only needs to forget the ASN: the next activation on that CPU assigns a
//! fresh one. Global kernel entries aren't tagged, but the kernel address space is active on
//! every CPU and therefore always flushed directly.

use page_tables::{Pte, PteSlot, TableStore};
use pmap_pages::{PageSize, VirtAddr};

use crate::platform::{CpuId, CpuMask, Platform};
use crate::pmap::{Pmap, PmapInner};
use crate::PmapSystem;

impl<P: Platform> PmapSystem<P> {
    /// Returns the ASN of `pmap` on the current CPU, assigning one if needed.
    pub fn get_asn(&self, pmap: &Pmap) -> u64 {
        self.get_asn_on(pmap, self.current_cpu())
    }

    pub(crate) fn get_asn_on(&self, pmap: &Pmap, cpu: CpuId) -> u64 {
        let mut inner = pmap.lock();
        let mut tracker = self.cpus[cpu.raw()].asn_tracker().lock();
        tracker.get_asn(&mut inner.asn[cpu.raw()], &self.platform)
    }

    /// Invalidates the translation of `va` in `pmap` on every CPU.
    pub fn invalidate_page(&self, pmap: &Pmap, va: VirtAddr) {
        let mut inner = pmap.lock();
        self.invalidate_page_locked(pmap, &mut inner, va);
    }

    /// Invalidates every translation of `pmap` on every CPU.
    pub fn invalidate_all(&self, pmap: &Pmap) {
        let mut inner = pmap.lock();
        self.invalidate_all_locked(pmap, &mut inner);
    }

    /// Writes `pte` to `slot`, which translates `va`. Every entry change that may be cached by a
    /// TLB goes through here so the store is published before the invalidation that follows.
    pub(crate) fn store_pte(
        &self,
        tables: &mut TableStore,
        slot: PteSlot,
        va: VirtAddr,
        pte: Pte,
    ) {
        tables.set_pte(slot, pte);
        self.platform.pte_stored(va);
    }

    /// Marks the ASN of `pmap` stale on the CPUs it isn't active on and returns the CPUs that
    /// need an actual flush.
    fn stale_inactive(&self, pmap: &Pmap, inner: &mut PmapInner) -> CpuMask {
        let active = pmap.active_cpus();
        for (i, asn) in inner.asn.iter_mut().enumerate() {
            if !active.contains(CpuId::new(i)) {
                asn.mark_stale();
            }
        }
        active
    }

    // Runs `flush` on every CPU where `pmap` is active, each followed by an instruction barrier.
    fn flush_active(&self, pmap: &Pmap, inner: &mut PmapInner, flush: &(dyn Fn(&P) + Sync)) {
        let active = self.stale_inactive(pmap, inner);
        let me = self.current_cpu();
        if active.contains(me) {
            flush(&self.platform);
            self.platform.instruction_barrier();
        }
        let others = active.without(me);
        if !others.is_empty() {
            let platform = &self.platform;
            platform.run_on_cpus(others, &|_| {
                flush(platform);
                platform.instruction_barrier();
            });
        }
    }

    /// Must be called after the entry for `va` has been written.
    pub(crate) fn invalidate_page_locked(&self, pmap: &Pmap, inner: &mut PmapInner, va: VirtAddr) {
        self.flush_active(pmap, inner, &|p: &P| p.tlb_invalidate_one(va));
    }

    /// Invalidates the pages of `[start, end)` with one cross-CPU call.
    pub(crate) fn invalidate_range_locked(
        &self,
        pmap: &Pmap,
        inner: &mut PmapInner,
        start: u64,
        end: u64,
    ) {
        self.flush_active(pmap, inner, &|p: &P| {
            for addr in (start..end).step_by(PageSize::Size4k as usize) {
                p.tlb_invalidate_one(VirtAddr::supervisor_virt(addr));
            }
        });
    }

    pub(crate) fn invalidate_all_locked(&self, pmap: &Pmap, inner: &mut PmapInner) {
        self.flush_active(pmap, inner, &|p: &P| p.tlb_invalidate_all());
    }
}
