// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info};
use page_tables::level::{
    ENTRIES_PER_TABLE, KERNEL_L1_FIRST, KERNEL_MAX, KERNEL_MIN, L2_SPAN, VPT_L1_INDEX,
};
use page_tables::{Level, PteSlot, TableStore};
use page_tracking::{HwMemMap, PageTracker};
use pmap_pages::{PageSize, SupervisorPageAddr, VirtAddr};
use spin::Mutex;

use crate::config::{ConfigError, PmapConfig};
use crate::cpu::PerCpu;
use crate::platform::{CpuId, CpuMask, Platform, MAX_CPUS};
use crate::pmap::{Pmap, PmapId};
use crate::ptpage::TablePrealloc;
use crate::pv::PvIndex;

/// Errors returned by pmap operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page allocator couldn't supply a table page, or bookkeeping couldn't be allocated.
    OutOfMemory,
    /// The address can't be mapped in this address space.
    AddressOutOfRange(VirtAddr),
    /// No kernel table covers the address; the kernel must be grown first.
    KernelTableMissing(VirtAddr),
    /// Nothing is mapped at the address.
    NotMapped(VirtAddr),
    /// The mapping doesn't allow the attempted access.
    ProtectionViolation(VirtAddr),
    /// The configuration was rejected.
    InvalidConfig(ConfigError),
    /// The page isn't tracked by the reverse map.
    UnmanagedPage(SupervisorPageAddr),
}

/// Holds the result of pmap operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The pmap layer of one machine: every address space, the table pages backing them, the
/// reverse map and the per-CPU TLB state.
///
/// Locks are always taken in the order: kernel growth, reverse map, live pmap list, an
/// individual pmap, table store, page tracker. Per-CPU ASN trackers come after the pmap lock.
/// Table pages are allocated before any of the locks after the growth lock are held.
pub struct PmapSystem<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: PmapConfig,
    pub(crate) cpus: ArrayVec<PerCpu, MAX_CPUS>,
    pub(crate) pages: PageTracker,
    pub(crate) pv: Mutex<PvIndex>,
    // Every live pmap, the kernel's included.
    pub(crate) live: Mutex<BTreeMap<PmapId, Arc<Pmap>>>,
    pub(crate) tables: Mutex<TableStore>,
    pub(crate) kernel: Arc<Pmap>,
    // End of the kernel range covered by tables. Also serializes kernel growth.
    pub(crate) kernel_end: Mutex<u64>,
    next_id: AtomicU64,
}

impl<P: Platform> PmapSystem<P> {
    /// Sets up the kernel address space and the per-CPU state, then grows the kernel range to
    /// the configured initial limit. Pages in the managed regions of `mem_map` are tracked by the
    /// reverse map.
    pub fn bootstrap(platform: P, config: PmapConfig, mem_map: &HwMemMap) -> Result<Self> {
        let pages = PageTracker::new(mem_map).map_err(|_| Error::OutOfMemory)?;
        let num_cpus = config.num_cpus();
        let frame = platform.alloc_zeroed_page().ok_or(Error::OutOfMemory)?;
        let mut tables = TableStore::new();
        let root = match tables.insert(frame, Level::L1, None) {
            Ok(root) => root,
            Err(_) => {
                platform.free_page(frame);
                return Err(Error::OutOfMemory);
            }
        };
        tables.install_table(
            PteSlot {
                table: root,
                index: VPT_L1_INDEX,
            },
            root,
        );
        let kernel = Arc::new(Pmap::new(PmapId::KERNEL, true, root, frame, num_cpus));
        kernel.set_active_cpus(CpuMask::first(num_cpus));

        let cpus = (0..num_cpus)
            .map(|i| PerCpu::new(CpuId::new(i), config.max_asn()))
            .collect();
        let mut live = BTreeMap::new();
        live.insert(PmapId::KERNEL, kernel.clone());

        let system = Self {
            platform,
            config,
            cpus,
            pages,
            pv: Mutex::new(PvIndex::new()),
            live: Mutex::new(live),
            tables: Mutex::new(tables),
            kernel,
            kernel_end: Mutex::new(KERNEL_MIN),
            next_id: AtomicU64::new(PmapId::KERNEL.raw() + 1),
        };
        system.grow_kernel(VirtAddr::supervisor_virt(config.kernel_initial_limit()))?;
        info!(
            "pmap: kernel root at {:?}, {} CPUs, {} managed pages",
            frame,
            num_cpus,
            system.pages.num_pages()
        );
        Ok(system)
    }

    /// Returns the platform the system runs on.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &PmapConfig {
        &self.config
    }

    /// Returns the kernel address space.
    pub fn kernel_pmap(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    /// Returns the tracker holding the software state of managed pages.
    pub fn page_tracker(&self) -> &PageTracker {
        &self.pages
    }

    /// Returns the per-CPU state of `cpu`.
    pub fn per_cpu(&self, cpu: CpuId) -> Option<&PerCpu> {
        self.cpus.get(cpu.raw())
    }

    pub(crate) fn current_cpu(&self) -> CpuId {
        let cpu = self.platform.current_cpu();
        if cpu.raw() >= self.cpus.len() {
            panic!("running on unconfigured CPU {}", cpu.raw());
        }
        cpu
    }

    /// Returns the number of live address spaces, the kernel's included.
    pub fn live_pmaps(&self) -> usize {
        self.live.lock().len()
    }

    /// Returns the number of table pages in use across all address spaces, roots included.
    pub fn table_pages_in_use(&self) -> usize {
        self.tables.lock().len()
    }

    /// Returns the end of the kernel range currently backed by tables.
    pub fn kernel_limit(&self) -> VirtAddr {
        VirtAddr::supervisor_virt(*self.kernel_end.lock())
    }

    /// Creates an empty user address space. Its root maps itself at the VPT slot and shares the
    /// kernel's upper-level entries.
    pub fn create(&self) -> Result<Arc<Pmap>> {
        let frame = self.alloc_table_frame()?;
        let id = PmapId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        // Holding the live list keeps kernel growth from slipping in between the copy of the
        // kernel entries and the new pmap becoming visible to it.
        let mut live = self.live.lock();
        let mut tables = self.tables.lock();
        let root = match tables.insert(frame, Level::L1, None) {
            Ok(root) => root,
            Err(_) => {
                drop(tables);
                drop(live);
                self.platform.free_page(frame);
                return Err(Error::OutOfMemory);
            }
        };
        for index in KERNEL_L1_FIRST..ENTRIES_PER_TABLE {
            let pte = tables.page(self.kernel.root()).entry(index);
            if pte.valid() {
                tables.page_mut(root).set_entry(index, pte);
            }
        }
        tables.install_table(
            PteSlot {
                table: root,
                index: VPT_L1_INDEX,
            },
            root,
        );
        let pmap = Arc::new(Pmap::new(id, false, root, frame, self.cpus.len()));
        live.insert(id, pmap.clone());
        debug!("created {:?} with root {:?}", id, frame);
        Ok(pmap)
    }

    /// Tears down an address space whose mappings have all been removed. Panics if any table
    /// page or mapping is left, or if a CPU is still running in it.
    pub fn destroy(&self, pmap: Arc<Pmap>) {
        if pmap.is_kernel() {
            panic!("destroying the kernel pmap");
        }
        let mut live = self.live.lock();
        {
            let inner = pmap.lock();
            if !inner.ptpages.is_empty() {
                panic!(
                    "destroying {:?} with {} table pages left",
                    pmap.id(),
                    inner.ptpages.len()
                );
            }
            if inner.stats.resident_count != 0 {
                panic!(
                    "destroying {:?} with {} resident mappings",
                    pmap.id(),
                    inner.stats.resident_count
                );
            }
        }
        if !pmap.active_cpus().is_empty() {
            panic!(
                "destroying {:?} while active on {:?}",
                pmap.id(),
                pmap.active_cpus()
            );
        }
        let mut tables = self.tables.lock();
        let root = tables.page_mut(pmap.root());
        for index in VPT_L1_INDEX..ENTRIES_PER_TABLE {
            root.set_entry(index, page_tables::Pte::invalid());
        }
        // Panics if a user L1 entry survived.
        let frame = tables.remove(pmap.root());
        live.remove(&pmap.id());
        drop(tables);
        drop(live);
        self.platform.free_page(frame);
        debug!("destroyed {:?}", pmap.id());
    }

    /// Extends table coverage of the kernel range up to `new_limit`, rounded up to a whole L3
    /// table. New L1 entries are copied into the root of every live address space so kernel
    /// mappings are visible everywhere; L2 tables are shared, so entries added to them need no
    /// propagation. Returns the new limit.
    ///
    /// On `OutOfMemory` the tables created before the failure are kept.
    pub fn grow_kernel(&self, new_limit: VirtAddr) -> Result<VirtAddr> {
        let mut end = self.kernel_end.lock();
        if new_limit.bits() > KERNEL_MAX {
            return Err(Error::AddressOutOfRange(new_limit));
        }
        let target = PageSize::Size2M.round_up(new_limit.bits().max(KERNEL_MIN));
        if target <= *end {
            return Ok(VirtAddr::supervisor_virt(*end));
        }
        let start = *end;
        let mut result = Ok(());
        while *end < target {
            let va = VirtAddr::supervisor_virt(*end);
            let mut prealloc = TablePrealloc::new();
            let needed = {
                let tables = self.tables.lock();
                crate::ptpage::missing_levels(&tables, self.kernel.root(), va)
            };
            if let Err(e) = self.prealloc_tables(&mut prealloc, needed) {
                result = Err(e);
                break;
            }
            let step = {
                let live = self.live.lock();
                let mut inner = self.kernel.lock();
                let mut tables = self.tables.lock();
                self.grow_kernel_step(&live, &mut inner, &mut tables, &mut prealloc, va)
            };
            self.return_prealloc(prealloc);
            if let Err(e) = step {
                result = Err(e);
                break;
            }
            *end += L2_SPAN;
        }
        if *end > start {
            self.invalidate_all(&self.kernel);
            info!("kernel grown from {:#x} to {:#x}", start, *end);
        }
        result.map(|_| VirtAddr::supervisor_virt(*end))
    }

    /// Makes `pmap` the address space of the current CPU: assigns it an ASN there and loads its
    /// root and ASN into the hardware. The previously active user address space is deactivated.
    pub fn activate(&self, pmap: &Arc<Pmap>) {
        let cpu = self.current_cpu();
        let prev = self.cpus[cpu.raw()].swap_active(Some(pmap.clone()));
        if let Some(prev) = prev {
            if !prev.is_kernel() && prev.id() != pmap.id() {
                prev.mark_inactive(cpu);
            }
        }
        pmap.mark_active(cpu);
        let asn = self.get_asn_on(pmap, cpu);
        self.platform.set_active_table_root(pmap.root_frame());
        self.platform.set_asn(asn);
    }

    /// Stops the current CPU from running in `pmap`. The kernel address space stays active
    /// everywhere.
    pub fn deactivate(&self, pmap: &Arc<Pmap>) {
        if pmap.is_kernel() {
            return;
        }
        let cpu = self.current_cpu();
        let percpu = &self.cpus[cpu.raw()];
        match percpu.swap_active(None) {
            Some(cur) if cur.id() != pmap.id() => {
                percpu.swap_active(Some(cur));
            }
            _ => (),
        }
        pmap.mark_inactive(cpu);
    }
}
