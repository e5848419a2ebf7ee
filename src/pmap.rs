// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use arrayvec::ArrayVec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use page_tables::TableId;
use pmap_pages::SupervisorPageAddr;
use spin::{Mutex, MutexGuard};

use crate::asn::Asn;
use crate::platform::{CpuId, CpuMask, MAX_CPUS};

/// Identifies an address space for as long as it lives.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(u64);

impl PmapId {
    /// The kernel address space.
    pub const KERNEL: PmapId = PmapId(0);

    pub(crate) const fn new(raw: u64) -> Self {
        PmapId(raw)
    }

    /// Returns the raw value of the ID.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PmapId {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "pmap{}", self.0)
    }
}

/// Mapping counters of an address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmapStats {
    /// Valid leaf mappings.
    pub resident_count: u64,
    /// Of those, the mappings with the wired bit.
    pub wired_count: u64,
}

/// The mutable part of a pmap, guarded by the pmap's lock.
pub(crate) struct PmapInner {
    /// Table pages below the root, keyed by pindex.
    pub ptpages: BTreeMap<usize, TableId>,
    pub stats: PmapStats,
    /// This address space's ASN on each CPU.
    pub asn: ArrayVec<Asn, MAX_CPUS>,
}

impl PmapInner {
    pub fn inc_resident(&mut self, wired: bool) {
        self.stats.resident_count += 1;
        if wired {
            self.stats.wired_count += 1;
        }
    }

    /// Drops one resident mapping. Panics if the counters would go negative.
    pub fn dec_resident(&mut self, wired: bool) {
        self.stats.resident_count = match self.stats.resident_count.checked_sub(1) {
            Some(c) => c,
            None => panic!("resident count underflow"),
        };
        if wired {
            self.dec_wired();
        }
    }

    pub fn inc_wired(&mut self) {
        self.stats.wired_count += 1;
    }

    pub fn dec_wired(&mut self) {
        self.stats.wired_count = match self.stats.wired_count.checked_sub(1) {
            Some(c) => c,
            None => panic!("wired count underflow"),
        };
    }
}

/// A virtual address space: a root table plus the bookkeeping needed to keep the TLBs of the
/// CPUs running in it coherent.
///
/// The root is allocated when the pmap is created and lives until it is destroyed, so it is
/// stored outside the lock. Everything else that changes goes through `inner`.
pub struct Pmap {
    id: PmapId,
    kernel: bool,
    root: TableId,
    root_frame: SupervisorPageAddr,
    active: AtomicU64,
    inner: Mutex<PmapInner>,
}

impl Pmap {
    pub(crate) fn new(
        id: PmapId,
        kernel: bool,
        root: TableId,
        root_frame: SupervisorPageAddr,
        num_cpus: usize,
    ) -> Self {
        let asn = (0..num_cpus).map(|_| Asn::default()).collect();
        Self {
            id,
            kernel,
            root,
            root_frame,
            active: AtomicU64::new(0),
            inner: Mutex::new(PmapInner {
                ptpages: BTreeMap::new(),
                stats: PmapStats::default(),
                asn,
            }),
        }
    }

    pub fn id(&self) -> PmapId {
        self.id
    }

    /// Returns true for the kernel address space.
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub(crate) fn root(&self) -> TableId {
        self.root
    }

    /// Returns the frame holding the root table, as loaded into the hardware walker.
    pub fn root_frame(&self) -> SupervisorPageAddr {
        self.root_frame
    }

    /// Returns the CPUs currently running in this address space.
    pub fn active_cpus(&self) -> CpuMask {
        CpuMask::from_bits(self.active.load(Ordering::Acquire))
    }

    pub(crate) fn set_active_cpus(&self, mask: CpuMask) {
        self.active.store(mask.bits(), Ordering::Release);
    }

    pub(crate) fn mark_active(&self, cpu: CpuId) {
        self.active
            .fetch_or(CpuMask::single(cpu).bits(), Ordering::AcqRel);
    }

    pub(crate) fn mark_inactive(&self, cpu: CpuId) {
        self.active
            .fetch_and(!CpuMask::single(cpu).bits(), Ordering::AcqRel);
    }

    pub(crate) fn lock(&self) -> MutexGuard<PmapInner> {
        self.inner.lock()
    }

    /// Returns a snapshot of the mapping counters.
    pub fn stats(&self) -> PmapStats {
        self.inner.lock().stats
    }

    /// Returns the number of valid mappings.
    pub fn resident_count(&self) -> u64 {
        self.stats().resident_count
    }

    /// Returns the number of wired mappings.
    pub fn wired_count(&self) -> u64 {
        self.stats().wired_count
    }

    /// Returns the number of table pages below the root.
    pub fn table_pages(&self) -> usize {
        self.inner.lock().ptpages.len()
    }

    /// Returns this address space's ASN assignment on `cpu`.
    pub fn asn_on(&self, cpu: CpuId) -> Option<Asn> {
        self.inner.lock().asn.get(cpu.raw()).copied()
    }
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .field("root", &self.root_frame)
            .field("active", &self.active_cpus())
            .finish()
    }
}
