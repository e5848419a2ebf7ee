// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use pmap_pages::{SupervisorPageAddr, VirtAddr};
use static_assertions::const_assert;

/// Upper bound on the number of CPUs; one bit each in a `CpuMask`.
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= u64::BITS as usize);

/// Identifies a CPU by its logical index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuId(usize);

impl CpuId {
    /// Creates a `CpuId` from the raw index.
    pub const fn new(raw: usize) -> Self {
        CpuId(raw)
    }

    /// Returns the raw value of the CPU ID.
    pub fn raw(&self) -> usize {
        self.0
    }
}

/// A set of CPUs.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        CpuMask(0)
    }

    /// Returns the mask of the first `num_cpus` CPUs.
    pub fn first(num_cpus: usize) -> Self {
        if num_cpus >= MAX_CPUS {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1 << num_cpus) - 1)
        }
    }

    pub fn single(cpu: CpuId) -> Self {
        CpuMask(1 << cpu.raw())
    }

    pub const fn from_bits(bits: u64) -> Self {
        CpuMask(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.raw()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns this set without `cpu`.
    pub fn without(self, cpu: CpuId) -> Self {
        CpuMask(self.0 & !(1 << cpu.raw()))
    }

    /// Iterates over the CPUs in the set in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> {
        let bits = self.0;
        (0..MAX_CPUS)
            .filter(move |i| bits & (1 << i) != 0)
            .map(CpuId::new)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// The physical page allocator underneath the pmap. Table pages come from here.
pub trait PageAllocator {
    /// Returns a zero-filled page, or `None` if memory is exhausted.
    fn alloc_zeroed_page(&self) -> Option<SupervisorPageAddr>;

    /// Returns a page obtained from `alloc_zeroed_page`.
    fn free_page(&self, page: SupervisorPageAddr);
}

/// Translation hardware of the CPU executing the call.
pub trait TlbOps {
    /// Drops any cached translation of `va` for the current ASN, and global translations of it.
    fn tlb_invalidate_one(&self, va: VirtAddr);

    /// Drops every cached translation.
    fn tlb_invalidate_all(&self);

    /// Points the hardware walker at a new root table.
    fn set_active_table_root(&self, root: SupervisorPageAddr);

    /// Sets the ASN tagging new translations.
    fn set_asn(&self, asn: u64);

    /// Orders instruction fetch after prior translation changes.
    fn instruction_barrier(&self);

    /// Called after the entry translating `va` has been rewritten and before any invalidation of
    /// `va` is issued. Platforms whose walker doesn't snoop stores to table memory fence here.
    fn pte_stored(&self, _va: VirtAddr) {}
}

/// CPU identity and cross-CPU calls.
pub trait CpuSignal {
    /// Returns the CPU executing the caller.
    fn current_cpu(&self) -> CpuId;

    /// Runs `f` on every CPU in `mask` and returns once all of them have completed it.
    fn run_on_cpus(&self, mask: CpuMask, f: &(dyn Fn(CpuId) + Sync));
}

/// Everything the pmap needs from the machine it runs on.
pub trait Platform: PageAllocator + TlbOps + CpuSignal + Send + Sync {}

impl<T: PageAllocator + TlbOps + CpuSignal + Send + Sync> Platform for T {}
