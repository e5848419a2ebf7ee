// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A simulated machine for unit tests: a frame pool that counts allocations and can be made to
//! run dry, per-CPU logs of TLB operations, a global event order and a synchronous cross-CPU call.

use core::sync::atomic::{AtomicUsize, Ordering};
use page_tracking::HwMemMapBuilder;
use pmap_pages::{PageSize, RawAddr, SupervisorPageAddr, VirtAddr};
use spin::Mutex;
use std::collections::BTreeSet;
use std::vec::Vec;

pub use crate::platform::*;
use crate::{PmapConfigBuilder, PmapSystem};

/// Base of the managed RAM in `stub_system`.
pub const RAM_BASE: u64 = 0x8000_0000;
/// Size of the managed RAM in `stub_system`.
pub const RAM_SIZE: u64 = 0x100_0000;
/// An MMIO page, mapped unmanaged.
pub const MMIO_BASE: u64 = 0x1000_0000;
// Table frames come from outside the managed RAM.
const FRAME_POOL_BASE: u64 = 0x1_0000_0000;

struct FramePool {
    next: u64,
    free: Vec<u64>,
    live: BTreeSet<u64>,
    allocs: usize,
    frees: usize,
    fail_after: Option<usize>,
}

/// What one simulated CPU was asked to do.
#[derive(Clone, Debug, Default)]
pub struct SimCpuLog {
    pub invalidated: Vec<VirtAddr>,
    pub flush_all: usize,
    pub root: Option<SupervisorPageAddr>,
    pub asn: Option<u64>,
    pub barriers: usize,
}

/// Entry stores and TLB operations in the order they happened across all CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimEvent {
    PteStored(VirtAddr),
    Invalidate { cpu: usize, va: VirtAddr },
    FlushAll { cpu: usize },
}

pub struct SimPlatform {
    frames: Mutex<FramePool>,
    cpus: Vec<Mutex<SimCpuLog>>,
    events: Mutex<Vec<SimEvent>>,
    current: AtomicUsize,
}

impl SimPlatform {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            frames: Mutex::new(FramePool {
                next: FRAME_POOL_BASE,
                free: Vec::new(),
                live: BTreeSet::new(),
                allocs: 0,
                frees: 0,
                fail_after: None,
            }),
            cpus: (0..num_cpus).map(|_| Mutex::new(SimCpuLog::default())).collect(),
            events: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
        }
    }

    /// Number of successful allocations so far.
    pub fn allocs(&self) -> usize {
        self.frames.lock().allocs
    }

    /// Number of frees so far.
    pub fn frees(&self) -> usize {
        self.frames.lock().frees
    }

    /// Frames allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.frames.lock().live.len()
    }

    /// Lets `n` more allocations succeed, failing the ones after.
    pub fn fail_after(&self, n: usize) {
        self.frames.lock().fail_after = Some(n);
    }

    pub fn clear_failure(&self) {
        self.frames.lock().fail_after = None;
    }

    pub fn set_current_cpu(&self, cpu: usize) {
        assert!(cpu < self.cpus.len());
        self.current.store(cpu, Ordering::SeqCst);
    }

    pub fn cpu_log(&self, cpu: usize) -> SimCpuLog {
        self.cpus[cpu].lock().clone()
    }

    pub fn reset_logs(&self) {
        for cpu in self.cpus.iter() {
            *cpu.lock() = SimCpuLog::default();
        }
        self.events.lock().clear();
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn log(&self) -> spin::MutexGuard<SimCpuLog> {
        self.cpus[self.current()].lock()
    }
}

impl PageAllocator for SimPlatform {
    fn alloc_zeroed_page(&self) -> Option<SupervisorPageAddr> {
        let mut pool = self.frames.lock();
        if let Some(n) = pool.fail_after {
            if n == 0 {
                return None;
            }
            pool.fail_after = Some(n - 1);
        }
        let addr = match pool.free.pop() {
            Some(addr) => addr,
            None => {
                let addr = pool.next;
                pool.next += PageSize::Size4k as u64;
                addr
            }
        };
        pool.live.insert(addr);
        pool.allocs += 1;
        SupervisorPageAddr::supervisor(addr)
    }

    fn free_page(&self, page: SupervisorPageAddr) {
        let mut pool = self.frames.lock();
        if !pool.live.remove(&page.bits()) {
            panic!("double free of {:?}", page);
        }
        pool.free.push(page.bits());
        pool.frees += 1;
    }
}

impl TlbOps for SimPlatform {
    fn tlb_invalidate_one(&self, va: VirtAddr) {
        self.log().invalidated.push(va);
        let cpu = self.current();
        self.events.lock().push(SimEvent::Invalidate { cpu, va });
    }

    fn tlb_invalidate_all(&self) {
        self.log().flush_all += 1;
        let cpu = self.current();
        self.events.lock().push(SimEvent::FlushAll { cpu });
    }

    fn set_active_table_root(&self, root: SupervisorPageAddr) {
        self.log().root = Some(root);
    }

    fn set_asn(&self, asn: u64) {
        self.log().asn = Some(asn);
    }

    fn instruction_barrier(&self) {
        self.log().barriers += 1;
    }

    fn pte_stored(&self, va: VirtAddr) {
        self.events.lock().push(SimEvent::PteStored(va));
    }
}

impl CpuSignal for SimPlatform {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(self.current.load(Ordering::SeqCst))
    }

    fn run_on_cpus(&self, mask: CpuMask, f: &(dyn Fn(CpuId) + Sync)) {
        let caller = self.current.load(Ordering::SeqCst);
        for cpu in mask.iter() {
            self.current.store(cpu.raw(), Ordering::SeqCst);
            f(cpu);
        }
        self.current.store(caller, Ordering::SeqCst);
    }
}

/// Returns the `n`th managed page.
pub fn managed_page(n: u64) -> SupervisorPageAddr {
    assert!(n < RAM_SIZE / PageSize::Size4k as u64);
    SupervisorPageAddr::supervisor(RAM_BASE + n * PageSize::Size4k as u64).unwrap()
}

/// Returns a device page that isn't managed.
pub fn mmio_page() -> SupervisorPageAddr {
    SupervisorPageAddr::supervisor(MMIO_BASE).unwrap()
}

/// Builds a system of `num_cpus` CPUs with 16MB of managed RAM and one MMIO page.
pub fn stub_system(num_cpus: usize) -> PmapSystem<SimPlatform> {
    stub_system_with_max_asn(num_cpus, crate::config::DEFAULT_MAX_ASN)
}

pub fn stub_system_with_max_asn(num_cpus: usize, max_asn: u64) -> PmapSystem<SimPlatform> {
    let mem_map = HwMemMapBuilder::new(PageSize::Size4k as u64)
        .add_memory_region(RawAddr::supervisor(RAM_BASE), RAM_SIZE)
        .unwrap()
        .add_mmio_region(RawAddr::supervisor(MMIO_BASE), PageSize::Size4k as u64)
        .unwrap()
        .build();
    let config = PmapConfigBuilder::new(num_cpus)
        .max_asn(max_asn)
        .build()
        .unwrap();
    PmapSystem::bootstrap(SimPlatform::new(num_cpus), config, &mem_map).unwrap()
}
