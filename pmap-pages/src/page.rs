// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use crate::{AddressSpace, SupervisorPhys, SupervisorVirt};

/// Shift from an address to its page frame number.
pub const PFN_SHIFT: u64 = 12;
// Physical addresses are at most 56 bits wide.
const PFN_MASK: u64 = (1 << 44) - 1;

/// Bytes covered by one entry at each level of the translation tree: an L3 entry maps a 4kB page,
/// an L2 entry spans 2MB and an L1 entry 1GB.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PageSize {
    Size4k = 1 << 12,
    Size2M = 1 << 21,
    Size1G = 1 << 30,
}

impl PageSize {
    fn mask(self) -> u64 {
        self as u64 - 1
    }

    pub fn is_aligned(self, val: u64) -> bool {
        val & self.mask() == 0
    }

    /// Rounds `val` up to a multiple of this size. Saturates to the last aligned value instead of
    /// wrapping.
    pub fn round_up(self, val: u64) -> u64 {
        match val.checked_add(self.mask()) {
            Some(v) => v & !self.mask(),
            None => u64::MAX & !self.mask(),
        }
    }

    pub fn round_down(self, val: u64) -> u64 {
        val & !self.mask()
    }

    /// Returns the offset of `val` within a page of this size.
    pub fn offset_of(self, val: u64) -> u64 {
        val & self.mask()
    }
}

/// A byte address in the address space `AS`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RawAddr<AS: AddressSpace> {
    bits: u64,
    space: AS,
}

/// A physical address.
pub type PhysAddr = RawAddr<SupervisorPhys>;
/// A virtual address.
pub type VirtAddr = RawAddr<SupervisorVirt>;

impl<AS: AddressSpace> RawAddr<AS> {
    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn address_space(&self) -> AS {
        self.space
    }

    /// Returns the offset of this address within its 4kB page.
    pub fn page_offset(&self) -> u64 {
        PageSize::Size4k.offset_of(self.bits)
    }
}

impl PhysAddr {
    pub fn supervisor(bits: u64) -> Self {
        Self {
            bits,
            space: SupervisorPhys,
        }
    }
}

impl VirtAddr {
    pub fn supervisor_virt(bits: u64) -> Self {
        Self {
            bits,
            space: SupervisorVirt,
        }
    }
}

impl<AS: AddressSpace> fmt::Debug for RawAddr<AS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:#x}", AS::NAME, self.bits)
    }
}

/// A 4kB-aligned address in the address space `AS`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageAddr<AS: AddressSpace>(RawAddr<AS>);

/// The address of a physical frame.
pub type SupervisorPageAddr = PageAddr<SupervisorPhys>;

impl<AS: AddressSpace> PageAddr<AS> {
    /// Returns `None` unless `addr` is 4kB aligned.
    pub fn new(addr: RawAddr<AS>) -> Option<Self> {
        PageSize::Size4k.is_aligned(addr.bits).then_some(Self(addr))
    }

    /// Returns the page containing `addr`, rounding down to `size`.
    pub fn with_round_down(addr: RawAddr<AS>, size: PageSize) -> Self {
        Self(RawAddr {
            bits: size.round_down(addr.bits),
            space: addr.space,
        })
    }

    pub fn from_pfn(pfn: Pfn<AS>) -> Self {
        Self(RawAddr {
            bits: pfn.bits << PFN_SHIFT,
            space: pfn.space,
        })
    }

    pub fn bits(&self) -> u64 {
        self.0.bits
    }

    pub fn is_aligned(&self, size: PageSize) -> bool {
        size.is_aligned(self.0.bits)
    }

    pub fn pfn(&self) -> Pfn<AS> {
        Pfn {
            bits: (self.0.bits >> PFN_SHIFT) & PFN_MASK,
            space: self.0.space,
        }
    }

    /// Linear page number counted from address 0, used to index per-page tables.
    pub fn index(&self) -> usize {
        self.pfn().bits as usize
    }
}

impl SupervisorPageAddr {
    pub fn supervisor(bits: u64) -> Option<Self> {
        Self::new(PhysAddr::supervisor(bits))
    }
}

impl<AS: AddressSpace> From<PageAddr<AS>> for RawAddr<AS> {
    fn from(page: PageAddr<AS>) -> Self {
        page.0
    }
}

impl<AS: AddressSpace> fmt::Debug for PageAddr<AS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A page frame number, as stored in translation entries.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pfn<AS: AddressSpace> {
    bits: u64,
    space: AS,
}

/// The frame number of a physical page.
pub type SupervisorPfn = Pfn<SupervisorPhys>;

impl<AS: AddressSpace> Pfn<AS> {
    pub fn bits(&self) -> u64 {
        self.bits
    }
}

impl SupervisorPfn {
    pub fn supervisor(bits: u64) -> Self {
        Self {
            bits,
            space: SupervisorPhys,
        }
    }
}

impl<AS: AddressSpace> fmt::Debug for Pfn<AS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pfn:{:#x}", self.bits)
    }
}
