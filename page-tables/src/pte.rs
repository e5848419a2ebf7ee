// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use pmap_pages::{Pfn, SupervisorPfn, VmProt};
use static_assertions::const_assert;

// Wide enough for any 56-bit physical address.
const PFN_BITS: u64 = 44;
const PFN_MASK: u64 = (1 << PFN_BITS) - 1;
// The frame number sits above the status bits and runs to the top of the entry.
const PFN_SHIFT: u64 = 20;
const_assert!(PFN_SHIFT + PFN_BITS == u64::BITS as u64);

/// Bits of a translation entry.
#[derive(Copy, Clone, Debug)]
pub enum PteFieldBit {
    Valid = 0,
    FaultOnRead = 1,
    FaultOnWrite = 2,
    FaultOnExecute = 3,
    /// Address space match: the entry is valid in every address space.
    Global = 4,
    KernelRead = 8,
    UserRead = 9,
    KernelWrite = 12,
    UserWrite = 13,
    /// Software: the mapping is wired.
    Wired = 16,
    /// Software: the target frame is tracked by the reverse map.
    Managed = 17,
}

impl PteFieldBit {
    pub const fn shift(&self) -> u64 {
        *self as u64
    }

    pub const fn mask(&self) -> u64 {
        1 << self.shift()
    }

    pub const fn is_set(&self, val: u64) -> bool {
        val & self.mask() != 0
    }
}

const_assert!(PteFieldBit::Managed.shift() < PFN_SHIFT);

const READ_MASK: u64 = PteFieldBit::KernelRead.mask() | PteFieldBit::UserRead.mask();
const WRITE_MASK: u64 = PteFieldBit::KernelWrite.mask() | PteFieldBit::UserWrite.mask();
const FAULT_MASK: u64 = PteFieldBit::FaultOnRead.mask()
    | PteFieldBit::FaultOnWrite.mask()
    | PteFieldBit::FaultOnExecute.mask();

/// The status bits that define PTE state, without the frame number.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct PteFieldBits {
    bits: u64,
}

impl PteFieldBits {
    /// Returns the raw bits that make up the PTE status.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Sets the given bit.
    pub fn set_bit(&mut self, bit: PteFieldBit) {
        self.bits |= bit.mask();
    }

    /// Returns the status with `bit` set.
    pub fn with(mut self, bit: PteFieldBit) -> Self {
        self.set_bit(bit);
        self
    }

    /// Returns the status with all three fault-on bits set.
    pub fn with_fault_on_all(mut self) -> Self {
        self.bits |= FAULT_MASK;
        self
    }

    /// Translates `prot` into permission bits. Kernel mappings only get the supervisor bits;
    /// user mappings get both. Execute implies read.
    pub fn from_prot(prot: VmProt, kernel: bool) -> Self {
        let mut ret = Self::default();
        if prot.intersects(VmProt::READ | VmProt::EXECUTE) {
            ret.set_bit(PteFieldBit::KernelRead);
            if !kernel {
                ret.set_bit(PteFieldBit::UserRead);
            }
        }
        if prot.contains(VmProt::WRITE) {
            ret.set_bit(PteFieldBit::KernelWrite);
            if !kernel {
                ret.set_bit(PteFieldBit::UserWrite);
            }
        }
        ret
    }

    /// Status for an entry pointing at a lower-level table.
    pub fn non_leaf() -> Self {
        Self::default()
            .with(PteFieldBit::KernelRead)
            .with(PteFieldBit::KernelWrite)
    }
}

/// A translation entry. All-zero means unmapped; otherwise the valid bit is set and the frame
/// number names either a data page or a lower-level table page.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    /// An unmapped entry.
    pub const fn invalid() -> Self {
        Pte(0)
    }

    /// Creates a valid entry for `pfn` with the given status bits.
    pub fn new(pfn: SupervisorPfn, status: PteFieldBits) -> Self {
        Pte(((pfn.bits() & PFN_MASK) << PFN_SHIFT) | status.bits() | PteFieldBit::Valid.mask())
    }

    /// Returns the raw bits the make up the PTE.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the entry is valid.
    pub fn valid(&self) -> bool {
        PteFieldBit::Valid.is_set(self.0)
    }

    /// Returns `true` if `bit` is set.
    pub fn is_set(&self, bit: PteFieldBit) -> bool {
        bit.is_set(self.0)
    }

    /// Sets `bit`.
    pub fn set_bit(&mut self, bit: PteFieldBit) {
        self.0 |= bit.mask();
    }

    /// Clears `bit`.
    pub fn clear_bit(&mut self, bit: PteFieldBit) {
        self.0 &= !bit.mask();
    }

    /// Clears everything including valid bit.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the pfn of this entry.
    pub fn pfn(&self) -> SupervisorPfn {
        Pfn::supervisor((self.0 >> PFN_SHIFT) & PFN_MASK)
    }

    /// Returns the status bits of this entry, excluding the frame number and the valid bit.
    pub fn status(&self) -> PteFieldBits {
        PteFieldBits {
            bits: self.0 & !(PFN_MASK << PFN_SHIFT) & !PteFieldBit::Valid.mask(),
        }
    }

    pub fn is_wired(&self) -> bool {
        self.is_set(PteFieldBit::Wired)
    }

    pub fn is_managed(&self) -> bool {
        self.is_set(PteFieldBit::Managed)
    }

    pub fn is_global(&self) -> bool {
        self.is_set(PteFieldBit::Global)
    }

    /// Returns true if the entry grants read access at any privilege.
    pub fn readable(&self) -> bool {
        self.0 & READ_MASK != 0
    }

    /// Returns true if the entry grants write access at any privilege.
    pub fn writable(&self) -> bool {
        self.0 & WRITE_MASK != 0
    }

    /// Removes write permission.
    pub fn clear_write(&mut self) {
        self.0 &= !WRITE_MASK;
    }

    /// Clears the fault-on bits given in `mask`, built from `PteFieldBit` masks.
    pub fn clear_fault_bits(&mut self, mask: u64) {
        self.0 &= !(mask & FAULT_MASK);
    }

    /// Sets the fault-on bits given in `mask`, built from `PteFieldBit` masks.
    pub fn set_fault_bits(&mut self, mask: u64) {
        self.0 |= mask & FAULT_MASK;
    }

    /// Returns true if the mapping has been read since its fault-on-read bit was last armed.
    pub fn referenced(&self) -> bool {
        !self.is_set(PteFieldBit::FaultOnRead)
    }

    /// Returns true if the mapping has been written since its fault-on-write bit was last armed.
    pub fn modified(&self) -> bool {
        !self.is_set(PteFieldBit::FaultOnWrite)
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "Pte({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_bits() {
        let status = PteFieldBits::from_prot(VmProt::READ_WRITE, false)
            .with(PteFieldBit::Managed)
            .with_fault_on_all();
        let mut pte = Pte::new(Pfn::supervisor(0x1234), status);
        assert!(pte.valid());
        assert_eq!(pte.pfn(), Pfn::supervisor(0x1234));
        assert!(pte.readable() && pte.writable());
        assert!(pte.is_set(PteFieldBit::UserWrite));
        assert!(!pte.referenced() && !pte.modified());
        assert_eq!(pte.status(), status);

        pte.clear_fault_bits(PteFieldBit::FaultOnRead.mask());
        assert!(pte.referenced());
        assert!(!pte.modified());

        pte.clear_write();
        assert!(!pte.writable());
        assert!(pte.readable());
        assert_eq!(pte.pfn(), Pfn::supervisor(0x1234));
    }

    #[test]
    fn high_frames_keep_every_pfn_bit() {
        let status = PteFieldBits::from_prot(VmProt::READ_WRITE, false)
            .with(PteFieldBit::Managed)
            .with(PteFieldBit::Wired)
            .with_fault_on_all();
        // The frame at 2^44 bytes, the last page below 2^56 and one in between.
        for pfn in [1 << 32, (1 << 44) - 1, 0x8_0000_0123] {
            let pte = Pte::new(Pfn::supervisor(pfn), status);
            assert_eq!(pte.pfn(), Pfn::supervisor(pfn));
            assert_eq!(pte.status(), status);
        }
    }

    #[test]
    fn kernel_prot_has_no_user_bits() {
        let status = PteFieldBits::from_prot(VmProt::READ_WRITE | VmProt::EXECUTE, true);
        assert!(!PteFieldBit::UserRead.is_set(status.bits()));
        assert!(!PteFieldBit::UserWrite.is_set(status.bits()));
        assert!(PteFieldBit::KernelWrite.is_set(status.bits()));
    }

    #[test]
    fn execute_implies_read() {
        let status = PteFieldBits::from_prot(VmProt::EXECUTE, false);
        assert!(Pte::new(Pfn::supervisor(1), status).readable());
    }
}
