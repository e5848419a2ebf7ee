// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;

bitflags! {
    /// Access rights requested for a mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl VmProt {
    /// Read-only access.
    pub const READ_ONLY: VmProt = VmProt::READ;
    /// Read and write access.
    pub const READ_WRITE: VmProt = VmProt::READ.union(VmProt::WRITE);

    /// Returns true if `self` allows nothing that `other` forbids.
    pub fn is_narrower_than(&self, other: VmProt) -> bool {
        other.contains(*self)
    }
}
