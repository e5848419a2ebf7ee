// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Page and address types for the physical map
//!
//! - `RawAddr`, `PageAddr` and `Pfn` are typed over the address space they belong to so that a
//!   physical frame can never be passed where a virtual address is expected.
//! - `VmProt` is the protection requested by the VM layer for a mapping.
#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod address_space;
mod page;
mod prot;

pub use address_space::{AddressSpace, SupervisorPhys, SupervisorVirt};
pub use page::*;
pub use prot::VmProt;
