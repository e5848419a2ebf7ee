// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # The physical map
//!
//! Keeps the three-level translation tables of every address space in step with what the VM
//! layer wants mapped, tracks which address spaces map each managed physical page, and keeps the
//! TLBs of all CPUs coherent using ASN-tagged translations.
//!
//! ## Key types
//!
//! - `PmapSystem` - All address spaces of one machine, built by `PmapSystem::bootstrap` from a
//!   `Platform`, a `PmapConfig` and the memory map. Every operation is a method on it.
//! - `Pmap` - One address space. Shared as `Arc<Pmap>`; `create` makes one, `destroy` retires it
//!   once everything has been unmapped.
//! - `Platform` - The services the pmap consumes: zeroed page allocation, TLB primitives of the
//!   current CPU and synchronous cross-CPU calls.
//!
//! ## Address layout
//!
//! User addresses are `[0, 256GB)`. The L1 slot right after them maps each root onto itself, and
//! the rest of the 39-bit space is the kernel range, whose L2 and L3 tables are shared by all
//! address spaces.
//!
//! ## Referenced and modified state
//!
//! Managed mappings are entered with fault-on-read/write/execute bits set. The first access of
//! each kind traps, and the trap handler calls `emulate_reference_fault`, which records the
//! access in the page's attributes. `clear_modified` and `clear_reference` re-arm the bits.
#![no_std]

extern crate alloc;

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

mod asn;
mod config;
mod cpu;
mod mapping;
mod page_ops;
/// Interfaces to the machine underneath the pmap.
pub mod platform;
mod pmap;
mod ptpage;
mod pv;
mod system;
mod tlb;

#[cfg(test)]
mod test_stubs;

pub use asn::{Asn, AsnGeneration};
pub use config::{ConfigError, PmapConfig, PmapConfigBuilder, DEFAULT_MAX_ASN};
pub use cpu::PerCpu;
pub use mapping::{FaultKind, MincoreFlags, Residency};
pub use platform::{CpuId, CpuMask, CpuSignal, PageAllocator, Platform, TlbOps, MAX_CPUS};
pub use pmap::{Pmap, PmapId, PmapStats};
pub use system::{Error, PmapSystem, Result};
