// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use spin::Mutex;

use crate::asn::AsnTracker;
use crate::platform::CpuId;
use crate::pmap::Pmap;

/// Per-CPU state of the pmap layer. One of these exists for every CPU the system was configured
/// with; the platform's `current_cpu()` selects which one an operation uses.
pub struct PerCpu {
    cpu_id: CpuId,
    asn_tracker: Mutex<AsnTracker>,
    active: Mutex<Option<Arc<Pmap>>>,
}

impl PerCpu {
    pub(crate) fn new(cpu_id: CpuId, max_asn: u64) -> Self {
        Self {
            cpu_id,
            asn_tracker: Mutex::new(AsnTracker::new(max_asn)),
            active: Mutex::new(None),
        }
    }

    /// Returns this CPU's ID.
    pub fn cpu_id(&self) -> CpuId {
        self.cpu_id
    }

    /// Returns the ASN allocator of this CPU.
    pub(crate) fn asn_tracker(&self) -> &Mutex<AsnTracker> {
        &self.asn_tracker
    }

    /// Makes `pmap` the address space this CPU runs in, returning the previous one.
    pub(crate) fn swap_active(&self, pmap: Option<Arc<Pmap>>) -> Option<Arc<Pmap>> {
        core::mem::replace(&mut *self.active.lock(), pmap)
    }

    /// Returns the address space this CPU runs in, if one has been activated.
    pub fn active_pmap(&self) -> Option<Arc<Pmap>> {
        self.active.lock().clone()
    }

    /// Returns how many ASN generations this CPU has gone through.
    pub fn asn_rollovers(&self) -> u64 {
        self.asn_tracker.lock().rollovers()
    }
}
