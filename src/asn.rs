// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use log::debug;

use crate::platform::TlbOps;

/// An ASN generation number.
///
/// Every time a CPU runs out of ASNs it starts a new generation and flushes its TLB. An ASN is
/// only meaningful together with the generation it was handed out in. Generation 0 is never
/// current, so a zeroed `Asn` is always stale.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AsnGeneration(u64);

impl AsnGeneration {
    /// The first generation handed out.
    pub const fn first() -> Self {
        AsnGeneration(1)
    }

    /// Returns the next generation.
    pub fn increment(self) -> Self {
        AsnGeneration(self.0 + 1)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }
}

/// A pmap's ASN on one CPU, tagged with the generation it belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Asn {
    asn: u64,
    generation: AsnGeneration,
}

impl Asn {
    /// Returns the raw ASN value.
    pub fn asn(&self) -> u64 {
        self.asn
    }

    /// Returns the generation this ASN was assigned in.
    pub fn generation(&self) -> AsnGeneration {
        self.generation
    }

    /// Forgets the assignment so the next activation on this CPU gets a fresh ASN.
    pub fn mark_stale(&mut self) {
        self.generation = AsnGeneration::default();
    }
}

/// Tracks the assignment of ASNs on one physical CPU.
pub struct AsnTracker {
    max_asn: u64,
    next_asn: u64,
    current_generation: AsnGeneration,
    rollovers: u64,
}

impl AsnTracker {
    /// Returns an initialized `AsnTracker`. ASN 0 of the first generation belongs to whatever the
    /// CPU booted with, so handing out starts at 1.
    pub const fn new(max_asn: u64) -> Self {
        Self {
            max_asn,
            next_asn: 1,
            current_generation: AsnGeneration::first(),
            rollovers: 0,
        }
    }

    /// Returns the current ASN generation.
    pub fn current_generation(&self) -> AsnGeneration {
        self.current_generation
    }

    /// Returns how many times this CPU has started a new generation.
    pub fn rollovers(&self) -> u64 {
        self.rollovers
    }

    /// Returns the ASN in `slot`, assigning one if the slot is from an old generation. Running
    /// out of ASNs starts a new generation, which flushes the TLB through `tlb` first since ASNs
    /// are about to be reused.
    pub fn get_asn<T: TlbOps + ?Sized>(&mut self, slot: &mut Asn, tlb: &T) -> u64 {
        if slot.generation == self.current_generation {
            return slot.asn;
        }
        if self.next_asn > self.max_asn {
            self.current_generation = self.current_generation.increment();
            self.next_asn = 0;
            self.rollovers += 1;
            tlb.tlb_invalidate_all();
            tlb.instruction_barrier();
            debug!("ASN rollover, generation {}", self.current_generation.bits());
        }
        slot.asn = self.next_asn;
        slot.generation = self.current_generation;
        self.next_asn += 1;
        slot.asn
    }
}
