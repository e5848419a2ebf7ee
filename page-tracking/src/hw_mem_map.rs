// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use core::{fmt, result};
use pmap_pages::{PageAddr, PageSize, PhysAddr, SupervisorPageAddr};

// The map is built before anything can be allocated.
const MAX_REGIONS: usize = 32;

/// Describes the usage of a region in the hardware memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwMemRegionType {
    /// RAM whose pages are managed.
    Available,
    /// RAM that is never managed (firmware, kernel image, boot-time tables).
    Reserved,
    /// Memory-mapped IO.
    Mmio,
}

impl fmt::Display for HwMemRegionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            HwMemRegionType::Available => "available",
            HwMemRegionType::Reserved => "reserved",
            HwMemRegionType::Mmio => "mmio",
        };
        f.write_str(name)
    }
}

/// Errors raised while building the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A RAM region doesn't start on the required alignment.
    UnalignedRegion,
    /// A region overlaps one added earlier.
    OverlappingRegion,
    /// A reserved range isn't inside a single available RAM region.
    InvalidReservedRegion,
    /// The map has no room for another region.
    OutOfSpace,
    /// The region has no pages.
    EmptyRegion,
}

/// Holds the result of memory map operations.
pub type Result<T> = result::Result<T, Error>;

/// A page-aligned, half-open range `[start, end)` of physical memory.
#[derive(Debug, Clone, Copy)]
pub struct HwMemRegion {
    region_type: HwMemRegionType,
    start: SupervisorPageAddr,
    end: SupervisorPageAddr,
}

impl HwMemRegion {
    fn new(region_type: HwMemRegionType, start: u64, end: u64) -> Result<Self> {
        if end <= start {
            return Err(Error::EmptyRegion);
        }
        let page = |bits| PageAddr::with_round_down(PhysAddr::supervisor(bits), PageSize::Size4k);
        Ok(Self {
            region_type,
            start: page(start),
            end: page(end),
        })
    }

    pub fn region_type(&self) -> HwMemRegionType {
        self.region_type
    }

    /// Returns the first page of the region.
    pub fn base(&self) -> SupervisorPageAddr {
        self.start
    }

    /// Returns the page just past the region.
    pub fn end(&self) -> SupervisorPageAddr {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end.bits() - self.start.bits()
    }

    pub fn num_pages(&self) -> u64 {
        self.size() / PageSize::Size4k as u64
    }

    fn overlaps(&self, other: &HwMemRegion) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn contains(&self, other: &HwMemRegion) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// The physical memory of the machine, sorted by address. Pages in `Available` regions are
/// managed and get a `PageInfo`; `Reserved` and `Mmio` pages can only be mapped unmanaged.
///
/// Built with `HwMemMapBuilder`.
#[derive(Default)]
pub struct HwMemMap {
    regions: ArrayVec<HwMemRegion, MAX_REGIONS>,
}

impl HwMemMap {
    /// Returns every region in address order.
    pub fn regions(&self) -> core::slice::Iter<HwMemRegion> {
        self.regions.iter()
    }

    /// Returns the regions whose pages are managed.
    pub fn managed_regions(&self) -> impl Iterator<Item = &HwMemRegion> {
        self.regions
            .iter()
            .filter(|r| r.region_type == HwMemRegionType::Available)
    }

    fn insert(&mut self, region: HwMemRegion) -> Result<()> {
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(Error::OverlappingRegion);
        }
        let index = self.regions.partition_point(|r| r.start < region.start);
        self.regions
            .try_insert(index, region)
            .map_err(|_| Error::OutOfSpace)
    }

    // Replaces the available region holding `reserved` with the pieces left on either side of it.
    fn carve(&mut self, reserved: HwMemRegion) -> Result<()> {
        let index = self
            .regions
            .iter()
            .position(|r| r.region_type == HwMemRegionType::Available && r.contains(&reserved))
            .ok_or(Error::InvalidReservedRegion)?;
        let outer = self.regions[index];
        let mut pieces = ArrayVec::<HwMemRegion, 3>::new();
        if outer.start < reserved.start {
            pieces.push(HwMemRegion {
                end: reserved.start,
                ..outer
            });
        }
        pieces.push(reserved);
        if reserved.end < outer.end {
            pieces.push(HwMemRegion {
                start: reserved.end,
                ..outer
            });
        }
        if self.regions.len() + pieces.len() - 1 > MAX_REGIONS {
            return Err(Error::OutOfSpace);
        }
        self.regions.remove(index);
        for (i, piece) in pieces.into_iter().enumerate() {
            self.regions.insert(index + i, piece);
        }
        Ok(())
    }
}

/// Builds a `HwMemMap`: call `add_memory_region()` for each range of RAM, `add_mmio_region()` for
/// each device range and `reserve_region()` for RAM that must not be managed.
pub struct HwMemMapBuilder {
    map: HwMemMap,
    // Alignment of RAM regions and reservations; a multiple of 4kB.
    ram_align: u64,
}

impl HwMemMapBuilder {
    pub fn new(ram_align: u64) -> Self {
        assert!(ram_align != 0 && PageSize::Size4k.is_aligned(ram_align));
        Self {
            map: HwMemMap::default(),
            ram_align,
        }
    }

    fn align_down(&self, val: u64) -> u64 {
        val - val % self.ram_align
    }

    fn align_up(&self, val: u64) -> u64 {
        self.align_down(val.saturating_add(self.ram_align - 1))
    }

    /// Adds managed RAM. `base` must be aligned; `size` is rounded down to the alignment.
    pub fn add_memory_region(mut self, base: PhysAddr, size: u64) -> Result<Self> {
        if base.bits() % self.ram_align != 0 {
            return Err(Error::UnalignedRegion);
        }
        let end = base.bits().saturating_add(self.align_down(size));
        let region = HwMemRegion::new(HwMemRegionType::Available, base.bits(), end)?;
        self.map.insert(region)?;
        Ok(self)
    }

    /// Adds device memory, widened to whole pages.
    pub fn add_mmio_region(mut self, base: PhysAddr, size: u64) -> Result<Self> {
        let start = PageSize::Size4k.round_down(base.bits());
        let end = PageSize::Size4k.round_up(base.bits().saturating_add(size));
        let region = HwMemRegion::new(HwMemRegionType::Mmio, start, end)?;
        self.map.insert(region)?;
        Ok(self)
    }

    /// Takes a range out of previously added RAM so that its pages are never managed. The range is
    /// widened to the alignment.
    pub fn reserve_region(mut self, base: PhysAddr, size: u64) -> Result<Self> {
        let start = self.align_down(base.bits());
        let end = self.align_up(base.bits().saturating_add(size));
        let region = HwMemRegion::new(HwMemRegionType::Reserved, start, end)?;
        self.map.carve(region)?;
        Ok(self)
    }

    pub fn build(self) -> HwMemMap {
        self.map
    }
}
