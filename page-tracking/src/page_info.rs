// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use pmap_pages::{PageSize, SupervisorPageAddr};

use crate::HwMemMap;

bitflags! {
    /// Software attributes of a managed page, accumulated across all of its mappings.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PageAttrs: u8 {
        /// Some mapping has been read since the flag was last cleared.
        const REFERENCED = 1 << 0;
        /// Some mapping has been written since the flag was last cleared.
        const MODIFIED = 1 << 1;
        /// The page may have writable mappings.
        const WRITEABLE = 1 << 2;
        /// The page may have mappings at all.
        const MAPPED = 1 << 3;
    }
}

/// Per-page state for a managed page.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageInfo {
    attrs: PageAttrs,
}

impl PageInfo {
    /// Creates the info for a page that has never been mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the page's attributes.
    pub fn attrs(&self) -> PageAttrs {
        self.attrs
    }

    /// Sets `attrs`, returning the attributes held before.
    pub fn set(&mut self, attrs: PageAttrs) -> PageAttrs {
        let old = self.attrs;
        self.attrs |= attrs;
        old
    }

    /// Clears `attrs`, returning the attributes held before.
    pub fn clear(&mut self, attrs: PageAttrs) -> PageAttrs {
        let old = self.attrs;
        self.attrs &= !attrs;
        old
    }
}

const MAX_SPARSE_MAP_ENTRIES: usize = 16;

/// Maps a contiguous range of memory to a subset of the `PageMap`.
#[derive(Clone, Copy, Debug)]
struct SparseMapEntry {
    base_pfn: usize,
    num_pages: usize,
    page_map_index: usize,
}

/// Keeps information for all managed pages in the system.
pub(crate) struct PageMap {
    pages: Vec<PageInfo>,
    sparse_map: ArrayVec<SparseMapEntry, MAX_SPARSE_MAP_ENTRIES>,
}

impl PageMap {
    /// Builds a `PageMap` with one `PageInfo` per page in the managed regions of `mem_map`.
    /// Returns `None` if the storage couldn't be allocated or the map is too fragmented.
    pub fn build_from(mem_map: &HwMemMap) -> Option<Self> {
        let total_pages = mem_map
            .managed_regions()
            .fold(0, |pages, r| pages + r.size() / PageSize::Size4k as u64);
        let mut pages = Vec::new();
        pages.try_reserve_exact(total_pages as usize).ok()?;
        let mut page_map = Self {
            pages,
            sparse_map: ArrayVec::new(),
        };

        let mut current: Option<SparseMapEntry> = None;
        for r in mem_map.managed_regions() {
            let base_pfn = r.base().index();
            let num_pages = r.num_pages() as usize;
            match current.as_mut() {
                Some(entry) if entry.base_pfn + entry.num_pages == base_pfn => {
                    entry.num_pages += num_pages;
                }
                _ => {
                    if let Some(entry) = current.take() {
                        page_map.sparse_map.try_push(entry).ok()?;
                    }
                    current = Some(SparseMapEntry {
                        base_pfn,
                        num_pages,
                        page_map_index: page_map.pages.len(),
                    });
                }
            }
            page_map
                .pages
                .extend(core::iter::repeat(PageInfo::new()).take(num_pages));
        }
        if let Some(entry) = current {
            page_map.sparse_map.try_push(entry).ok()?;
        }
        Some(page_map)
    }

    /// Returns a reference to the `PageInfo` struct for the 4k page at `addr`.
    pub fn get(&self, addr: SupervisorPageAddr) -> Option<&PageInfo> {
        let index = self.get_map_index(addr)?;
        self.pages.get(index)
    }

    /// Returns a mutable reference to the `PageInfo` struct for the 4k page at `addr`.
    pub fn get_mut(&mut self, addr: SupervisorPageAddr) -> Option<&mut PageInfo> {
        let index = self.get_map_index(addr)?;
        self.pages.get_mut(index)
    }

    /// Returns the number of managed pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns the index in the `PageMap` for the given address.
    fn get_map_index(&self, addr: SupervisorPageAddr) -> Option<usize> {
        self.sparse_map
            .iter()
            .find(|s| s.base_pfn <= addr.index() && addr.index() < s.base_pfn + s.num_pages)
            .map(|entry| entry.page_map_index + addr.index() - entry.base_pfn)
    }
}
