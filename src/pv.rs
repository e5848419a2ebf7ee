// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The reverse map: for every managed page, the (pmap, va) pairs mapping it.
//!
//! Each `PvEntry` sits on two doubly-linked lists at once, the mapper list of its page and the
//! list of its pmap. Links are arena handles, and both lists are only modified through
//! `&mut PvIndex`, so unlinking from both always happens in one critical section.

use alloc::collections::BTreeMap;
use page_tables::TableId;
use pmap_arena::{Arena, ArenaId};
use pmap_pages::{SupervisorPageAddr, VirtAddr};

use crate::pmap::PmapId;

pub(crate) type PvId = ArenaId<PvEntry>;

#[derive(Clone, Copy, Debug, Default)]
struct Link {
    prev: Option<PvId>,
    next: Option<PvId>,
}

#[derive(Clone, Copy, Debug, Default)]
struct PvList {
    head: Option<PvId>,
    tail: Option<PvId>,
    len: usize,
}

/// Selects which of an entry's two lists an operation follows.
#[derive(Clone, Copy)]
enum ListKind {
    Page,
    Pmap,
}

/// One managed mapping.
#[derive(Debug)]
pub(crate) struct PvEntry {
    pmap: PmapId,
    va: VirtAddr,
    page: SupervisorPageAddr,
    /// The L3 table holding the mapping; `None` for kernel mappings, whose tables are permanent.
    table: Option<TableId>,
    page_link: Link,
    pmap_link: Link,
}

impl PvEntry {
    pub fn pmap(&self) -> PmapId {
        self.pmap
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn page(&self) -> SupervisorPageAddr {
        self.page
    }

    pub fn table(&self) -> Option<TableId> {
        self.table
    }

    fn link(&self, kind: ListKind) -> &Link {
        match kind {
            ListKind::Page => &self.page_link,
            ListKind::Pmap => &self.pmap_link,
        }
    }

    fn link_mut(&mut self, kind: ListKind) -> &mut Link {
        match kind {
            ListKind::Page => &mut self.page_link,
            ListKind::Pmap => &mut self.pmap_link,
        }
    }
}

/// Errors from the reverse map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PvError {
    /// No memory for a new entry.
    AllocFailed,
}

/// All reverse-map entries, indexed by page and by pmap.
#[derive(Default)]
pub(crate) struct PvIndex {
    entries: Arena<PvEntry>,
    by_page: BTreeMap<SupervisorPageAddr, PvList>,
    by_pmap: BTreeMap<PmapId, PvList>,
}

impl PvIndex {
    pub const fn new() -> Self {
        Self {
            entries: Arena::new(),
            by_page: BTreeMap::new(),
            by_pmap: BTreeMap::new(),
        }
    }

    fn entry(&self, id: PvId) -> &PvEntry {
        match self.entries.get(id) {
            Some(e) => e,
            None => panic!("dangling pv link {}", id),
        }
    }

    fn entry_mut(&mut self, id: PvId) -> &mut PvEntry {
        match self.entries.get_mut(id) {
            Some(e) => e,
            None => panic!("dangling pv link {}", id),
        }
    }

    fn list_mut(&mut self, kind: ListKind, id: PvId) -> &mut PvList {
        let (page, pmap) = {
            let e = self.entry(id);
            (e.page, e.pmap)
        };
        let list = match kind {
            ListKind::Page => self.by_page.get_mut(&page),
            ListKind::Pmap => self.by_pmap.get_mut(&pmap),
        };
        match list {
            Some(l) => l,
            None => panic!("pv entry {} on a missing list", id),
        }
    }

    fn push_back(&mut self, kind: ListKind, id: PvId) {
        let list = self.list_mut(kind, id);
        let old_tail = list.tail.replace(id);
        if list.head.is_none() {
            list.head = Some(id);
        }
        list.len += 1;
        self.entry_mut(id).link_mut(kind).prev = old_tail;
        if let Some(t) = old_tail {
            self.entry_mut(t).link_mut(kind).next = Some(id);
        }
    }

    fn unlink(&mut self, kind: ListKind, id: PvId) {
        let link = *self.entry(id).link(kind);
        match link.prev {
            Some(p) => self.entry_mut(p).link_mut(kind).next = link.next,
            None => self.list_mut(kind, id).head = link.next,
        }
        match link.next {
            Some(n) => self.entry_mut(n).link_mut(kind).prev = link.prev,
            None => self.list_mut(kind, id).tail = link.prev,
        }
        let list = self.list_mut(kind, id);
        list.len = match list.len.checked_sub(1) {
            Some(l) => l,
            None => panic!("pv list length underflow at {}", id),
        };
        *self.entry_mut(id).link_mut(kind) = Link::default();
    }

    /// Records that `pmap` maps `page` at `va` through the L3 table `table`.
    pub fn insert(
        &mut self,
        pmap: PmapId,
        va: VirtAddr,
        table: Option<TableId>,
        page: SupervisorPageAddr,
    ) -> Result<PvId, PvError> {
        let id = self
            .entries
            .try_insert(PvEntry {
                pmap,
                va,
                page,
                table,
                page_link: Link::default(),
                pmap_link: Link::default(),
            })
            .map_err(|_| PvError::AllocFailed)?;
        self.by_page.entry(page).or_default();
        self.by_pmap.entry(pmap).or_default();
        self.push_back(ListKind::Page, id);
        self.push_back(ListKind::Pmap, id);
        Ok(id)
    }

    /// Finds the entry for (`pmap`, `va`) on `page`. Walks whichever of the page's mapper list and
    /// the pmap's list is shorter.
    pub fn find(&self, pmap: PmapId, page: SupervisorPageAddr, va: VirtAddr) -> Option<PvId> {
        let page_len = self.page_count(page);
        let pmap_len = self.pmap_count(pmap);
        if page_len == 0 || pmap_len == 0 {
            return None;
        }
        let matches = |(_, e): &(PvId, &PvEntry)| e.pmap == pmap && e.va == va && e.page == page;
        if page_len <= pmap_len {
            self.page_iter(page).find(matches).map(|(id, _)| id)
        } else {
            self.pmap_iter(pmap).find(matches).map(|(id, _)| id)
        }
    }

    /// Removes the entry for (`pmap`, `va`) on `page` from both lists and returns it.
    pub fn remove(
        &mut self,
        pmap: PmapId,
        page: SupervisorPageAddr,
        va: VirtAddr,
    ) -> Option<PvEntry> {
        let id = self.find(pmap, page, va)?;
        Some(self.remove_id(id))
    }

    /// Unlinks `id` from both lists and frees it.
    pub fn remove_id(&mut self, id: PvId) -> PvEntry {
        self.unlink(ListKind::Page, id);
        self.unlink(ListKind::Pmap, id);
        let entry = match self.entries.remove(id) {
            Some(e) => e,
            None => panic!("pv entry {} freed twice", id),
        };
        if self.page_count(entry.page) == 0 {
            self.by_page.remove(&entry.page);
        }
        if self.pmap_count(entry.pmap) == 0 {
            self.by_pmap.remove(&entry.pmap);
        }
        entry
    }

    /// Returns the first mapper of `page`.
    pub fn first_of_page(&self, page: SupervisorPageAddr) -> Option<PvId> {
        self.by_page.get(&page)?.head
    }

    pub fn get(&self, id: PvId) -> Option<&PvEntry> {
        self.entries.get(id)
    }

    /// Returns the number of mappings of `page`.
    pub fn page_count(&self, page: SupervisorPageAddr) -> usize {
        self.by_page.get(&page).map_or(0, |l| l.len)
    }

    /// Returns the number of managed mappings in `pmap`.
    pub fn pmap_count(&self, pmap: PmapId) -> usize {
        self.by_pmap.get(&pmap).map_or(0, |l| l.len)
    }

    /// Iterates over the mappers of `page`.
    pub fn page_iter(&self, page: SupervisorPageAddr) -> PvIter<'_> {
        PvIter {
            index: self,
            next: self.by_page.get(&page).and_then(|l| l.head),
            kind: ListKind::Page,
        }
    }

    /// Iterates over the managed mappings of `pmap`.
    pub fn pmap_iter(&self, pmap: PmapId) -> PvIter<'_> {
        PvIter {
            index: self,
            next: self.by_pmap.get(&pmap).and_then(|l| l.head),
            kind: ListKind::Pmap,
        }
    }

    /// Returns the total number of entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Follows one of the two lists.
pub(crate) struct PvIter<'a> {
    index: &'a PvIndex,
    next: Option<PvId>,
    kind: ListKind,
}

impl<'a> Iterator for PvIter<'a> {
    type Item = (PvId, &'a PvEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let entry = self.index.entry(id);
        self.next = entry.link(self.kind).next;
        Some((id, entry))
    }
}
