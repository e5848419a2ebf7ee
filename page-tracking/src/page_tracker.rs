// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use pmap_pages::SupervisorPageAddr;
use spin::Mutex;

use crate::page_info::{PageAttrs, PageMap};
use crate::HwMemMap;

/// Errors related to managing physical page information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page map couldn't be allocated.
    AllocFailed,
    /// The given page isn't a managed page.
    InvalidPage(SupervisorPageAddr),
}

/// Holds the result of page tracking operations.
pub type Result<T> = core::result::Result<T, Error>;

// Inner struct that is wrapped in a mutex by `PageTracker`.
struct PageTrackerInner {
    pages: PageMap,
}

/// This struct wraps the attributes of every managed page. It can be cloned and passed to other
/// components that need access to page state.
#[derive(Clone)]
pub struct PageTracker {
    inner: Arc<Mutex<PageTrackerInner>>,
}

impl PageTracker {
    /// Creates a new `PageTracker` covering the managed regions of `mem_map`.
    pub fn new(mem_map: &HwMemMap) -> Result<Self> {
        let pages = PageMap::build_from(mem_map).ok_or(Error::AllocFailed)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PageTrackerInner { pages })),
        })
    }

    /// Returns true if `page` is tracked.
    pub fn is_managed(&self, page: SupervisorPageAddr) -> bool {
        self.inner.lock().pages.get(page).is_some()
    }

    /// Returns the number of managed pages.
    pub fn num_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Returns the attributes of `page`.
    pub fn attrs(&self, page: SupervisorPageAddr) -> Result<PageAttrs> {
        let inner = self.inner.lock();
        let info = inner.pages.get(page).ok_or(Error::InvalidPage(page))?;
        Ok(info.attrs())
    }

    /// Sets `attrs` on `page`, returning the attributes it had before.
    pub fn set_attrs(&self, page: SupervisorPageAddr, attrs: PageAttrs) -> Result<PageAttrs> {
        let mut inner = self.inner.lock();
        let info = inner.pages.get_mut(page).ok_or(Error::InvalidPage(page))?;
        Ok(info.set(attrs))
    }

    /// Clears `attrs` on `page`, returning the attributes it had before.
    pub fn clear_attrs(&self, page: SupervisorPageAddr, attrs: PageAttrs) -> Result<PageAttrs> {
        let mut inner = self.inner.lock();
        let info = inner.pages.get_mut(page).ok_or(Error::InvalidPage(page))?;
        Ok(info.clear(attrs))
    }
}
