// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Managed page tracking
//!
//! ## Key types
//!
//! - `HwMemMap` - Map of system memory. RAM regions hold managed pages; MMIO regions and anything
//!   outside the map are unmanaged and are mapped without reverse-map bookkeeping.
//! - `PageTracker` - Per-page software state for every managed page: whether it has been
//!   referenced or modified through any mapping, and whether it may have writable mappings.
//!
//! ## Initialization
//!
//! `HwMemMapBuilder` -> `HwMemMap` -> `PageTracker`

#![no_std]

extern crate alloc;

mod hw_mem_map;
mod page_info;
/// Handles tracking the attributes of each managed page.
pub mod page_tracker;

pub use hw_mem_map::Error as MemMapError;
pub use hw_mem_map::Result as MemMapResult;
pub use hw_mem_map::{HwMemMap, HwMemMapBuilder, HwMemRegion, HwMemRegionType};
pub use page_info::{PageAttrs, PageInfo};
pub use page_tracker::Error as PageTrackingError;
pub use page_tracker::Result as PageTrackingResult;
pub use page_tracker::PageTracker;

#[cfg(test)]
#[macro_use]
extern crate std;
