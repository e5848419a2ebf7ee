// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Index-based storage for the pmap's linked structures.
//!
//! Table pages and reverse-map entries form trees and doubly-linked lists. Rather than chaining
//! them with raw pointers they live in an `Arena` and refer to each other by `ArenaId`.
#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod arena;

pub use arena::{Arena, ArenaId, Error, Result};
