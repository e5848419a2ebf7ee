// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Tags an address with the space it lives in. The markers are zero-sized and compare equal, so
/// addresses in one space order by their bits alone.
pub trait AddressSpace: Clone + Copy + fmt::Debug + Eq + Ord {
    /// Short name used when formatting addresses.
    const NAME: &'static str;
}

/// Machine physical addresses, i.e. the frames that translation tables point at.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SupervisorPhys;

impl AddressSpace for SupervisorPhys {
    const NAME: &'static str = "pa";
}

/// Virtual addresses translated through a pmap's tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SupervisorVirt;

impl AddressSpace for SupervisorVirt {
    const NAME: &'static str = "va";
}
