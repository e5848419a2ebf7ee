// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use page_tables::level::{KERNEL_MAX, KERNEL_MIN, L2_SPAN};

use crate::platform::MAX_CPUS;
use crate::{Error, Result};

/// Largest ASN handed out when the platform doesn't say otherwise.
pub const DEFAULT_MAX_ASN: u64 = 255;

/// Reasons a `PmapConfig` is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one CPU is required.
    NoCpus,
    /// More CPUs than fit in a `CpuMask`.
    TooManyCpus(usize),
    /// The initial kernel limit is not inside the kernel range.
    KernelLimitOutOfRange(u64),
}

/// Static parameters of a `PmapSystem`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmapConfig {
    num_cpus: usize,
    max_asn: u64,
    kernel_initial_limit: u64,
}

impl PmapConfig {
    /// Returns the number of CPUs sharing the address spaces.
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Returns the largest ASN the hardware supports.
    pub fn max_asn(&self) -> u64 {
        self.max_asn
    }

    /// Returns the kernel address up to which tables are created at bootstrap.
    pub fn kernel_initial_limit(&self) -> u64 {
        self.kernel_initial_limit
    }
}

/// A builder for a `PmapConfig`.
pub struct PmapConfigBuilder {
    inner: PmapConfig,
}

impl PmapConfigBuilder {
    /// Creates a builder for a system of `num_cpus` CPUs with default settings otherwise.
    pub fn new(num_cpus: usize) -> Self {
        Self {
            inner: PmapConfig {
                num_cpus,
                max_asn: DEFAULT_MAX_ASN,
                kernel_initial_limit: KERNEL_MIN + L2_SPAN,
            },
        }
    }

    /// Sets the largest ASN the hardware supports.
    pub fn max_asn(mut self, max_asn: u64) -> Self {
        self.inner.max_asn = max_asn;
        self
    }

    /// Sets how much of the kernel range gets tables at bootstrap.
    pub fn kernel_initial_limit(mut self, limit: u64) -> Self {
        self.inner.kernel_initial_limit = limit;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<PmapConfig> {
        let config = self.inner;
        if config.num_cpus == 0 {
            return Err(Error::InvalidConfig(ConfigError::NoCpus));
        }
        if config.num_cpus > MAX_CPUS {
            return Err(Error::InvalidConfig(ConfigError::TooManyCpus(
                config.num_cpus,
            )));
        }
        if !(KERNEL_MIN..=KERNEL_MAX).contains(&config.kernel_initial_limit) {
            return Err(Error::InvalidConfig(ConfigError::KernelLimitOutOfRange(
                config.kernel_initial_limit,
            )));
        }
        Ok(config)
    }
}
