// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! User-space IOMMU address-space management.
//!
//! A process that drives a PCIe device directly needs the device's DMA to be
//! confined to memory the process actually owns. The kernel exposes this
//! through IOMMU passthrough: the process installs mappings from I/O virtual
//! addresses (IOVAs) to its own virtual memory, and the device only ever sees
//! IOVAs. This crate brokers that address space:
//!
//! - [`IovaIndex`] keeps an ordered map from virtual addresses to their live
//!   DMA mappings, supporting range queries in expected logarithmic time.
//! - [`IovaAllocator`] hands out IOVAs from the ranges the kernel permits,
//!   with a sticky pool for long-lived mappings and an ephemeral pool that is
//!   recycled when the last short-lived mapping drains.
//! - [`IommuContext`] ties the two together with a kernel backend, exposing
//!   map/unmap/translate on plain virtual addresses.
//! - [`IommuBackend`] abstracts the kernel interface, with one implementation
//!   for the legacy VFIO group/container flow and one for the iommufd
//!   character-device flow. The context probes for a usable iommufd at
//!   construction and falls back to the legacy flow.
//!
//! # Platform support
//!
//! - x86_64 Linux

#[macro_use]
extern crate log;

use std::io;

use thiserror::Error;

mod allocator;
mod backend;
mod bindings;
mod context;
mod iommufd;
mod iova;
mod mmap;
mod vfio;

pub use allocator::IovaAllocator;
pub use backend::IommuBackend;
pub use context::IommuContext;
pub use iommufd::IommufdBackend;
pub use iova::{IovaIndex, Mapping};
pub use mmap::MmapRegion;
pub use vfio::VfioBackend;

/// A contiguous range of I/O virtual addresses the kernel permits for
/// mapping. `last` is inclusive.
///
/// The layout matches the kernel's `iommu_iova_range` so range arrays can be
/// filled in directly by the iommufd backend.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IovaRange {
    pub start: u64,
    pub last: u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Length is zero or not a multiple of the page size")]
    InvalidLength,
    #[error("Mapping overlaps an existing mapping")]
    Overlap,
    #[error("No mapping contains the address")]
    NotMapped,
    #[error("No permitted IOVA range can satisfy the allocation")]
    NoIovaSpace,
    #[error("Invalid device sysfs path")]
    InvalidPath,
    #[error("Failed to open the VFIO container: {0}")]
    OpenContainer(#[source] io::Error),
    #[error("VFIO API version mismatch")]
    ApiVersion,
    #[error("Container does not support a Type-1 IOMMU")]
    NoType1Iommu,
    #[error("Failed to open the VFIO group: {0}")]
    OpenGroup(#[source] io::Error),
    #[error("Failed to get VFIO group status: {0}")]
    GroupStatus(#[source] io::Error),
    #[error("VFIO group is not viable")]
    GroupNotViable,
    #[error("Failed to add the group to the container: {0}")]
    GroupSetContainer(#[source] io::Error),
    #[error("Failed to set the container IOMMU type: {0}")]
    SetIommu(#[source] io::Error),
    #[error("Failed to get IOMMU info: {0}")]
    IommuInfo(#[source] io::Error),
    #[error("Failed to get the device descriptor: {0}")]
    GetDeviceFd(#[source] io::Error),
    #[error("Failed to open the iommufd control device: {0}")]
    OpenIommufd(#[source] io::Error),
    #[error("Failed to allocate an I/O address space: {0}")]
    IoasAlloc(#[source] io::Error),
    #[error("Failed to bind the device to the iommufd: {0}")]
    BindIommufd(#[source] io::Error),
    #[error("Failed to attach the device to the I/O address space: {0}")]
    AttachIoas(#[source] io::Error),
    #[error("Failed to query IOVA ranges: {0}")]
    IovaRanges(#[source] io::Error),
    #[error("Failed to map DMA: {0}")]
    DmaMap(#[source] io::Error),
    #[error("Failed to unmap DMA: {0}")]
    DmaUnmap(#[source] io::Error),
    #[error("Failed to reset the device: {0}")]
    DeviceReset(#[source] io::Error),
    #[error("Failed to configure device interrupts: {0}")]
    SetIrqs(#[source] io::Error),
    #[error("Failed to allocate memory: {0}")]
    Mmap(#[source] io::Error),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process-wide parameters captured once, before any context is created.
#[derive(Clone, Copy, Debug)]
pub struct Runtime {
    page_size: usize,
    page_shift: u32,
}

impl Runtime {
    pub fn new() -> Self {
        // SAFETY: sysconf has no memory safety requirements.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        Runtime {
            page_size,
            page_shift: page_size.trailing_zeros(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    pub fn is_page_aligned(&self, val: u64) -> bool {
        val & (self.page_size as u64 - 1) == 0
    }

    /// Round `len` up to the next multiple of the page size.
    pub fn page_align_up(&self, len: usize) -> usize {
        (len + self.page_size - 1) & !(self.page_size - 1)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_page_parameters() {
        let rt = Runtime::new();
        assert!(rt.page_size().is_power_of_two());
        assert_eq!(1usize << rt.page_shift(), rt.page_size());
        assert!(rt.is_page_aligned(0));
        assert!(!rt.is_page_aligned(1));
        assert_eq!(rt.page_align_up(1), rt.page_size());
        assert_eq!(rt.page_align_up(rt.page_size()), rt.page_size());
    }
}
