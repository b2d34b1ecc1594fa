// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! iommufd backend.
//!
//! The modern flow skips groups and containers entirely: an I/O address
//! space is allocated on `/dev/iommu` and the device's VFIO character device
//! is bound to it by descriptor. Closing the device descriptor unbinds it.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ref};
use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr};

use crate::backend::{self, IommuBackend, VFIO_BASE, VFIO_TYPE};
use crate::bindings::{
    iommu_ioas_alloc, iommu_ioas_iova_ranges, iommu_ioas_map, iommu_ioas_unmap,
    vfio_device_attach_iommufd_pt, vfio_device_bind_iommufd, IOMMU_IOAS_MAP_FIXED_IOVA,
    IOMMU_IOAS_MAP_READABLE, IOMMU_IOAS_MAP_WRITEABLE,
};
use crate::{Error, IovaRange, Result};

const IOMMUFD_TYPE: u32 = b';' as u32;

ioctl_io_nr!(IOMMU_IOAS_ALLOC, IOMMUFD_TYPE, 0x81);
ioctl_io_nr!(IOMMU_IOAS_IOVA_RANGES, IOMMUFD_TYPE, 0x84);
ioctl_io_nr!(IOMMU_IOAS_MAP, IOMMUFD_TYPE, 0x85);
ioctl_io_nr!(IOMMU_IOAS_UNMAP, IOMMUFD_TYPE, 0x86);
ioctl_io_nr!(VFIO_DEVICE_BIND_IOMMUFD, VFIO_TYPE, VFIO_BASE + 18);
ioctl_io_nr!(VFIO_DEVICE_ATTACH_IOMMUFD_PT, VFIO_TYPE, VFIO_BASE + 19);

/// iommufd-based IOMMU backend.
pub struct IommufdBackend {
    iommufd: File,
    device: File,
    ioas_id: u32,
    ranges: Vec<IovaRange>,
}

impl IommufdBackend {
    /// Open the device at `sysfs_path` through its VFIO character device and
    /// attach it to a fresh I/O address space.
    pub fn open(sysfs_path: &Path) -> Result<Self> {
        let iommufd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/iommu")
            .map_err(Error::OpenIommufd)?;

        let mut alloc = iommu_ioas_alloc {
            size: size_of::<iommu_ioas_alloc>() as u32,
            ..Default::default()
        };
        // SAFETY: alloc is fully initialized and outlives the call.
        let ret = unsafe { ioctl_with_mut_ref(&iommufd, IOMMU_IOAS_ALLOC(), &mut alloc) };
        if ret < 0 {
            return Err(Error::IoasAlloc(io::Error::last_os_error()));
        }

        let ioas_id = alloc.out_ioas_id;

        let device = Self::open_cdev(sysfs_path)?;

        let mut bind = vfio_device_bind_iommufd {
            argsz: size_of::<vfio_device_bind_iommufd>() as u32,
            flags: 0,
            iommufd: iommufd.as_raw_fd(),
            out_devid: 0,
        };
        // SAFETY: bind is fully initialized and outlives the call.
        let ret = unsafe { ioctl_with_mut_ref(&device, VFIO_DEVICE_BIND_IOMMUFD(), &mut bind) };
        if ret < 0 {
            return Err(Error::BindIommufd(io::Error::last_os_error()));
        }

        let mut attach = vfio_device_attach_iommufd_pt {
            argsz: size_of::<vfio_device_attach_iommufd_pt>() as u32,
            flags: 0,
            pt_id: ioas_id,
        };
        // SAFETY: attach is fully initialized and outlives the call.
        let ret = unsafe { ioctl_with_mut_ref(&device, VFIO_DEVICE_ATTACH_IOMMUFD_PT(), &mut attach) };
        if ret < 0 {
            return Err(Error::AttachIoas(io::Error::last_os_error()));
        }

        let ranges = query_iova_ranges(&iommufd, ioas_id)?;

        Ok(IommufdBackend {
            iommufd,
            device,
            ioas_id,
            ranges,
        })
    }

    fn open_cdev(sysfs_path: &Path) -> Result<File> {
        // The vfio-dev directory holds a single entry named after the
        // device's character device, e.g. "vfio0".
        let mut entries = sysfs_path
            .join("vfio-dev")
            .read_dir()
            .map_err(|_| Error::InvalidPath)?;

        let name = entries
            .next()
            .and_then(|e| e.ok())
            .map(|e| e.file_name())
            .ok_or(Error::InvalidPath)?;
        let name = name.to_str().ok_or(Error::InvalidPath)?;

        OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/vfio/devices/{name}"))
            .map_err(Error::GetDeviceFd)
    }
}

impl IommuBackend for IommufdBackend {
    fn map_dma(&self, vaddr: u64, iova: u64, len: u64) -> Result<()> {
        let map = iommu_ioas_map {
            size: size_of::<iommu_ioas_map>() as u32,
            flags: IOMMU_IOAS_MAP_FIXED_IOVA | IOMMU_IOAS_MAP_READABLE | IOMMU_IOAS_MAP_WRITEABLE,
            ioas_id: self.ioas_id,
            __reserved: 0,
            user_va: vaddr,
            length: len,
            iova,
        };

        // SAFETY: map is fully initialized and outlives the call.
        let ret = unsafe { ioctl_with_ref(&self.iommufd, IOMMU_IOAS_MAP(), &map) };
        if ret != 0 {
            return Err(Error::DmaMap(io::Error::last_os_error()));
        }

        Ok(())
    }

    fn unmap_dma(&self, iova: u64, len: u64) -> Result<()> {
        let unmap = iommu_ioas_unmap {
            size: size_of::<iommu_ioas_unmap>() as u32,
            ioas_id: self.ioas_id,
            iova,
            length: len,
        };

        // SAFETY: unmap is fully initialized and outlives the call.
        let ret = unsafe { ioctl_with_ref(&self.iommufd, IOMMU_IOAS_UNMAP(), &unmap) };
        if ret != 0 {
            return Err(Error::DmaUnmap(io::Error::last_os_error()));
        }

        Ok(())
    }

    fn iova_ranges(&self) -> &[IovaRange] {
        &self.ranges
    }

    fn device_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }

    fn reset_device(&self) -> Result<()> {
        backend::device_reset(&self.device)
    }

    fn set_irqs(&self, fds: &[&EventFd]) -> Result<()> {
        backend::device_set_irqs(&self.device, fds)
    }

    fn disable_irqs(&self) -> Result<()> {
        backend::device_disable_irqs(&self.device)
    }
}

fn query_iova_ranges(iommufd: &File, ioas_id: u32) -> Result<Vec<IovaRange>> {
    let mut query = iommu_ioas_iova_ranges {
        size: size_of::<iommu_ioas_iova_ranges>() as u32,
        ioas_id,
        ..Default::default()
    };

    // SAFETY: query is fully initialized; num_iovas is zero so the kernel
    // writes no range entries.
    let ret = unsafe { ioctl_with_mut_ref(iommufd, IOMMU_IOAS_IOVA_RANGES(), &mut query) };
    if ret == 0 {
        return Ok(Vec::new());
    }

    if io::Error::last_os_error().raw_os_error() != Some(libc::EMSGSIZE) {
        return Err(Error::IovaRanges(io::Error::last_os_error()));
    }

    // The kernel reported how many entries it has; re-issue with a buffer
    // that can hold them. IovaRange matches the kernel's iommu_iova_range
    // layout.
    let mut ranges = vec![IovaRange::default(); query.num_iovas as usize];
    query.allowed_iovas = ranges.as_mut_ptr() as u64;

    // SAFETY: allowed_iovas addresses num_iovas writable entries.
    let ret = unsafe { ioctl_with_mut_ref(iommufd, IOMMU_IOAS_IOVA_RANGES(), &mut query) };
    if ret != 0 {
        return Err(Error::IovaRanges(io::Error::last_os_error()));
    }

    ranges.truncate(query.num_iovas as usize);

    for (i, r) in ranges.iter().enumerate() {
        info!("iova range {} is [{:#x}; {:#x}]", i, r.start, r.last);
    }

    Ok(ranges)
}
