// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Legacy VFIO group/container backend.
//!
//! The device's isolation group is resolved from its sysfs `iommu_group`
//! link, attached to a fresh container, and the Type-1 IOMMU is configured.
//! The permitted IOVA ranges come out of the capability chain appended to
//! `VFIO_IOMMU_GET_INFO`, which needs the usual two-phase `argsz` dance.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::slice;

use vfio_bindings::bindings::vfio::{
    vfio_group_status, vfio_iommu_type1_dma_map, vfio_iommu_type1_dma_unmap, VFIO_API_VERSION,
    VFIO_DMA_MAP_FLAG_READ, VFIO_DMA_MAP_FLAG_WRITE, VFIO_GROUP_FLAGS_VIABLE, VFIO_TYPE1_IOMMU,
};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref, ioctl_with_val};
use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr};

use crate::backend::{
    self, vec_with_size_in_bytes, IommuBackend, VFIO_BASE, VFIO_TYPE,
};
use crate::bindings::{
    vfio_iommu_type1_info, VFIO_IOMMU_INFO_CAPS, VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE,
};
use crate::{Error, IovaRange, Result};

ioctl_io_nr!(VFIO_GET_API_VERSION, VFIO_TYPE, VFIO_BASE);
ioctl_io_nr!(VFIO_CHECK_EXTENSION, VFIO_TYPE, VFIO_BASE + 1);
ioctl_io_nr!(VFIO_SET_IOMMU, VFIO_TYPE, VFIO_BASE + 2);
ioctl_io_nr!(VFIO_GROUP_GET_STATUS, VFIO_TYPE, VFIO_BASE + 3);
ioctl_io_nr!(VFIO_GROUP_SET_CONTAINER, VFIO_TYPE, VFIO_BASE + 4);
ioctl_io_nr!(VFIO_GROUP_UNSET_CONTAINER, VFIO_TYPE, VFIO_BASE + 5);
ioctl_io_nr!(VFIO_GROUP_GET_DEVICE_FD, VFIO_TYPE, VFIO_BASE + 6);
ioctl_io_nr!(VFIO_IOMMU_GET_INFO, VFIO_TYPE, VFIO_BASE + 12);
ioctl_io_nr!(VFIO_IOMMU_MAP_DMA, VFIO_TYPE, VFIO_BASE + 13);
ioctl_io_nr!(VFIO_IOMMU_UNMAP_DMA, VFIO_TYPE, VFIO_BASE + 14);

/// Legacy group-based IOMMU backend.
pub struct VfioBackend {
    container: File,
    group: File,
    device: File,
    ranges: Vec<IovaRange>,
}

impl VfioBackend {
    /// Open the device at `sysfs_path` (e.g.
    /// `/sys/bus/pci/devices/0000:01:00.0`) through its VFIO group.
    pub fn open(sysfs_path: &Path) -> Result<Self> {
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(Error::OpenContainer)?;

        // SAFETY: the descriptor is a vfio container fd and the ioctl is
        // defined by the kernel.
        let ret = unsafe { ioctl(&container, VFIO_GET_API_VERSION()) };
        if ret as u32 != VFIO_API_VERSION {
            return Err(Error::ApiVersion);
        }

        // SAFETY: as above, with a plain value argument.
        let ret = unsafe { ioctl_with_val(&container, VFIO_CHECK_EXTENSION(), VFIO_TYPE1_IOMMU.into()) };
        if ret != 1 {
            return Err(Error::NoType1Iommu);
        }

        let group = Self::open_group(sysfs_path)?;

        let container_fd = container.as_raw_fd();
        // SAFETY: both descriptors are owned by us and stay open across the
        // call.
        let ret = unsafe { ioctl_with_ref(&group, VFIO_GROUP_SET_CONTAINER(), &container_fd) };
        if ret < 0 {
            return Err(Error::GroupSetContainer(io::Error::last_os_error()));
        }

        // SAFETY: the container now holds a group, as SET_IOMMU requires.
        let ret = unsafe { ioctl_with_val(&container, VFIO_SET_IOMMU(), VFIO_TYPE1_IOMMU.into()) };
        if ret < 0 {
            return Err(Error::SetIommu(io::Error::last_os_error()));
        }

        let ranges = query_iova_ranges(&container)?;

        let device = Self::get_device(&group, sysfs_path)?;

        Ok(VfioBackend {
            container,
            group,
            device,
            ranges,
        })
    }

    fn open_group(sysfs_path: &Path) -> Result<File> {
        let link = sysfs_path.join("iommu_group").read_link().map_err(|_| Error::InvalidPath)?;
        let id = link
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or(Error::InvalidPath)?;

        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/vfio/{id}"))
            .map_err(Error::OpenGroup)?;

        let mut status = vfio_group_status {
            argsz: size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        // SAFETY: we own the group descriptor and the status struct outlives
        // the call.
        let ret = unsafe { ioctl_with_mut_ref(&group, VFIO_GROUP_GET_STATUS(), &mut status) };
        if ret < 0 {
            return Err(Error::GroupStatus(io::Error::last_os_error()));
        }

        if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(Error::GroupNotViable);
        }

        Ok(group)
    }

    fn get_device(group: &File, sysfs_path: &Path) -> Result<File> {
        let name = sysfs_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(Error::InvalidPath)?;
        let name = CString::new(name).map_err(|_| Error::InvalidPath)?;

        // SAFETY: name is a valid nul-terminated string that outlives the
        // call.
        let fd = unsafe { ioctl_with_ptr(group, VFIO_GROUP_GET_DEVICE_FD(), name.as_ptr()) };
        if fd < 0 {
            return Err(Error::GetDeviceFd(io::Error::last_os_error()));
        }

        // SAFETY: the kernel just handed us this descriptor and nothing else
        // owns it.
        Ok(unsafe { File::from_raw_fd(fd) })
    }
}

impl IommuBackend for VfioBackend {
    fn map_dma(&self, vaddr: u64, iova: u64, len: u64) -> Result<()> {
        let dma_map = vfio_iommu_type1_dma_map {
            argsz: size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags: VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE,
            vaddr,
            iova,
            size: len,
        };

        // SAFETY: dma_map is fully initialized and outlives the call.
        let ret = unsafe { ioctl_with_ref(&self.container, VFIO_IOMMU_MAP_DMA(), &dma_map) };
        if ret != 0 {
            return Err(Error::DmaMap(io::Error::last_os_error()));
        }

        Ok(())
    }

    fn unmap_dma(&self, iova: u64, len: u64) -> Result<()> {
        let mut dma_unmap = vfio_iommu_type1_dma_unmap {
            argsz: size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            flags: 0,
            iova,
            size: len,
        };

        // SAFETY: dma_unmap is fully initialized and outlives the call.
        let ret = unsafe { ioctl_with_mut_ref(&self.container, VFIO_IOMMU_UNMAP_DMA(), &mut dma_unmap) };
        if ret != 0 {
            return Err(Error::DmaUnmap(io::Error::last_os_error()));
        }

        if dma_unmap.size != len {
            return Err(Error::DmaUnmap(io::Error::new(
                io::ErrorKind::Other,
                "partial unmap",
            )));
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

impl Drop for VfioBackend {
    fn drop(&mut self) {
        let container_fd = self.container.as_raw_fd();

        // SAFETY: both descriptors are still open; the result only matters
        // for diagnostics.
        let ret = unsafe { ioctl_with_ref(&self.group, VFIO_GROUP_UNSET_CONTAINER(), &container_fd) };
        if ret < 0 {
            error!("failed to unset container for group");
        }
    }
}

fn query_iova_ranges(container: &File) -> Result<Vec<IovaRange>> {
    let mut info = vfio_iommu_type1_info {
        argsz: size_of::<vfio_iommu_type1_info>() as u32,
        ..Default::default()
    };

    // SAFETY: info is fully initialized and outlives the call.
    let ret = unsafe { ioctl_with_mut_ref(container, VFIO_IOMMU_GET_INFO(), &mut info) };
    if ret < 0 {
        return Err(Error::IommuInfo(io::Error::last_os_error()));
    }

    // No extended info, so no capability chain to walk.
    if info.argsz as usize <= size_of::<vfio_iommu_type1_info>() {
        return Ok(Vec::new());
    }

    let argsz = info.argsz as usize;
    let mut buf = vec_with_size_in_bytes::<u64>(argsz);
    let info_ptr = buf.as_mut_ptr() as *mut vfio_iommu_type1_info;
    // SAFETY: the buffer is at least argsz bytes and 8-byte aligned.
    unsafe {
        (*info_ptr).argsz = argsz as u32;
    }

    // SAFETY: the pointer addresses argsz writable bytes for the kernel to
    // fill in.
    let ret = unsafe { ioctl_with_ptr(container, VFIO_IOMMU_GET_INFO(), info_ptr) };
    if ret < 0 {
        return Err(Error::IommuInfo(io::Error::last_os_error()));
    }

    // SAFETY: the kernel initialized the header on success.
    let info = unsafe { *info_ptr };
    if info.flags & VFIO_IOMMU_INFO_CAPS == 0 || info.cap_offset == 0 {
        return Ok(Vec::new());
    }

    // SAFETY: buf holds at least argsz initialized bytes.
    let bytes = unsafe { slice::from_raw_parts(buf.as_ptr() as *const u8, argsz) };

    Ok(parse_iova_range_caps(bytes, info.cap_offset as usize))
}

/// Walk the capability chain appended to the IOMMU info and collect the
/// permitted IOVA ranges. Offsets are relative to the start of `buf`.
fn parse_iova_range_caps(buf: &[u8], mut offset: usize) -> Vec<IovaRange> {
    let mut ranges = Vec::new();

    let read_u64 = |off: usize| u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap());

    while offset != 0 {
        if offset + 8 > buf.len() {
            warn!("truncated iommu info capability header at {:#x}", offset);
            break;
        }

        let id = u16::from_ne_bytes(buf[offset..offset + 2].try_into().unwrap());
        let next = u32::from_ne_bytes(buf[offset + 4..offset + 8].try_into().unwrap()) as usize;

        if id == VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE {
            if offset + 16 > buf.len() {
                warn!("truncated iova range capability at {:#x}", offset);
                break;
            }

            let nr_iovas =
                u32::from_ne_bytes(buf[offset + 8..offset + 12].try_into().unwrap()) as usize;

            let mut entry = offset + 16;
            for _ in 0..nr_iovas {
                if entry + 16 > buf.len() {
                    warn!("truncated iova range capability at {:#x}", offset);
                    break;
                }

                ranges.push(IovaRange {
                    start: read_u64(entry),
                    last: read_u64(entry + 8),
                });

                entry += 16;
            }
        }

        offset = next;
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_cap_header(buf: &mut Vec<u8>, id: u16, next: u32) {
        buf.extend_from_slice(&id.to_ne_bytes());
        buf.extend_from_slice(&1u16.to_ne_bytes());
        buf.extend_from_slice(&next.to_ne_bytes());
    }

    #[test]
    fn parses_iova_ranges_from_capability_chain() {
        // Header space the kernel would occupy with the info struct itself.
        let mut buf = vec![0u8; 24];

        // An unrelated capability first, chaining to the range capability.
        push_cap_header(&mut buf, 7, 40);
        buf.extend_from_slice(&[0u8; 8]);

        push_cap_header(&mut buf, VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE, 0);
        buf.extend_from_slice(&2u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0x10000u64.to_ne_bytes());
        buf.extend_from_slice(&0xfedf_ffffu64.to_ne_bytes());
        buf.extend_from_slice(&0xfef0_0000u64.to_ne_bytes());
        buf.extend_from_slice(&0x7f_ffff_ffffu64.to_ne_bytes());

        let ranges = parse_iova_range_caps(&buf, 24);

        assert_eq!(
            ranges,
            vec![
                IovaRange {
                    start: 0x10000,
                    last: 0xfedf_ffff
                },
                IovaRange {
                    start: 0xfef0_0000,
                    last: 0x7f_ffff_ffff
                },
            ]
        );
    }

    #[test]
    fn malformed_chain_is_cut_short() {
        let mut buf = vec![0u8; 24];
        push_cap_header(&mut buf, VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE, 0);
        buf.extend_from_slice(&100u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0x10000u64.to_ne_bytes());
        buf.extend_from_slice(&0x1ffffu64.to_ne_bytes());

        // Only one complete entry despite the advertised count.
        assert_eq!(parse_iova_range_caps(&buf, 24).len(), 1);

        // Out-of-bounds chain offset yields nothing.
        assert!(parse_iova_range_caps(&buf, buf.len() + 8).is_empty());
    }
}
