// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The port between the address-space manager and the kernel.
//!
//! Two kernel interfaces can install DMA mappings for a passthrough device:
//! the legacy VFIO group/container flow and the iommufd character device.
//! Both are driven through the same trait; the context picks one at
//! construction time.

use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};

use byteorder::{ByteOrder, LittleEndian};
use vfio_bindings::bindings::vfio::{
    vfio_irq_set, VFIO_IRQ_SET_ACTION_TRIGGER, VFIO_IRQ_SET_DATA_EVENTFD, VFIO_IRQ_SET_DATA_NONE,
    VFIO_PCI_MSIX_IRQ_INDEX,
};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_ref};
use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr};

use crate::{Error, IovaRange, Result};

pub(crate) const VFIO_TYPE: u32 = b';' as u32;
pub(crate) const VFIO_BASE: u32 = 100;

ioctl_io_nr!(VFIO_DEVICE_SET_IRQS, VFIO_TYPE, VFIO_BASE + 10);
ioctl_io_nr!(VFIO_DEVICE_RESET, VFIO_TYPE, VFIO_BASE + 11);

/// Kernel-side IOMMU passthrough interface.
///
/// `map_dma`/`unmap_dma` install and remove translations at IOVAs chosen by
/// the caller; placement policy lives entirely above this trait. Backends
/// without reset or eventfd interrupt support report `Unsupported`.
pub trait IommuBackend: Send + Sync {
    /// Install a translation of `len` bytes from `iova` to `vaddr`.
    fn map_dma(&self, vaddr: u64, iova: u64, len: u64) -> Result<()>;

    /// Remove the translation of `len` bytes at `iova`.
    fn unmap_dma(&self, iova: u64, len: u64) -> Result<()>;

    /// IOVA ranges the kernel permits for mapping. May be empty, in which
    /// case the caller falls back to a conservative default.
    fn iova_ranges(&self) -> &[IovaRange];

    /// The raw descriptor of the passthrough device, for region access by
    /// the layer that owns BAR mappings.
    fn device_fd(&self) -> RawFd;

    fn reset_device(&self) -> Result<()> {
        Err(Error::Unsupported("device reset"))
    }

    fn set_irqs(&self, _fds: &[&EventFd]) -> Result<()> {
        Err(Error::Unsupported("eventfd interrupts"))
    }

    fn disable_irqs(&self) -> Result<()> {
        Err(Error::Unsupported("eventfd interrupts"))
    }
}

// Returns a `Vec<T>` with a size in bytes at least as large as `size_in_bytes`.
pub(crate) fn vec_with_size_in_bytes<T: Default>(size_in_bytes: usize) -> Vec<T> {
    let rounded_size = (size_in_bytes + size_of::<T>() - 1) / size_of::<T>();
    let mut v = Vec::with_capacity(rounded_size);
    for _ in 0..rounded_size {
        v.push(T::default())
    }
    v
}

// Allocate a Vec<T> whose first element is usable as a T followed by space
// for `count` contiguous F entries, for ioctl structs ending in an
// incomplete array field.
pub(crate) fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    vec_with_size_in_bytes(vec_size_bytes)
}

/// `VFIO_DEVICE_RESET` on a device descriptor. Shared by both backends.
pub(crate) fn device_reset(device: &File) -> Result<()> {
    // SAFETY: the descriptor is a vfio device fd and the ioctl carries no
    // arguments.
    let ret = unsafe { ioctl(device, VFIO_DEVICE_RESET()) };
    if ret < 0 {
        return Err(Error::DeviceReset(io::Error::last_os_error()));
    }

    Ok(())
}

/// Trigger-wire the device's MSI-X vectors to the given eventfds.
pub(crate) fn device_set_irqs(device: &File, fds: &[&EventFd]) -> Result<()> {
    let mut irq_set = vec_with_array_field::<vfio_irq_set, u32>(fds.len());
    irq_set[0].argsz = (size_of::<vfio_irq_set>() + fds.len() * size_of::<u32>()) as u32;
    irq_set[0].flags = VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER;
    irq_set[0].index = VFIO_PCI_MSIX_IRQ_INDEX;
    irq_set[0].start = 0;
    irq_set[0].count = fds.len() as u32;

    // SAFETY: vec_with_array_field reserved space for fds.len() u32 entries
    // directly after the header.
    unsafe {
        let data = irq_set[0].data.as_mut_slice(fds.len() * size_of::<u32>());
        for (i, fd) in fds.iter().enumerate() {
            LittleEndian::write_u32(&mut data[i * 4..(i + 1) * 4], fd.as_raw_fd() as u32);
        }
    }

    // SAFETY: irq_set was assembled above and outlives the call.
    let ret = unsafe { ioctl_with_ref(device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
    if ret < 0 {
        return Err(Error::SetIrqs(io::Error::last_os_error()));
    }

    Ok(())
}

/// Remove all eventfd triggers from the device's MSI-X vectors.
pub(crate) fn device_disable_irqs(device: &File) -> Result<()> {
    let mut irq_set = vec_with_array_field::<vfio_irq_set, u32>(0);
    irq_set[0].argsz = size_of::<vfio_irq_set>() as u32;
    irq_set[0].flags = VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER;
    irq_set[0].index = VFIO_PCI_MSIX_IRQ_INDEX;
    irq_set[0].start = 0;
    irq_set[0].count = 0;

    // SAFETY: irq_set was assembled above and outlives the call.
    let ret = unsafe { ioctl_with_ref(device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
    if ret < 0 {
        return Err(Error::SetIrqs(io::Error::last_os_error()));
    }

    Ok(())
}
