// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The IOMMU context: one index, one allocator, one kernel backend.

use std::path::Path;
use std::sync::Arc;

use crate::{
    IommuBackend, IommufdBackend, IovaAllocator, IovaIndex, Mapping, Result, Runtime, VfioBackend,
};

/// iommufd needs the device character devices enabled
/// (CONFIG_VFIO_DEVICE_CDEV=y); without them /dev/vfio/devices does not
/// exist and only the legacy flow can work.
fn iommufd_broken() -> bool {
    if Path::new("/dev/vfio/devices").is_dir() {
        return false;
    }

    info!("iommufd unusable; probably missing CONFIG_VFIO_DEVICE_CDEV=y");

    true
}

/// Brokers virtual-address to IOVA translation for one passthrough device.
///
/// Sticky mappings installed with [`map`] stay valid and translatable until
/// [`unmap`]. Ephemeral mappings installed with [`map_ephemeral`] are not
/// indexed; their IOVA space is recycled once the last one is released.
///
/// [`map`]: IommuContext::map
/// [`unmap`]: IommuContext::unmap
/// [`map_ephemeral`]: IommuContext::map_ephemeral
pub struct IommuContext {
    runtime: Runtime,
    backend: Box<dyn IommuBackend>,
    index: IovaIndex,
    allocator: IovaAllocator,
}

impl IommuContext {
    /// Open the device at `sysfs_path`, probing for a usable iommufd and
    /// falling back to the legacy group flow.
    pub fn open(runtime: Runtime, sysfs_path: &Path) -> Result<Arc<Self>> {
        let backend: Box<dyn IommuBackend> = if iommufd_broken() {
            Box::new(VfioBackend::open(sysfs_path)?)
        } else {
            Box::new(IommufdBackend::open(sysfs_path)?)
        };

        Ok(Arc::new(Self::with_backend(runtime, backend)))
    }

    /// Build a context over a caller-supplied backend.
    pub fn with_backend(runtime: Runtime, backend: Box<dyn IommuBackend>) -> Self {
        let allocator = IovaAllocator::new(&runtime, backend.iova_ranges().to_vec());

        IommuContext {
            runtime,
            backend,
            index: IovaIndex::new(),
            allocator,
        }
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    pub fn backend(&self) -> &dyn IommuBackend {
        self.backend.as_ref()
    }

    /// Map `len` bytes at `vaddr` for DMA and return the IOVA. If a sticky
    /// mapping already covers all of `[vaddr, vaddr + len)`, its IOVA is
    /// returned instead of creating a second mapping.
    pub fn map(&self, vaddr: u64, len: u64) -> Result<u64> {
        if let Some(m) = self.index.find(vaddr) {
            if vaddr.saturating_add(len) <= m.vaddr.saturating_add(m.len) {
                return Ok(m.iova + (vaddr - m.vaddr));
            }
        }

        let iova = self.allocator.sticky(len)?;

        self.backend.map_dma(vaddr, iova, len)?;

        if let Err(e) = self.index.insert(vaddr, len, iova) {
            debug!("failed to index mapping at {:#x}: {}", vaddr, e);

            // The kernel holds the translation but nothing can ever look it
            // up; take it back down before surfacing the error.
            if let Err(e) = self.backend.unmap_dma(iova, len) {
                warn!("failed to roll back mapping at iova {:#x}: {}", iova, e);
            }

            return Err(e);
        }

        Ok(iova)
    }

    /// Remove the mapping containing `vaddr`. Unmapping an address with no
    /// mapping is not an error.
    pub fn unmap(&self, vaddr: u64) -> Result<()> {
        let m = match self.index.find(vaddr) {
            Some(m) => m,
            None => return Ok(()),
        };

        self.backend.unmap_dma(m.iova, m.len)?;

        let _ = self.index.remove(m.vaddr);

        Ok(())
    }

    /// Map `len` bytes at `vaddr` for the lifetime of one command. The
    /// mapping is not indexed; the caller owns the returned IOVA and must
    /// pass it back to [`unmap_ephemeral`].
    ///
    /// [`unmap_ephemeral`]: IommuContext::unmap_ephemeral
    pub fn map_ephemeral(&self, vaddr: u64, len: u64) -> Result<u64> {
        let iova = self.allocator.ephemeral(len)?;

        if let Err(e) = self.backend.map_dma(vaddr, iova, len) {
            self.allocator.ephemeral_release();
            return Err(e);
        }

        Ok(iova)
    }

    /// Remove an ephemeral mapping and release its IOVA reservation.
    pub fn unmap_ephemeral(&self, iova: u64, len: u64) -> Result<()> {
        self.backend.unmap_dma(iova, len)?;

        self.allocator.ephemeral_release();

        Ok(())
    }

    /// Translate `vaddr` to the IOVA a device must use to reach it.
    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        self.index.translate(vaddr)
    }
}

impl Drop for IommuContext {
    fn drop(&mut self) {
        let backend = &self.backend;

        self.index.clear_with(|m: &Mapping| {
            if let Err(e) = backend.unmap_dma(m.iova, m.len) {
                warn!(
                    "failed to unmap dma: iova {:#x} len {:#x}: {}",
                    m.iova, m.len, e
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, IovaRange};
    use std::os::unix::io::RawFd;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestBackend {
        ranges: Vec<IovaRange>,
        mapped: Mutex<Vec<(u64, u64, u64)>>,
        fail_map: bool,
    }

    impl TestBackend {
        fn with_ranges(ranges: &[(u64, u64)]) -> Self {
            TestBackend {
                ranges: ranges
                    .iter()
                    .map(|&(start, last)| IovaRange { start, last })
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl IommuBackend for TestBackend {
        fn map_dma(&self, vaddr: u64, iova: u64, len: u64) -> Result<()> {
            if self.fail_map {
                return Err(Error::DmaMap(std::io::Error::from_raw_os_error(
                    libc::ENOMEM,
                )));
            }

            self.mapped.lock().unwrap().push((vaddr, iova, len));
            Ok(())
        }

        fn unmap_dma(&self, iova: u64, len: u64) -> Result<()> {
            self.mapped
                .lock()
                .unwrap()
                .retain(|&(_, i, l)| (i, l) != (iova, len));
            Ok(())
        }

        fn iova_ranges(&self) -> &[IovaRange] {
            &self.ranges
        }

        fn device_fd(&self) -> RawFd {
            -1
        }
    }

    fn context(backend: TestBackend) -> IommuContext {
        IommuContext::with_backend(Runtime::new(), Box::new(backend))
    }

    #[test]
    fn map_translate_unmap() {
        let ctx = context(TestBackend::with_ranges(&[(0x10000, 0x7f_ffff_ffff)]));

        let iova = ctx.map(0x7f00_0000_0000, 4096).unwrap();
        assert_eq!(iova, 0x10000);

        assert_eq!(ctx.translate(0x7f00_0000_0008), Some(0x10008));

        ctx.unmap(0x7f00_0000_0000).unwrap();
        assert_eq!(ctx.translate(0x7f00_0000_0000), None);

        // Unmapping again is not an error.
        ctx.unmap(0x7f00_0000_0000).unwrap();
    }

    #[test]
    fn map_is_idempotent_for_covered_ranges() {
        let ctx = context(TestBackend::with_ranges(&[]));

        let iova = ctx.map(0x1000_0000, 8192).unwrap();
        assert_eq!(ctx.map(0x1000_0000, 8192).unwrap(), iova);
        assert_eq!(ctx.map(0x1000_1000, 4096).unwrap(), iova + 0x1000);
    }

    #[test]
    fn map_does_not_shortcut_a_partially_covered_range() {
        let ctx = context(TestBackend::with_ranges(&[]));

        let iova = ctx.map(0x1000_0000, 4096).unwrap();

        // The tail of the larger request is not mapped; returning the old
        // IOVA would under-map it. The overlapping remap is refused.
        assert!(matches!(
            ctx.map(0x1000_0000, 8192),
            Err(Error::Overlap)
        ));
        assert!(matches!(
            ctx.map(0x1000_0800, 4096),
            Err(Error::Overlap)
        ));

        // The original mapping is untouched.
        assert_eq!(ctx.translate(0x1000_0000), Some(iova));
        ctx.unmap(0x1000_0000).unwrap();
    }

    #[test]
    fn failed_kernel_map_releases_nothing_into_index() {
        let ctx = context(TestBackend {
            fail_map: true,
            ..Default::default()
        });

        assert!(ctx.map(0x1000_0000, 4096).is_err());
        assert_eq!(ctx.translate(0x1000_0000), None);
    }

    #[test]
    fn ephemeral_space_recycles_after_drain() {
        let ctx = context(TestBackend::with_ranges(&[]));

        assert_eq!(ctx.map(0x1000_0000, 4096).unwrap(), 0x10000);
        assert_eq!(ctx.map(0x2000_0000, 8192).unwrap(), 0x11000);

        let x = ctx.map_ephemeral(0x3000_0000, 4096).unwrap();
        let y = ctx.map_ephemeral(0x4000_0000, 4096).unwrap();
        assert_eq!(x, 0x13000);
        assert_eq!(y, 0x14000);

        ctx.unmap_ephemeral(x, 4096).unwrap();
        ctx.unmap_ephemeral(y, 4096).unwrap();

        assert_eq!(ctx.map(0x5000_0000, 4096).unwrap(), 0x13000);
    }

    #[test]
    fn ephemeral_map_failure_releases_reservation() {
        let ctx = context(TestBackend {
            fail_map: true,
            ..Default::default()
        });

        assert!(ctx.map_ephemeral(0x1000_0000, 4096).is_err());

        // The failed reservation did not pin the watermark: the next
        // ephemeral cycle rewinds to its own start.
        let ctx = context(TestBackend::with_ranges(&[]));
        assert!(matches!(
            ctx.map_ephemeral(0x1000_0000, 100),
            Err(Error::InvalidLength)
        ));
    }
}
