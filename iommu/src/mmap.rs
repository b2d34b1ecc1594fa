// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Page-aligned anonymous memory for DMA-able structures.

use std::ptr::null_mut;

use crate::{Error, Result, Runtime};

/// An anonymous, page-aligned, zero-filled mapping that calls `munmap()`
/// when dropped. Queue rings and PRP lists live in these; the region owns
/// its address range for its entire lifetime, so DMA mappings installed over
/// it stay valid until they are explicitly removed.
#[derive(Debug)]
pub struct MmapRegion {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the region is plain anonymous memory; the owner is responsible for
// coordinating access to its contents.
unsafe impl Send for MmapRegion {}
// SAFETY: as above.
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Map at least `len` bytes of anonymous memory, rounded up to the page
    /// size.
    pub fn anonymous(runtime: &Runtime, len: usize) -> Result<Self> {
        let len = runtime.page_align_up(len);

        // SAFETY: FFI call with a null hint and a length we control; the
        // result is checked before use.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(std::io::Error::last_os_error()));
        }

        Ok(MmapRegion {
            addr: addr as *mut u8,
            len,
        })
    }

    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// The mapping's base address as the opaque integer used by the mapping
    /// index and the kernel DMA interface.
    pub fn vaddr(&self) -> u64 {
        self.addr as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: addr/len describe a mapping created in anonymous() and not
        // released anywhere else.
        unsafe { assert_eq!(libc::munmap(self.addr as *mut _, self.len), 0) }
    }
}
