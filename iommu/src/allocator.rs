// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! IOVA allocation from the kernel-permitted ranges.
//!
//! A single bump cursor walks the ordered ranges. Sticky allocations stay
//! valid until explicitly unmapped and are never recycled. Ephemeral
//! allocations share the cursor but are counted; when the count drains to
//! zero the cursor rewinds to where the first outstanding ephemeral started,
//! so short-lived command buffers do not fragment the sticky space.

use std::sync::Mutex;

use crate::{Error, IovaRange, Result, Runtime};

/// Fallback when the backend reports no permitted ranges.
pub(crate) const IOVA_MIN: u64 = 0x10000;
pub(crate) const IOVA_MAX_39BITS: u64 = 1 << 39;

/// The live-ephemeral count shares the cursor's critical section: the 0 → 1
/// watermark capture and the 1 → 0 rewind must each be atomic with the
/// count transition that triggers them, or a concurrent allocation could
/// replace the watermark between the two steps.
struct Cursor {
    next: u64,
    nephemeral: u32,
    ephemeral_watermark: u64,
}

pub struct IovaAllocator {
    page_size: u64,
    ranges: Vec<IovaRange>,
    cursor: Mutex<Cursor>,
}

impl IovaAllocator {
    /// Build an allocator over `ranges`. An empty list falls back to the
    /// conservative `[IOVA_MIN, 2^39 - 1]` default.
    pub fn new(runtime: &Runtime, mut ranges: Vec<IovaRange>) -> Self {
        if ranges.is_empty() {
            ranges.push(IovaRange {
                start: IOVA_MIN,
                last: IOVA_MAX_39BITS - 1,
            });
        }

        ranges.sort_unstable_by_key(|r| r.start);

        let next = ranges[0].start;

        IovaAllocator {
            page_size: runtime.page_size() as u64,
            ranges,
            cursor: Mutex::new(Cursor {
                next,
                nephemeral: 0,
                ephemeral_watermark: 0,
            }),
        }
    }

    pub fn ranges(&self) -> &[IovaRange] {
        &self.ranges
    }

    fn place(&self, cursor: &mut Cursor, len: u64) -> Result<u64> {
        for r in &self.ranges {
            if r.last < cursor.next {
                continue;
            }

            let next = cursor.next.max(r.start);
            if next > r.last || r.last - next + 1 < len {
                continue;
            }

            cursor.next = next + len;

            return Ok(next);
        }

        Err(Error::NoIovaSpace)
    }

    fn check_len(&self, len: u64) -> Result<()> {
        if len == 0 || len & (self.page_size - 1) != 0 {
            debug!("allocation length {:#x} is not page aligned", len);
            return Err(Error::InvalidLength);
        }

        Ok(())
    }

    /// Allocate an IOVA that stays valid until the caller unmaps it.
    pub fn sticky(&self, len: u64) -> Result<u64> {
        self.check_len(len)?;

        let mut cursor = self.cursor.lock().unwrap();

        self.place(&mut cursor, len)
    }

    /// Allocate an IOVA that is only valid until the owning command
    /// completes. The caller must pair this with [`ephemeral_release`].
    ///
    /// [`ephemeral_release`]: IovaAllocator::ephemeral_release
    pub fn ephemeral(&self, len: u64) -> Result<u64> {
        self.check_len(len)?;

        let mut cursor = self.cursor.lock().unwrap();

        let iova = self.place(&mut cursor, len)?;

        cursor.nephemeral += 1;
        if cursor.nephemeral == 1 {
            cursor.ephemeral_watermark = iova;
        }

        Ok(iova)
    }

    /// Drop one ephemeral reference. The 1 → 0 transition rewinds the bump
    /// cursor to the watermark captured when the first ephemeral was taken,
    /// recycling everything allocated past it.
    pub fn ephemeral_release(&self) {
        let mut cursor = self.cursor.lock().unwrap();

        cursor.nephemeral -= 1;
        if cursor.nephemeral == 0 {
            cursor.next = cursor.ephemeral_watermark;
            cursor.ephemeral_watermark = 0;
        }
    }

    #[cfg(test)]
    fn next(&self) -> u64 {
        self.cursor.lock().unwrap().next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        Runtime::new()
    }

    fn allocator(ranges: &[(u64, u64)]) -> IovaAllocator {
        IovaAllocator::new(
            &runtime(),
            ranges
                .iter()
                .map(|&(start, last)| IovaRange { start, last })
                .collect(),
        )
    }

    #[test]
    fn sticky_bumps_through_default_range() {
        let alloc = allocator(&[]);

        assert_eq!(alloc.sticky(4096).unwrap(), 0x10000);
        assert_eq!(alloc.sticky(8192).unwrap(), 0x11000);
        assert_eq!(alloc.sticky(4096).unwrap(), 0x13000);
    }

    #[test]
    fn sticky_rejects_unaligned_length() {
        let alloc = allocator(&[]);

        assert!(matches!(alloc.sticky(0), Err(Error::InvalidLength)));
        assert!(matches!(alloc.sticky(512), Err(Error::InvalidLength)));
    }

    #[test]
    fn sticky_skips_to_next_range() {
        let alloc = allocator(&[(0x10000, 0x10fff), (0x40000, 0x4ffff)]);

        assert_eq!(alloc.sticky(4096).unwrap(), 0x10000);
        // First range is exhausted, placement hops to the second.
        assert_eq!(alloc.sticky(4096).unwrap(), 0x40000);
    }

    #[test]
    fn sticky_exact_fit_succeeds_and_overcommit_fails() {
        let alloc = allocator(&[(0x10000, 0x10fff)]);
        assert_eq!(alloc.sticky(4096).unwrap(), 0x10000);
        assert!(matches!(alloc.sticky(4096), Err(Error::NoIovaSpace)));

        let alloc = allocator(&[(0x10000, 0x10fff)]);
        assert!(matches!(alloc.sticky(8192), Err(Error::NoIovaSpace)));
    }

    #[test]
    fn ephemeral_drain_rewinds_cursor() {
        let alloc = allocator(&[]);

        assert_eq!(alloc.sticky(4096).unwrap(), 0x10000);
        assert_eq!(alloc.sticky(8192).unwrap(), 0x11000);

        assert_eq!(alloc.ephemeral(4096).unwrap(), 0x13000);
        assert_eq!(alloc.ephemeral(4096).unwrap(), 0x14000);

        alloc.ephemeral_release();
        // One ephemeral still outstanding, no rewind yet.
        assert_eq!(alloc.next(), 0x15000);

        alloc.ephemeral_release();
        assert_eq!(alloc.next(), 0x13000);

        assert_eq!(alloc.sticky(4096).unwrap(), 0x13000);
    }

    #[test]
    fn concurrent_ephemerals_never_overlap_and_drain_rewinds() {
        use std::sync::Arc;
        use std::thread;

        let alloc = Arc::new(allocator(&[]));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(thread::spawn(move || {
                (0..64)
                    .map(|_| alloc.ephemeral(4096).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut iovas: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        iovas.sort_unstable();
        let first = iovas[0];
        iovas.dedup();
        assert_eq!(iovas.len(), 4 * 64);

        // Every allocation was live at once, so the watermark is the lowest
        // IOVA handed out; draining rewinds the cursor to it.
        for _ in 0..4 * 64 {
            alloc.ephemeral_release();
        }

        assert_eq!(alloc.next(), first);
    }

    #[test]
    fn watermark_recaptured_on_next_first_ephemeral() {
        let alloc = allocator(&[]);

        assert_eq!(alloc.ephemeral(4096).unwrap(), 0x10000);
        alloc.ephemeral_release();
        assert_eq!(alloc.next(), 0x10000);

        assert_eq!(alloc.sticky(4096).unwrap(), 0x10000);
        assert_eq!(alloc.ephemeral(4096).unwrap(), 0x11000);
        alloc.ephemeral_release();
        assert_eq!(alloc.next(), 0x11000);
    }
}
