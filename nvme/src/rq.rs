// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Request slots and PRP assembly.
//!
//! Every submission queue owns `qsize − 1` request slots, each carrying a
//! preallocated command identifier and a page-sized PRP list of its own.
//! Slots are popped from and pushed to a lock-free free list; a command
//! identifier is never aliased across two in-flight commands.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::types::{CqEntry, SqEntry};
use crate::{Error, Result};

pub(crate) type AerHandler = Box<dyn Fn(&CqEntry) + Send>;

pub(crate) struct Slot {
    pub(crate) cid: u16,
    pub(crate) prp_list: *mut u64,
    pub(crate) prp_list_iova: u64,
    pub(crate) handler: Option<AerHandler>,
    next: AtomicPtr<Slot>,
}

/// An acquired request slot. Holding the token is ownership: the slot's cid
/// and PRP list belong to the holder until the token is consumed by a wait,
/// a release, or an orphaning timeout.
pub struct Request {
    pub(crate) slot: NonNull<Slot>,
}

// SAFETY: a popped slot is owned exclusively through the token.
unsafe impl Send for Request {}

impl Request {
    pub fn cid(&self) -> u16 {
        self.slot().cid
    }

    pub(crate) fn slot(&self) -> &Slot {
        // SAFETY: the token owns the slot; the pool hands each slot to at
        // most one token at a time.
        unsafe { self.slot.as_ref() }
    }

    pub(crate) fn slot_mut(&mut self) -> &mut Slot {
        // SAFETY: as above, with the exclusivity of &mut self.
        unsafe { self.slot.as_mut() }
    }
}

/// The free list: a Treiber stack threaded through the slots themselves.
pub(crate) struct SlotPool {
    slots: Box<[UnsafeCell<Slot>]>,
    top: AtomicPtr<Slot>,
}

// SAFETY: slots move between the shared stack and exactly one owner at a
// time; the stack transfers ownership through the atomic top pointer.
unsafe impl Send for SlotPool {}
// SAFETY: as above.
unsafe impl Sync for SlotPool {}

impl SlotPool {
    /// Build `count` slots whose PRP lists are consecutive pages starting at
    /// `prp_base`/`prp_iova`.
    pub(crate) fn new(count: u16, prp_base: *mut u8, prp_iova: u64, page_size: usize) -> Self {
        let mut slots = Vec::with_capacity(count as usize);

        for i in 0..count {
            let offset = i as usize * page_size;

            // SAFETY: the caller provides count pages at prp_base.
            let prp_list = unsafe { prp_base.add(offset) } as *mut u64;

            slots.push(UnsafeCell::new(Slot {
                cid: i,
                prp_list,
                prp_list_iova: prp_iova + offset as u64,
                handler: None,
                next: AtomicPtr::new(ptr::null_mut()),
            }));
        }

        let pool = SlotPool {
            slots: slots.into_boxed_slice(),
            top: AtomicPtr::new(ptr::null_mut()),
        };

        for cell in pool.slots.iter() {
            pool.push(cell.get());
        }

        pool
    }

    pub(crate) fn acquire(&self) -> Option<Request> {
        loop {
            let top = self.top.load(Ordering::Acquire);
            if top.is_null() {
                return None;
            }

            // SAFETY: a non-null top is a live slot currently owned by the
            // stack; its next pointer is only written while on the stack.
            let next = unsafe { (*top).next.load(Ordering::Relaxed) };

            if self
                .top
                .compare_exchange_weak(top, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return NonNull::new(top).map(|slot| Request { slot });
            }
        }
    }

    pub(crate) fn release(&self, rq: Request) {
        self.push(rq.slot.as_ptr());
    }

    /// Return the slot with command identifier `cid` to the free list
    /// without a token. Only valid for slots whose token was surrendered to
    /// the queue (orphaned or asynchronous-event slots).
    pub(crate) fn release_cid(&self, cid: u16) {
        self.push(self.slots[cid as usize].get());
    }

    pub(crate) fn slot_ptr(&self, cid: u16) -> *mut Slot {
        self.slots[cid as usize].get()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&self, slot: *mut Slot) {
        loop {
            let top = self.top.load(Ordering::Acquire);

            // SAFETY: until the exchange succeeds the slot is exclusively
            // ours, so the next pointer can be staged freely.
            unsafe { (*slot).next.store(top, Ordering::Relaxed) };

            if self
                .top
                .compare_exchange_weak(top, slot, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// Fill `cmd`'s data-pointer fields so the device can DMA `len` bytes at
/// `iova`, spilling into the slot's PRP list when the transfer crosses
/// enough page boundaries.
pub(crate) fn map_prp(
    rq: &mut Request,
    cmd: &mut SqEntry,
    iova: u64,
    len: u64,
    page_shift: u32,
) -> Result<()> {
    let page_size = 1u64 << page_shift;
    let max_prps = page_size / 8 + 1;
    let prp_list = rq.slot().prp_list;

    let mut prpcount = len >> page_shift;

    cmd.prp1 = iova.to_le();

    // An unaligned start address pushes the tail of the buffer one page
    // further; aligning the base down keeps the list entries page aligned.
    let mut base = iova;
    if prpcount > 0 && iova & (page_size - 1) != 0 {
        base = iova & !(page_size - 1);
        prpcount += 1;
    }

    if prpcount > max_prps {
        return Err(Error::PrpListFull);
    }

    for i in 1..prpcount {
        // SAFETY: the PRP list page holds page_size / 8 entries and
        // prpcount was bounded against max_prps above.
        unsafe { *prp_list.add(i as usize - 1) = (base + (i << page_shift)).to_le() };
    }

    cmd.prp2 = if prpcount == 2 {
        // SAFETY: entry 0 was written above.
        unsafe { *prp_list }
    } else if prpcount > 2 {
        rq.slot().prp_list_iova.to_le()
    } else {
        0
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPS: u32 = 12;
    const LIST_IOVA: u64 = 0x800_0000;

    fn slot(page: &mut Vec<u64>) -> Slot {
        Slot {
            cid: 0,
            prp_list: page.as_mut_ptr(),
            prp_list_iova: LIST_IOVA,
            handler: None,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn prps(iova: u64, len: u64) -> (u64, u64, Vec<u64>) {
        let mut page = vec![0u64; 512];
        let mut slot = slot(&mut page);
        let mut rq = Request {
            slot: NonNull::from(&mut slot),
        };
        let mut cmd = SqEntry::default();

        map_prp(&mut rq, &mut cmd, iova, len, MPS).unwrap();

        (
            u64::from_le(cmd.prp1),
            u64::from_le(cmd.prp2),
            page.iter().map(|&e| u64::from_le(e)).collect(),
        )
    }

    #[test]
    fn aligned_single_page_or_less() {
        let (prp1, prp2, _) = prps(0x100_0000, 0x200);
        assert_eq!((prp1, prp2), (0x100_0000, 0));

        let (prp1, prp2, _) = prps(0x100_0000, 0x1000);
        assert_eq!((prp1, prp2), (0x100_0000, 0));
    }

    #[test]
    fn aligned_two_pages_uses_prp2_directly() {
        let (prp1, prp2, _) = prps(0x100_0000, 0x2000);
        assert_eq!((prp1, prp2), (0x100_0000, 0x100_1000));
    }

    #[test]
    fn aligned_three_pages_uses_the_list() {
        let (prp1, prp2, list) = prps(0x100_0000, 0x3000);
        assert_eq!((prp1, prp2), (0x100_0000, LIST_IOVA));
        assert_eq!(&list[..2], &[0x100_1000, 0x100_2000]);
    }

    #[test]
    fn unaligned_sub_page_stays_single_prp() {
        let (prp1, prp2, _) = prps(0x100_0004, 0x200);
        assert_eq!((prp1, prp2), (0x100_0004, 0));

        let (prp1, prp2, _) = prps(0x100_0004, 0x1000 - 4);
        assert_eq!((prp1, prp2), (0x100_0004, 0));
    }

    #[test]
    fn unaligned_page_crossers_get_an_extra_prp() {
        let (prp1, prp2, _) = prps(0x100_0004, 0x1000);
        assert_eq!((prp1, prp2), (0x100_0004, 0x100_1000));

        let (prp1, prp2, _) = prps(0x100_0004, 0x2000 - 4);
        assert_eq!((prp1, prp2), (0x100_0004, 0x100_1000));

        let (prp1, prp2, list) = prps(0x100_0004, 0x2000);
        assert_eq!((prp1, prp2), (0x100_0004, LIST_IOVA));
        assert_eq!(&list[..2], &[0x100_1000, 0x100_2000]);

        let (prp1, prp2, list) = prps(0x100_0004, 0x3000);
        assert_eq!((prp1, prp2), (0x100_0004, LIST_IOVA));
        assert_eq!(&list[..3], &[0x100_1000, 0x100_2000, 0x100_3000]);
    }

    #[test]
    fn oversized_transfer_fails() {
        let mut page = vec![0u64; 512];
        let mut slot = slot(&mut page);
        let mut rq = Request {
            slot: NonNull::from(&mut slot),
        };
        let mut cmd = SqEntry::default();

        // 513 pages fit (one PRP1 plus a full list); 514 do not.
        assert!(map_prp(&mut rq, &mut cmd, 0x100_0000, 513 * 0x1000, MPS).is_ok());
        assert!(matches!(
            map_prp(&mut rq, &mut cmd, 0x100_0000, 514 * 0x1000, MPS),
            Err(Error::PrpListFull)
        ));
    }

    #[test]
    fn pool_hands_out_each_slot_once() {
        let mut pages = vec![0u8; 4 * 4096];
        let pool = SlotPool::new(4, pages.as_mut_ptr(), 0x1_0000, 4096);

        let mut cids = Vec::new();
        while let Some(rq) = pool.acquire() {
            cids.push(rq.cid());
            std::mem::forget(rq);
        }

        cids.sort_unstable();
        assert_eq!(cids, vec![0, 1, 2, 3]);

        pool.release_cid(2);
        let rq = pool.acquire().unwrap();
        assert_eq!(rq.cid(), 2);
        pool.release(rq);
    }
}
