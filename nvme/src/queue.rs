// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Submission/completion queue pairs.
//!
//! Rings live in DMA-mapped process memory; the controller reads SQEs and
//! writes CQEs by DMA, and the host moves the tail/head cursors through the
//! doorbell registers. Entry visibility is ordered by a Release fence before
//! every submission doorbell write and an Acquire fence after a phase-bit
//! match on the completion side.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use iommu::{IommuContext, MmapRegion};
use vm_memory::ByteValued;

use crate::mmio;
use crate::rq::{self, AerHandler, SlotPool};
use crate::types::{CqEntry, SqEntry, ADMIN_ASYNC_EVENT, CID_AER, CQE_SIZE, SQE_SIZE};
use crate::{Error, Request, Result};

/// MMIO addresses of one queue pair's tail and head doorbells.
#[derive(Clone, Copy, Debug)]
pub struct DoorbellPair {
    pub sq: *mut u32,
    pub cq: *mut u32,
}

struct Sq {
    ring: MmapRegion,
    iova: u64,
    qsize: u16,
    tail: u16,
    doorbell: *mut u32,
}

struct Cq {
    ring: MmapRegion,
    iova: u64,
    qsize: u16,
    head: u16,
    /// Phase bit a new entry at the current head must carry.
    phase: bool,
    doorbell: *mut u32,
}

impl Cq {
    fn poll_one(&mut self) -> Option<CqEntry> {
        // SAFETY: head is always below qsize and the ring holds qsize
        // entries.
        let entry = unsafe { self.ring.addr().add(self.head as usize * CQE_SIZE) };

        // The controller publishes an entry by writing its status word last;
        // the phase bit must be re-read from memory on every poll.
        // SAFETY: the status word is the u16 at entry offset 14.
        let status = u16::from_le(unsafe { ptr::read_volatile(entry.add(14) as *const u16) });
        if status & 0x1 != self.phase as u16 {
            return None;
        }

        // No reads from the entry may be speculated past the phase check.
        fence(Ordering::Acquire);

        // SAFETY: the entry is fully written once its phase bit matches.
        let cqe = unsafe { ptr::read(entry as *const CqEntry) };

        self.head += 1;
        if self.head == self.qsize {
            self.head = 0;
            self.phase = !self.phase;
        }

        // SAFETY: the doorbell points at this queue's head register.
        unsafe { mmio::write32(self.doorbell.cast(), self.head as u32) };

        Some(cqe)
    }
}

/// One NVMe submission/completion queue pair with its request-slot pool.
///
/// `qsize − 1` commands can be in flight at once; one ring entry is reserved
/// so that a full queue is distinguishable from an empty one. Submissions
/// from one caller are totally ordered; callers sharing a queue pair must
/// serialize externally.
pub struct QueuePair {
    ctx: Arc<IommuContext>,
    qid: u16,
    sq: Sq,
    cq: Cq,
    pool: SlotPool,
    prp_pages: MmapRegion,
    orphaned: HashSet<u16>,
    aer_outstanding: usize,
}

// SAFETY: the doorbell pointers address registers exclusive to this queue
// pair; everything else is owned.
unsafe impl Send for QueuePair {}

impl QueuePair {
    /// Allocate and DMA-map the rings and PRP pages for a queue pair of
    /// `qsize` entries.
    pub fn new(
        ctx: Arc<IommuContext>,
        qid: u16,
        qsize: u16,
        doorbells: DoorbellPair,
    ) -> Result<Self> {
        if qsize < 2 {
            return Err(Error::InvalidArgument("queue size must be at least 2"));
        }

        let rt = ctx.runtime();

        let cq_ring = MmapRegion::anonymous(&rt, qsize as usize * CQE_SIZE)?;
        let sq_ring = MmapRegion::anonymous(&rt, qsize as usize * SQE_SIZE)?;
        let prp_pages = MmapRegion::anonymous(&rt, (qsize as usize - 1) * rt.page_size())?;

        let cq_iova = ctx.map(cq_ring.vaddr(), cq_ring.len() as u64)?;

        let sq_iova = match ctx.map(sq_ring.vaddr(), sq_ring.len() as u64) {
            Ok(iova) => iova,
            Err(e) => {
                let _ = ctx.unmap(cq_ring.vaddr());
                return Err(e.into());
            }
        };

        let prp_iova = match ctx.map(prp_pages.vaddr(), prp_pages.len() as u64) {
            Ok(iova) => iova,
            Err(e) => {
                let _ = ctx.unmap(sq_ring.vaddr());
                let _ = ctx.unmap(cq_ring.vaddr());
                return Err(e.into());
            }
        };

        let pool = SlotPool::new(qsize - 1, prp_pages.addr(), prp_iova, rt.page_size());

        Ok(QueuePair {
            ctx,
            qid,
            sq: Sq {
                ring: sq_ring,
                iova: sq_iova,
                qsize,
                tail: 0,
                doorbell: doorbells.sq,
            },
            cq: Cq {
                ring: cq_ring,
                iova: cq_iova,
                qsize,
                head: 0,
                phase: true,
                doorbell: doorbells.cq,
            },
            pool,
            prp_pages,
            orphaned: HashSet::new(),
            aer_outstanding: 0,
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn qsize(&self) -> u16 {
        self.sq.qsize
    }

    pub(crate) fn sq_ring_iova(&self) -> u64 {
        self.sq.iova
    }

    pub(crate) fn cq_ring_iova(&self) -> u64 {
        self.cq.iova
    }

    /// Take a free request slot without blocking.
    pub fn acquire(&self) -> Result<Request> {
        self.pool.acquire().ok_or(Error::NoSlotAvailable)
    }

    /// Take a free request slot, spinning until one is released.
    pub fn acquire_wait(&self) -> Request {
        loop {
            if let Some(rq) = self.pool.acquire() {
                return rq;
            }

            std::hint::spin_loop();
        }
    }

    /// Return an unused slot to the free list.
    pub fn release(&self, rq: Request) {
        self.pool.release(rq);
    }

    /// Point `cmd` at `len` bytes of data at `iova`, using the slot's PRP
    /// list if the transfer needs one.
    pub fn map_prp(&self, rq: &mut Request, cmd: &mut SqEntry, iova: u64, len: u64) -> Result<()> {
        rq::map_prp(rq, cmd, iova, len, self.ctx.runtime().page_shift())
    }

    /// Stamp `cmd` with the slot's command identifier, post it, and ring the
    /// submission doorbell.
    pub fn submit(&mut self, rq: &Request, cmd: &mut SqEntry) {
        cmd.cid = rq.cid().to_le();

        self.post(cmd);
        self.ring_sq_doorbell();
    }

    fn post(&mut self, cmd: &SqEntry) {
        let bytes = cmd.as_slice();

        // SAFETY: tail is always below qsize and the ring holds qsize
        // 64-byte entries.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.sq.ring.addr().add(self.sq.tail as usize * SQE_SIZE),
                SQE_SIZE,
            );
        }

        self.sq.tail += 1;
        if self.sq.tail == self.sq.qsize {
            self.sq.tail = 0;
        }
    }

    fn ring_sq_doorbell(&mut self) {
        // The device must never read a partially written entry.
        fence(Ordering::Release);

        // SAFETY: the doorbell points at this queue's tail register.
        unsafe { mmio::write32(self.sq.doorbell.cast(), self.sq.tail as u32) };
    }

    /// Consume one completion if the queue has one. Never blocks; an empty
    /// queue leaves the doorbell untouched.
    pub fn poll_one(&mut self) -> Option<CqEntry> {
        self.cq.poll_one()
    }

    /// Wait for the completion of `rq`, consuming the token.
    ///
    /// Completions for other identifiers arriving in the meantime are
    /// handled in place: orphaned slots are drained back to the free list,
    /// asynchronous-event completions are delivered and re-armed, and
    /// anything else is logged and dropped. On timeout the slot is orphaned;
    /// its identifier stays reserved until a completion with that cid
    /// arrives.
    pub fn wait_one(&mut self, rq: Request, timeout: Duration) -> Result<CqEntry> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(cqe) = self.cq.poll_one() {
                if cqe.cid() == rq.cid() {
                    self.pool.release(rq);

                    if !cqe.ok() {
                        return Err(Error::Device(cqe.status_field()));
                    }

                    return Ok(cqe);
                }

                self.stray(cqe);
                continue;
            }

            if Instant::now() >= deadline {
                // The slot stays off the free list until a completion with
                // its cid shows up; a belated CQE must never alias a new
                // command.
                self.orphaned.insert(rq.cid());
                return Err(Error::Timeout);
            }

            std::hint::spin_loop();
        }
    }

    fn stray(&mut self, cqe: CqEntry) {
        let cid = cqe.cid();

        if cid & CID_AER != 0 {
            self.complete_aer(&cqe);
            return;
        }

        if self.orphaned.remove(&cid) {
            debug!("cid {} drained after timeout", cid);
            self.pool.release_cid(cid);
            return;
        }

        error!("SPURIOUS CQE (cq {} cid {})", self.qid, cid);
    }

    fn complete_aer(&mut self, cqe: &CqEntry) {
        let cid = cqe.cid() & !CID_AER;
        let slot = self.pool.slot_ptr(cid);

        // SAFETY: an asynchronous-event slot is owned by the queue itself
        // from submission until a reset recycles it.
        match unsafe { &(*slot).handler } {
            Some(handler) => handler(cqe),
            None => info!("unhandled async event {:#x}", cqe.dw0()),
        }

        // Re-arm with the same identifier.
        let cmd = SqEntry {
            opcode: ADMIN_ASYNC_EVENT,
            cid: (cid | CID_AER).to_le(),
            ..Default::default()
        };
        self.post(&cmd);
        self.ring_sq_doorbell();
    }

    /// Submit an Asynchronous Event Request whose completions are delivered
    /// to `handler`. The slot backing it stays in flight until a controller
    /// reset.
    pub fn submit_aer(&mut self, handler: AerHandler) -> Result<()> {
        let mut rq = self.acquire()?;
        rq.slot_mut().handler = Some(handler);

        let cmd = SqEntry {
            opcode: ADMIN_ASYNC_EVENT,
            cid: (rq.cid() | CID_AER).to_le(),
            ..Default::default()
        };
        self.post(&cmd);
        self.ring_sq_doorbell();

        self.aer_outstanding += 1;

        Ok(())
    }

    /// Check that the queue pair can be deleted: no orphaned slots and no
    /// armed asynchronous events. Reset the controller first to drain them.
    pub fn close(&mut self) -> Result<()> {
        if !self.orphaned.is_empty() || self.aer_outstanding != 0 {
            return Err(Error::QueueBusy);
        }

        Ok(())
    }

    /// After a controller reset nothing is in flight: reclaim orphaned and
    /// asynchronous-event slots and rewind the ring cursors.
    pub(crate) fn recycle(&mut self) {
        for cid in std::mem::take(&mut self.orphaned) {
            self.pool.release_cid(cid);
        }

        for cid in 0..self.pool.capacity() as u16 {
            let slot = self.pool.slot_ptr(cid);

            // SAFETY: with the controller reset no completion can reference
            // the slots anymore.
            if unsafe { (*slot).handler.take() }.is_some() {
                self.pool.release_cid(cid);
            }
        }
        self.aer_outstanding = 0;

        // SAFETY: the ring is owned by us and the device is quiesced.
        unsafe { ptr::write_bytes(self.cq.ring.addr(), 0, self.cq.ring.len()) };

        self.sq.tail = 0;
        self.cq.head = 0;
        self.cq.phase = true;
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        for vaddr in [
            self.sq.ring.vaddr(),
            self.cq.ring.vaddr(),
            self.prp_pages.vaddr(),
        ] {
            if let Err(e) = self.ctx.unmap(vaddr) {
                warn!("failed to unmap queue memory at {:#x}: {}", vaddr, e);
            }
        }
    }
}
