// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The controller session.
//!
//! Owns the admin queue pair and the I/O queue pairs, and drives the
//! controller-level register protocol: reset and enable through `CC`/`CSTS`,
//! admin queue programming through `AQA`/`ASQ`/`ACQ`, and queue lifecycle
//! through admin commands. PCI binding and BAR mapping happen elsewhere; the
//! session takes the mapped register pointer as given.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iommu::IommuContext;

use crate::mmio;
use crate::queue::{DoorbellPair, QueuePair};
use crate::types::*;
use crate::{Error, Result};

pub(crate) const ADMIN_QUEUE_SIZE: u16 = 32;

/// Controller configuration.
///
/// `nsqr` and `ncqr` are the number of I/O submission/completion queues to
/// request from the controller, as zero-based values.
#[derive(Clone, Copy, Debug)]
pub struct ControllerOpts {
    pub nsqr: u16,
    pub ncqr: u16,
}

impl Default for ControllerOpts {
    fn default() -> Self {
        ControllerOpts { nsqr: 63, ncqr: 63 }
    }
}

fn doorbell_offsets(qid: u16, dstrd: u8) -> (usize, usize) {
    let stride = 4usize << dstrd;

    (
        DOORBELL_BASE + 2 * qid as usize * stride,
        DOORBELL_BASE + (2 * qid as usize + 1) * stride,
    )
}

fn doorbell_pair(bar: *mut u8, qid: u16, dstrd: u8) -> DoorbellPair {
    let (sq, cq) = doorbell_offsets(qid, dstrd);

    // SAFETY: the offsets stay within the doorbell region of the mapped BAR
    // for any queue id the controller accepted.
    unsafe {
        DoorbellPair {
            sq: bar.add(sq) as *mut u32,
            cq: bar.add(cq) as *mut u32,
        }
    }
}

/// An initialized NVMe controller with a live admin queue.
pub struct Controller {
    ctx: Arc<IommuContext>,
    regs: *mut u8,
    dstrd: u8,
    timeout: Duration,
    admin: QueuePair,
    io: HashMap<u16, QueuePair>,
    nsqa: u16,
    ncqa: u16,
    opts: ControllerOpts,
}

// SAFETY: the register pointer addresses a BAR mapping exclusive to this
// session.
unsafe impl Send for Controller {}

impl Controller {
    /// Bring up the controller behind the mapped BAR at `bar`: disable it,
    /// program the admin queue, re-enable, and negotiate the I/O queue
    /// counts.
    pub fn new(ctx: Arc<IommuContext>, bar: *mut u8, opts: ControllerOpts) -> Result<Self> {
        // SAFETY: bar addresses the controller register page.
        let cap = unsafe { mmio::read64(bar.add(REG_CAP)) };

        if 12 + cap_mpsmin(cap) > ctx.runtime().page_shift() {
            return Err(Error::InvalidArgument(
                "controller minimum page size exceeds the host page size",
            ));
        }

        let dstrd = cap_dstrd(cap);
        let timeout = Duration::from_millis(500 * (cap_to(cap) + 1));

        let admin = QueuePair::new(
            Arc::clone(&ctx),
            0,
            ADMIN_QUEUE_SIZE,
            doorbell_pair(bar, 0, dstrd),
        )?;

        let mut ctrl = Controller {
            ctx,
            regs: bar,
            dstrd,
            timeout,
            admin,
            io: HashMap::new(),
            nsqa: 0,
            ncqa: 0,
            opts,
        };

        ctrl.reset()?;
        ctrl.configure_admin_queue();
        ctrl.enable()?;
        ctrl.negotiate_queue_counts()?;

        Ok(ctrl)
    }

    /// Clear `CC.EN` and wait for the controller to report not-ready. Every
    /// in-flight command is dead afterwards, so stranded request slots are
    /// reclaimed.
    pub fn reset(&mut self) -> Result<()> {
        // SAFETY: regs addresses the controller register page.
        unsafe {
            let cc = mmio::read32(self.regs.add(REG_CC));
            mmio::write32(self.regs.add(REG_CC), cc & !CC_EN);
        }

        self.wait_ready(0)?;

        self.admin.recycle();
        for qp in self.io.values_mut() {
            qp.recycle();
        }

        Ok(())
    }

    /// Set `CC` up for this host's page size and the controller's command
    /// sets, enable it, and wait for ready.
    pub fn enable(&mut self) -> Result<()> {
        // SAFETY: regs addresses the controller register page.
        let cap = unsafe { mmio::read64(self.regs.add(REG_CAP)) };
        let css = cap_css(cap);

        let mut cc = ((self.ctx.runtime().page_shift() - 12) << CC_MPS_SHIFT)
            | (SQES << CC_IOSQES_SHIFT)
            | (CQES << CC_IOCQES_SHIFT)
            | CC_EN;

        cc |= if css & CAP_CSS_CSI != 0 {
            CC_CSS_CSI << CC_CSS_SHIFT
        } else if css & CAP_CSS_ADMIN != 0 {
            CC_CSS_ADMIN << CC_CSS_SHIFT
        } else {
            CC_CSS_NVM << CC_CSS_SHIFT
        };

        // SAFETY: regs addresses the controller register page.
        unsafe { mmio::write32(self.regs.add(REG_CC), cc) };

        self.wait_ready(1)
    }

    fn wait_ready(&self, ready: u32) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            // SAFETY: regs addresses the controller register page.
            let csts = unsafe { mmio::read32(self.regs.add(REG_CSTS)) };
            if csts & CSTS_RDY == ready {
                return Ok(());
            }

            if Instant::now() >= deadline {
                debug!("controller did not reach CSTS.RDY={}", ready);
                return Err(Error::Timeout);
            }

            std::hint::spin_loop();
        }
    }

    fn configure_admin_queue(&mut self) {
        let qsize = ADMIN_QUEUE_SIZE as u32 - 1;
        let aqa = qsize | (qsize << 16);

        // SAFETY: regs addresses the controller register page.
        unsafe {
            mmio::write32(self.regs.add(REG_AQA), aqa);
            mmio::write64_hl(self.regs.add(REG_ASQ), self.admin.sq_ring_iova());
            mmio::write64_hl(self.regs.add(REG_ACQ), self.admin.cq_ring_iova());
        }
    }

    fn negotiate_queue_counts(&mut self) -> Result<()> {
        let mut cmd = SqEntry {
            opcode: ADMIN_SET_FEATURES,
            cdw10: FEAT_FID_NUM_QUEUES.to_le(),
            cdw11: ((self.opts.nsqr as u32) | ((self.opts.ncqr as u32) << 16)).to_le(),
            ..Default::default()
        };

        let cqe = self.admin(&mut cmd, None)?;
        let dw0 = cqe.dw0();

        self.nsqa = self.opts.nsqr.min((dw0 & 0xffff) as u16);
        self.ncqa = self.opts.ncqr.min((dw0 >> 16) as u16);

        Ok(())
    }

    /// One-shot admin command: acquire a slot, ephemerally map `buf` if
    /// given, submit, wait for the completion, and tear the mapping down
    /// again. The first error wins; teardown failures after a failed command
    /// are logged.
    pub fn admin(&mut self, cmd: &mut SqEntry, buf: Option<&mut [u8]>) -> Result<CqEntry> {
        let mut rq = self.admin.acquire()?;

        let mut ephemeral = None;
        if let Some(buf) = buf {
            let vaddr = buf.as_ptr() as u64;
            let len = self.ctx.runtime().page_align_up(buf.len()) as u64;

            let iova = match self.ctx.map_ephemeral(vaddr, len) {
                Ok(iova) => iova,
                Err(e) => {
                    self.admin.release(rq);
                    return Err(e.into());
                }
            };

            if let Err(e) = self.admin.map_prp(&mut rq, cmd, iova, buf.len() as u64) {
                if let Err(e) = self.ctx.unmap_ephemeral(iova, len) {
                    warn!("failed to unmap admin buffer: {}", e);
                }
                self.admin.release(rq);
                return Err(e);
            }

            ephemeral = Some((iova, len));
        }

        self.admin.submit(&rq, cmd);
        let res = self.admin.wait_one(rq, self.timeout);

        if let Some((iova, len)) = ephemeral {
            if let Err(e) = self.ctx.unmap_ephemeral(iova, len) {
                warn!("failed to unmap admin buffer: {}", e);
                if res.is_ok() {
                    return Err(e.into());
                }
            }
        }

        res
    }

    /// Identify Controller (CNS 01h) into `buf`, which must hold the
    /// 4096-byte data structure.
    pub fn identify_controller(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < IDENTIFY_DATA_SIZE {
            return Err(Error::InvalidArgument(
                "identify buffer must hold 4096 bytes",
            ));
        }

        let mut cmd = SqEntry {
            opcode: ADMIN_IDENTIFY,
            cdw10: IDENTIFY_CNS_CTRL.to_le(),
            ..Default::default()
        };

        self.admin(&mut cmd, Some(&mut buf[..IDENTIFY_DATA_SIZE]))?;

        Ok(())
    }

    /// Create an I/O completion/submission queue pair with identifier `qid`.
    ///
    /// One ring entry is reserved for the full-queue condition: a command
    /// depth of N needs `qsize` N + 1.
    pub fn create_io_queue_pair(&mut self, qid: u16, qsize: u16) -> Result<()> {
        if qid == 0 || qid > self.nsqa.min(self.ncqa) {
            return Err(Error::InvalidArgument("queue id out of range"));
        }

        if self.io.contains_key(&qid) {
            return Err(Error::InvalidArgument("queue id already in use"));
        }

        let qp = QueuePair::new(
            Arc::clone(&self.ctx),
            qid,
            qsize,
            doorbell_pair(self.regs, qid, self.dstrd),
        )?;

        let mut cmd = SqEntry {
            opcode: ADMIN_CREATE_CQ,
            prp1: qp.cq_ring_iova().to_le(),
            cdw10: (((qsize as u32 - 1) << 16) | qid as u32).to_le(),
            cdw11: Q_PC.to_le(),
            ..Default::default()
        };
        self.admin(&mut cmd, None)?;

        let mut cmd = SqEntry {
            opcode: ADMIN_CREATE_SQ,
            prp1: qp.sq_ring_iova().to_le(),
            cdw10: (((qsize as u32 - 1) << 16) | qid as u32).to_le(),
            cdw11: (((qid as u32) << 16) | Q_PC).to_le(),
            ..Default::default()
        };
        if let Err(e) = self.admin(&mut cmd, None) {
            let mut del = SqEntry {
                opcode: ADMIN_DELETE_CQ,
                cdw10: (qid as u32).to_le(),
                ..Default::default()
            };
            if self.admin(&mut del, None).is_err() {
                warn!("failed to roll back completion queue {}", qid);
            }

            return Err(e);
        }

        self.io.insert(qid, qp);

        Ok(())
    }

    /// Delete the I/O queue pair `qid`. Fails while the queue still has
    /// orphaned requests; reset the controller first to drain them.
    pub fn delete_io_queue_pair(&mut self, qid: u16) -> Result<()> {
        match self.io.get_mut(&qid) {
            None => return Err(Error::UnknownQueue(qid)),
            Some(qp) => qp.close()?,
        }

        let mut cmd = SqEntry {
            opcode: ADMIN_DELETE_SQ,
            cdw10: (qid as u32).to_le(),
            ..Default::default()
        };
        self.admin(&mut cmd, None)?;

        let mut cmd = SqEntry {
            opcode: ADMIN_DELETE_CQ,
            cdw10: (qid as u32).to_le(),
            ..Default::default()
        };
        self.admin(&mut cmd, None)?;

        self.io.remove(&qid);

        Ok(())
    }

    /// Arm an Asynchronous Event Request on the admin queue. Completions are
    /// delivered to `handler` and the request is re-armed; the slot stays in
    /// flight until a reset.
    pub fn aer(&mut self, handler: impl Fn(&CqEntry) + Send + 'static) -> Result<()> {
        self.admin.submit_aer(Box::new(handler))
    }

    pub fn io_queue_pair(&mut self, qid: u16) -> Result<&mut QueuePair> {
        self.io.get_mut(&qid).ok_or(Error::UnknownQueue(qid))
    }

    pub fn admin_queue_pair(&mut self) -> &mut QueuePair {
        &mut self.admin
    }

    /// The `CAP.TO`-derived deadline used for register waits and admin
    /// commands.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_offsets_follow_the_stride() {
        assert_eq!(doorbell_offsets(0, 0), (0x1000, 0x1004));
        assert_eq!(doorbell_offsets(1, 0), (0x1008, 0x100c));

        // DSTRD = 2 stretches the stride to 16 bytes.
        assert_eq!(doorbell_offsets(0, 2), (0x1000, 0x1010));
        assert_eq!(doorbell_offsets(3, 2), (0x1060, 0x1070));
    }

    #[test]
    fn cap_fields_unpack() {
        // TO = 30, DSTRD = 2, CSS = NVM + CSI, MPSMIN = 0.
        let cap: u64 = (30u64 << 24) | (2u64 << 32) | ((CAP_CSS_CSI as u64 | 0x1) << 37);

        assert_eq!(cap_to(cap), 30);
        assert_eq!(cap_dstrd(cap), 2);
        assert_eq!(cap_css(cap) & CAP_CSS_CSI, CAP_CSS_CSI);
        assert_eq!(cap_mpsmin(cap), 0);
    }

    #[test]
    fn default_opts_request_sixty_three_queues() {
        let opts = ControllerOpts::default();
        assert_eq!((opts.nsqr, opts.ncqr), (63, 63));
    }
}
