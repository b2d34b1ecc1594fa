// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! NVMe register layout and wire formats.
//!
//! All multi-byte command and completion fields are little-endian on the
//! wire; conversions happen at the ring and register boundaries.

use std::mem::size_of;

use vm_memory::ByteValued;

pub const REG_CAP: usize = 0x0000;
pub const REG_CC: usize = 0x0014;
pub const REG_CSTS: usize = 0x001c;
pub const REG_AQA: usize = 0x0024;
pub const REG_ASQ: usize = 0x0028;
pub const REG_ACQ: usize = 0x0030;

/// Doorbell registers start here; stride is `4 << CAP.DSTRD`.
pub const DOORBELL_BASE: usize = 0x1000;

pub const SQE_SIZE: usize = 64;
pub const CQE_SIZE: usize = 16;

// Log2 of the entry sizes, as programmed into CC.IOSQES/IOCQES.
pub const SQES: u32 = 6;
pub const CQES: u32 = 4;

/// Command identifier bit reserved for Asynchronous Event Requests, so their
/// completions can never collide with an ordinary in-flight cid.
pub const CID_AER: u16 = 1 << 15;

pub const ADMIN_DELETE_SQ: u8 = 0x00;
pub const ADMIN_CREATE_SQ: u8 = 0x01;
pub const ADMIN_DELETE_CQ: u8 = 0x04;
pub const ADMIN_CREATE_CQ: u8 = 0x05;
pub const ADMIN_IDENTIFY: u8 = 0x06;
pub const ADMIN_SET_FEATURES: u8 = 0x09;
pub const ADMIN_ASYNC_EVENT: u8 = 0x0c;

pub const IDENTIFY_CNS_CTRL: u32 = 0x01;
pub const IDENTIFY_DATA_SIZE: usize = 4096;

pub const FEAT_FID_NUM_QUEUES: u32 = 0x07;

/// Queue is physically contiguous (CDW11 bit 0 of Create I/O CQ/SQ).
pub const Q_PC: u32 = 1 << 0;

pub(crate) fn cap_to(cap: u64) -> u64 {
    (cap >> 24) & 0xff
}

pub(crate) fn cap_dstrd(cap: u64) -> u8 {
    ((cap >> 32) & 0xf) as u8
}

pub(crate) fn cap_css(cap: u64) -> u8 {
    ((cap >> 37) & 0xff) as u8
}

pub(crate) fn cap_mpsmin(cap: u64) -> u32 {
    ((cap >> 48) & 0xf) as u32
}

pub const CAP_CSS_CSI: u8 = 1 << 6;
pub const CAP_CSS_ADMIN: u8 = 1 << 7;

pub const CC_EN: u32 = 1 << 0;
pub const CC_CSS_SHIFT: u32 = 4;
pub const CC_CSS_NVM: u32 = 0;
pub const CC_CSS_CSI: u32 = 6;
pub const CC_CSS_ADMIN: u32 = 7;
pub const CC_MPS_SHIFT: u32 = 7;
pub const CC_IOSQES_SHIFT: u32 = 16;
pub const CC_IOCQES_SHIFT: u32 = 20;

pub const CSTS_RDY: u32 = 1 << 0;

/// A 64-byte submission queue entry. `opcode` is byte 0, `cid` bytes 2–3;
/// data pointers are PRP1/PRP2.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SqEntry {
    pub opcode: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

// SAFETY: SqEntry is repr(C) with no padding and any bit pattern is valid.
unsafe impl ByteValued for SqEntry {}

/// A 16-byte completion queue entry. `cid` is bytes 12–13; the status word
/// at bytes 14–15 carries the phase bit in bit 0 and the status field in
/// the upper 15 bits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CqEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status: u16,
}

// SAFETY: CqEntry is repr(C) with no padding and any bit pattern is valid.
unsafe impl ByteValued for CqEntry {}

impl CqEntry {
    pub fn cid(&self) -> u16 {
        u16::from_le(self.cid)
    }

    pub fn phase(&self) -> u16 {
        u16::from_le(self.status) & 0x1
    }

    /// The 15-bit status field; zero means success.
    pub fn status_field(&self) -> u16 {
        u16::from_le(self.status) >> 1
    }

    pub fn ok(&self) -> bool {
        self.status_field() == 0
    }

    pub fn dw0(&self) -> u32 {
        u32::from_le(self.dw0)
    }
}

const _: () = assert!(size_of::<SqEntry>() == SQE_SIZE);
const _: () = assert!(size_of::<CqEntry>() == CQE_SIZE);
