// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! User-space NVMe queue-pair engine.
//!
//! Sits on top of the `iommu` crate's address-space management and drives an
//! NVMe controller directly through its BAR: submission/completion rings in
//! DMA-mapped process memory, doorbell writes over MMIO, request-slot
//! accounting with command identifiers, PRP assembly for data buffers, and a
//! one-shot admin command path.
//!
//! The caller binds the device, maps its BAR, and hands the register pointer
//! to [`Controller::new`]; everything NVMe-shaped happens here.

#[macro_use]
extern crate log;

use thiserror::Error;

mod ctrl;
mod mmio;
mod queue;
mod rq;
pub mod types;
mod util;

pub use ctrl::{Controller, ControllerOpts};
pub use queue::{DoorbellPair, QueuePair};
pub use rq::Request;
pub use types::{CqEntry, SqEntry};
pub use util::crc64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no request slot available")]
    NoSlotAvailable,
    #[error("queue pair has orphaned or in-flight requests")]
    QueueBusy,
    #[error("timed out waiting for a completion")]
    Timeout,
    #[error("data buffer needs more PRP entries than the list holds")]
    PrpListFull,
    #[error("command failed with status {0:#05x}")]
    Device(u16),
    #[error("no such queue: {0}")]
    UnknownQueue(u16),
    #[error(transparent)]
    Iommu(#[from] iommu::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
