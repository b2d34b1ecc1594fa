// Copyright © 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Volatile MMIO register access.
//!
//! Controller registers are little-endian; the accessors convert at the
//! boundary. 64-bit registers that must be written with two 32-bit accesses
//! (ASQ/ACQ on some controllers) use the high-then-low variant.

use std::ptr;

/// # Safety
///
/// `addr` must point into a live MMIO mapping with at least 4 readable
/// bytes.
pub(crate) unsafe fn read32(addr: *const u8) -> u32 {
    u32::from_le(ptr::read_volatile(addr as *const u32))
}

/// # Safety
///
/// `addr` must point into a live MMIO mapping with at least 8 readable
/// bytes.
pub(crate) unsafe fn read64(addr: *const u8) -> u64 {
    u64::from_le(ptr::read_volatile(addr as *const u64))
}

/// # Safety
///
/// `addr` must point into a live MMIO mapping with at least 4 writable
/// bytes.
pub(crate) unsafe fn write32(addr: *mut u8, val: u32) {
    ptr::write_volatile(addr as *mut u32, val.to_le());
}

/// Write a 64-bit register as two 32-bit accesses, high dword first.
///
/// # Safety
///
/// `addr` must point into a live MMIO mapping with at least 8 writable
/// bytes.
pub(crate) unsafe fn write64_hl(addr: *mut u8, val: u64) {
    write32(addr.add(4), (val >> 32) as u32);
    write32(addr, val as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_write_composes_to_little_endian_u64() {
        let mut backing = [0u8; 8];

        // SAFETY: backing is 8 writable, readable bytes.
        unsafe {
            write64_hl(backing.as_mut_ptr(), 0x1122_3344_5566_7788);
            assert_eq!(read64(backing.as_ptr()), 0x1122_3344_5566_7788);
        }

        assert_eq!(backing, 0x1122_3344_5566_7788u64.to_le_bytes());
    }
}
