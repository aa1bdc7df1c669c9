//! CRC32C (Castagnoli) checksums for block trailers.
//!
//! Stored checksums are masked so that computing the CRC of a byte range
//! that itself contains an embedded CRC does not degenerate.

use crc::{Crc, CRC_32_ISCSI};

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282_ead8;

/// Returns the CRC32C of `data`.
pub fn value(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// Masks a raw CRC for storage.
pub fn mask(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Recovers a raw CRC from its stored masked form.
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}
