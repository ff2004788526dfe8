//! CRC32C (Castagnoli) helpers with the storage masking used by the log
//! and table formats. A raw CRC stored next to the bytes it covers can be
//! re-hashed into a "valid looking" value by accident, so stored CRCs are
//! rotated and offset first.

use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282_ead8;

/// Returns the crc32c of `data`.
pub fn hash(data: &[u8]) -> u32 {
    hash_parts(&[data])
}

/// Returns the crc32c of the concatenation of `parts` without
/// materializing the concatenation.
pub fn hash_parts(parts: &[&[u8]]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

/// Masks a crc for storage.
#[inline]
pub fn mask(crc: u32) -> u32 {
    (crc >> 15 | crc << 17).wrapping_add(MASK_DELTA)
}

/// Inverse of `mask`.
#[inline]
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    rot >> 17 | rot << 15
}
