//! CRC-32 helpers.

use crc32fast::Hasher;

/// Returns `crc(a ‖ b)` from `crc(a)`, `crc(b)` and the length of `b`.
#[must_use]
pub fn crc32_combine(crc_a: u32, crc_b: u32, len_b: u64) -> u32 {
    let mut hasher = Hasher::new_with_initial_len(crc_a, 0);
    hasher.combine(&Hasher::new_with_initial_len(crc_b, len_b));
    hasher.finalize()
}
