//! LZRC, the range-coded LZ77 variant used by compressed `data.psar` blocks.
//!
//! The decoder reads untrusted input, so every probability index and every
//! read or write is bounds-checked and turned into an [`LzrcError`].

use snafu::{Snafu, ensure};

use lzrc_error::*;

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum LzrcError {
    #[snafu(display("LZRC input is only {len} bytes"))]
    InputTooShort { len: usize },

    #[snafu(display("LZRC input ends at {offset} bytes before the end marker"))]
    InputOverrun { offset: usize },

    #[snafu(display("LZRC output exceeds {len} bytes"))]
    OutputOverflow { len: usize },

    #[snafu(display("LZRC match distance {distance} exceeds the {produced} bytes produced"))]
    DistanceOutOfRange { distance: u32, produced: usize },

    #[snafu(display("LZRC probability index {index} is out of range"))]
    ProbabilityOutOfRange { index: usize },

    #[snafu(display("stored LZRC block of {size} bytes does not fit"))]
    StoredTooLarge { size: u32 },
}

const LITERAL: usize = 0;
const DIST_BITS: usize = LITERAL + 8 * 256;
const DIST: usize = DIST_BITS + 8 * 39;
const MATCH: usize = DIST + 18 * 8;
const LEN: usize = MATCH + 8 * 8;
const PROBS_SIZE: usize = LEN + 8 * 31;

const DIST_BITS_ROW: usize = 39;
const DIST_ROW: usize = 8;
const MATCH_ROW: usize = 8;
const LEN_ROW: usize = 31;

/// Length value marking the end of the stream.
const END_MARKER: u32 = 0xFF;

/// Adaptive bit probabilities.
///
/// The tables are laid out back to back. Distance contexts of long matches
/// index past the end of their row into the following table, so they are kept
/// in one buffer and only the buffer bounds are enforced.
struct Probabilities([u8; PROBS_SIZE]);

impl Probabilities {
    fn new() -> Self {
        Self([0x80; PROBS_SIZE])
    }

    fn get(&mut self, index: usize) -> Result<&mut u8, LzrcError> {
        self.0
            .get_mut(index)
            .ok_or_else(|| ProbabilityOutOfRangeSnafu { index }.build())
    }
}

struct RangeDecoder<'a> {
    input: &'a [u8],
    pos: usize,
    range: u32,
    code: u32,
}

impl RangeDecoder<'_> {
    fn normalize(&mut self) -> Result<(), LzrcError> {
        if self.range < 0x0100_0000 {
            let byte = *self
                .input
                .get(self.pos)
                .ok_or_else(|| InputOverrunSnafu { offset: self.pos }.build())?;
            self.range <<= 8;
            self.code = (self.code << 8) | u32::from(byte);
            self.pos += 1;
        }
        Ok(())
    }

    fn bit(&mut self, probs: &mut Probabilities, index: usize) -> Result<u32, LzrcError> {
        self.normalize()?;

        let prob = probs.get(index)?;
        let bound = (self.range >> 8) * u32::from(*prob);
        *prob -= *prob >> 3;

        if self.code < bound {
            self.range = bound;
            *prob += 31;
            Ok(1)
        } else {
            self.code -= bound;
            self.range -= bound;
            Ok(0)
        }
    }

    /// Decodes a binary tree of bits until the value reaches `limit`.
    fn bittree(&mut self, probs: &mut Probabilities, base: usize, limit: u32) -> Result<u32, LzrcError> {
        let mut number = 1;
        while number < limit {
            number = (number << 1) + self.bit(probs, base + number as usize)?;
        }
        Ok(number)
    }

    /// Decodes an `n`-bit number: up to two context bits, direct bits, then
    /// up to three more context bits.
    fn number(&mut self, probs: &mut Probabilities, base: usize, n: u32) -> Result<u32, LzrcError> {
        let mut number = 1u32;

        if n > 3 {
            number = (number << 1) + self.bit(probs, base + 3)?;
            if n > 4 {
                number = (number << 1) + self.bit(probs, base + 3)?;
                if n > 5 {
                    self.normalize()?;
                    for _ in 0..n - 5 {
                        self.range >>= 1;
                        number <<= 1;
                        if self.code < self.range {
                            number += 1;
                        } else {
                            self.code -= self.range;
                        }
                    }
                }
            }
        }

        for i in 0..n.min(3) {
            number = (number << 1) + self.bit(probs, base + i as usize)?;
        }

        Ok(number)
    }
}

/// Decompresses `input` into `output`.
///
/// Returns the number of bytes produced.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<usize, LzrcError> {
    ensure!(input.len() >= 5, InputTooShortSnafu { len: input.len() });

    let lc = input[0];
    let code = u32::from_be_bytes([input[1], input[2], input[3], input[4]]);

    if lc & 0x80 != 0 {
        let size = code as usize;
        let stored = input
            .get(5..)
            .and_then(|rest| rest.get(..size))
            .filter(|_| size <= output.len())
            .ok_or_else(|| StoredTooLargeSnafu { size: code }.build())?;
        output[..size].copy_from_slice(stored);
        return Ok(size);
    }

    let mut rc = RangeDecoder {
        input,
        pos: 5,
        range: 0xFFFF_FFFF,
        code,
    };
    let mut probs = Probabilities::new();

    let capacity = output.len();
    let mut state = 0usize;
    let mut last = 0u8;
    let mut out = 0usize;

    loop {
        let mut step = 0usize;

        if rc.bit(&mut probs, MATCH + state * MATCH_ROW + step)? == 0 {
            state = state.saturating_sub(1);

            let context = (u32::from(last).checked_shr(u32::from(lc)).unwrap_or(0) & 7) as usize;
            let byte = rc.bittree(&mut probs, LITERAL + context * 256, 0x100)? - 0x100;

            let slot = output
                .get_mut(out)
                .ok_or_else(|| OutputOverflowSnafu { len: capacity }.build())?;
            *slot = byte as u8;
            last = byte as u8;
            out += 1;
            continue;
        }

        let mut len_bits = 0u32;
        for _ in 0..7 {
            step += 1;
            if rc.bit(&mut probs, MATCH + state * MATCH_ROW + step)? == 0 {
                break;
            }
            len_bits += 1;
        }

        let len = if len_bits == 0 {
            1
        } else {
            let shifted = (out as u32).wrapping_shl(len_bits - 1) & 3;
            let len_state = (((len_bits - 1) << 2) + shifted) as usize;
            let len = rc.number(&mut probs, LEN + state * LEN_ROW + len_state, len_bits)?;
            if len == END_MARKER {
                return Ok(out);
            }
            len
        };

        let (dist_state, limit) = if len > 2 { (7, 44) } else { (0, 8) };
        let base = DIST_BITS + len_bits as usize * DIST_BITS_ROW + dist_state;
        let dist_bits = rc.bittree(&mut probs, base, limit)? - limit;

        let distance = if dist_bits > 0 {
            rc.number(&mut probs, DIST + dist_bits as usize * DIST_ROW, dist_bits)?
        } else {
            1
        };

        ensure!(
            distance as usize <= out && distance != 0,
            DistanceOutOfRangeSnafu {
                distance,
                produced: out
            }
        );

        let count = len as usize + 1;
        ensure!(
            out + count <= capacity,
            OutputOverflowSnafu { len: capacity }
        );

        // Byte by byte, the source may overlap the destination.
        let from = out - distance as usize;
        for i in 0..count {
            output[out + i] = output[from + i];
        }
        out += count;
        last = output[out - 1];

        state = 6 + ((out + 1) & 1);
    }
}
