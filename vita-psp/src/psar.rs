//! The disc image stored in the `data.psar` section of a PSP `EBOOT.PBP`.
//!
//! The image is a table of blocks, each holding `block_sectors` ISO sectors.
//! Blocks are encrypted with the [`PspCipher`] derived from the PSAR header
//! and either stored raw or compressed with [LZRC](crate::lzrc).
//!
//! Reference: <https://www.psdevwiki.com/psp/EBOOT.PBP>

use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, trace};
use vita_pkg::crypto::cmac;
use vita_pkg::source::ItemSource;
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian::U32,
};

use crate::keys::{KIRK7_KEY38, PspCipher, SeedKind};
use crate::lzrc::{self, LzrcError};

use psar_error::*;

/// Size of one ISO sector.
pub const SECTOR_SIZE: usize = 2048;

/// Largest supported number of sectors per block.
pub const MAX_BLOCK_SECTORS: u32 = 16;

const EBOOT_MAGIC: &[u8; 4] = b"\0PBP";
const PSAR_MAGIC: &[u8; 8] = b"NPUMDIMG";

/// Header of `EBOOT.PBP`: a magic, a version and the offsets of its sections.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct EbootHeader {
    magic: [u8; 4], // 0x00 - "\0PBP"
    _version: U32,  // 0x04
    _sfo: U32,      // 0x08
    _icon0: U32,    // 0x0C
    _icon1: U32,    // 0x10
    _pic0: U32,     // 0x14
    _pic1: U32,     // 0x18
    _snd0: U32,     // 0x1C
    _psp: U32,      // 0x20
    psar: U32,      // 0x24
}

/// Header of `data.psar`. Bytes 0x40..0xA0 are encrypted.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PsarHeader {
    magic: [u8; 8],             // 0x00 - "NPUMDIMG"
    _unknown_08: U32,           // 0x08
    block_sectors: U32,         // 0x0C
    _unknown_10: [u8; 0x44],    // 0x10
    start_sector: U32,          // 0x54
    _unknown_58: [u8; 0x0C],    // 0x58
    end_sector: U32,            // 0x64
    _unknown_68: U32,           // 0x68
    table_offset: U32,          // 0x6C
    _unknown_70: [u8; 0x30],    // 0x70
    iv_seed: [u8; 0x10],        // 0xA0
    _unknown_b0: [u8; 0x10],    // 0xB0
    key_seed: [u8; 0x10],       // 0xC0
    _unknown_d0: [u8; 0x30],    // 0xD0
}

/// Size of the signed part of [`PsarHeader`].
const PSAR_SIGNED_SIZE: usize = 0xC0;

/// One 32-byte record of the block table. Three of the words are obfuscated
/// with the others.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct BlockRecord([U32; 8]);

impl BlockRecord {
    fn entry(&self) -> BlockEntry {
        let t = self.0.map(U32::get);
        BlockEntry {
            offset: t[4] ^ t[2] ^ t[3],
            size: t[5] ^ t[1] ^ t[2],
            flags: BlockFlags::from_bits_retain(t[6] ^ t[0] ^ t[3]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockFlags(u32);

bitflags::bitflags! {
    impl BlockFlags: u32 {
        /// The block is not encrypted with the PSP cipher.
        const PLAIN = 0x4;
    }
}

/// Location of one block, relative to the start of `data.psar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    offset: u32,
    size: u32,
    flags: BlockFlags,
}

impl BlockEntry {
    #[cfg(test)]
    pub(crate) fn plain(offset: u32, size: u32) -> Self {
        Self {
            offset,
            size,
            flags: BlockFlags::PLAIN,
        }
    }

    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns the stored size. Equal to the block size for raw blocks.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub const fn flags(&self) -> BlockFlags {
        self.flags
    }
}

/// Errors when reading the disc image of an `EBOOT.PBP`.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum PsarError {
    #[snafu(display("cannot read {what}"))]
    ReadFailed {
        what: &'static str,
        source: std::io::Error,
    },

    #[snafu(display("EBOOT.PBP is too short ({size} bytes)"))]
    TooShort { size: u64 },

    #[snafu(display("invalid EBOOT.PBP magic"))]
    InvalidEbootMagic,

    #[snafu(display("invalid data.psar magic"))]
    InvalidPsarMagic,

    #[snafu(display("data.psar at {offset:#x} is past the end of the {size}-byte EBOOT.PBP"))]
    PsarOutOfRange { offset: u32, size: u64 },

    #[snafu(display("data.psar offset {offset:#x} is not 16-byte aligned"))]
    MisalignedPsar { offset: u32 },

    #[snafu(display(
        "unsupported data.psar block size of {sectors} sectors, 1 to {MAX_BLOCK_SECTORS} supported"
    ))]
    UnsupportedBlockSize { sectors: u32 },

    #[snafu(display("invalid ISO sector range {start}..{end}"))]
    InvalidSectorRange { start: u32, end: u32 },

    #[snafu(display("block table of {count} entries at {offset:#x} is past the end of EBOOT.PBP"))]
    TableOutOfRange { offset: u32, count: u32 },

    #[snafu(display("block {index} ({size} bytes at {offset:#x}) is out of range"))]
    BlockOutOfRange { index: u32, offset: u32, size: u32 },

    #[snafu(display("cannot decompress block {index}"))]
    DecompressFailed { index: u32, source: LzrcError },

    #[snafu(display("block {index} decompressed to {actual} bytes instead of {expected}"))]
    BlockSizeMismatch {
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[snafu(display("output buffer of {actual} bytes does not hold a {expected}-byte block"))]
    BufferSize { expected: usize, actual: usize },
}

/// The block table of a `data.psar` disc image plus the cipher of its blocks.
///
/// Created via [`PsarImage::open()`]. Blocks are read and decoded one at a
/// time with [`PsarImage::read_block()`].
pub struct PsarImage<'a, S: ItemSource + ?Sized> {
    source: &'a S,
    psar_offset: u64,
    block_sectors: u32,
    cipher: PspCipher,
    blocks: Vec<BlockEntry>,
}

impl<S: ItemSource + ?Sized> std::fmt::Debug for PsarImage<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsarImage")
            .field("psar_offset", &self.psar_offset)
            .field("block_sectors", &self.block_sectors)
            .field("block_count", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

impl<'a, S: ItemSource + ?Sized> PsarImage<'a, S> {
    /// Opens the disc image of the decrypted `EBOOT.PBP` in `source`.
    ///
    /// Reads both headers and the whole block table.
    pub fn open(source: &'a S) -> Result<Self, PsarError> {
        let size = source.len();

        let mut eboot = EbootHeader::new_zeroed();
        ensure!(size >= size_of::<EbootHeader>() as u64, TooShortSnafu { size });
        source
            .read_exact_at(0, eboot.as_mut_bytes())
            .context(ReadFailedSnafu { what: "EBOOT.PBP header" })?;
        ensure!(&eboot.magic == EBOOT_MAGIC, InvalidEbootMagicSnafu);

        let psar = eboot.psar.get();
        let psar_offset = u64::from(psar);
        ensure!(
            psar_offset + size_of::<PsarHeader>() as u64 <= size,
            PsarOutOfRangeSnafu { offset: psar, size }
        );
        ensure!(psar % 16 == 0, MisalignedPsarSnafu { offset: psar });

        let mut header = PsarHeader::new_zeroed();
        source
            .read_exact_at(psar_offset, header.as_mut_bytes())
            .context(ReadFailedSnafu { what: "data.psar header" })?;
        ensure!(&header.magic == PSAR_MAGIC, InvalidPsarMagicSnafu);

        let block_sectors = header.block_sectors.get();
        ensure!(
            (1..=MAX_BLOCK_SECTORS).contains(&block_sectors),
            UnsupportedBlockSizeSnafu {
                sectors: block_sectors
            }
        );

        let mac = cmac(&KIRK7_KEY38, &header.as_bytes()[..PSAR_SIGNED_SIZE]);
        let cipher = PspCipher::derive(SeedKind::Wrapped, &mac, &header.key_seed, &header.iv_seed);
        cipher.decrypt(0, &mut header.as_mut_bytes()[0x40..0xA0]);

        let start = header.start_sector.get();
        let end = header.end_sector.get();
        ensure!(end > start, InvalidSectorRangeSnafu { start, end });
        let count = (end - start - 1).div_ceil(block_sectors);

        let table = header.table_offset.get();
        let table_start = psar_offset + u64::from(table);
        ensure!(
            table_start + u64::from(count) * size_of::<BlockRecord>() as u64 <= size,
            TableOutOfRangeSnafu {
                offset: table,
                count
            }
        );

        let mut records = vec![BlockRecord::new_zeroed(); count as usize];
        source
            .read_exact_at(table_start, records.as_mut_slice().as_mut_bytes())
            .context(ReadFailedSnafu { what: "block table" })?;
        let blocks: Vec<BlockEntry> = records.iter().map(BlockRecord::entry).collect();

        debug!(
            psar_offset,
            block_sectors,
            blocks = blocks.len(),
            start,
            end,
            "opened data.psar"
        );

        Ok(Self {
            source,
            psar_offset,
            block_sectors,
            cipher,
            blocks,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        source: &'a S,
        psar_offset: u64,
        block_sectors: u32,
        cipher: PspCipher,
        blocks: Vec<BlockEntry>,
    ) -> Self {
        Self {
            source,
            psar_offset,
            block_sectors,
            cipher,
            blocks,
        }
    }

    /// Returns the number of ISO sectors in each block.
    #[must_use]
    pub fn block_sectors(&self) -> u32 {
        self.block_sectors
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Returns the decoded size of each block in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_sectors as usize * SECTOR_SIZE
    }

    /// Returns the size of the rebuilt ISO image.
    #[must_use]
    pub fn iso_size(&self) -> u64 {
        self.blocks.len() as u64 * self.block_size() as u64
    }

    /// Returns the table entry of block `index`.
    #[must_use]
    pub fn block(&self, index: u32) -> Option<&BlockEntry> {
        self.blocks.get(index as usize)
    }

    /// Reads, decrypts and decompresses block `index` into `out`.
    ///
    /// `out` must be exactly [`block_size()`](Self::block_size) bytes.
    /// `scratch` holds the stored bytes and is reused across calls.
    pub fn read_block(
        &self,
        index: u32,
        scratch: &mut Vec<u8>,
        out: &mut [u8],
    ) -> Result<(), PsarError> {
        let expected = self.block_size();
        ensure!(
            out.len() == expected,
            BufferSizeSnafu {
                expected,
                actual: out.len()
            }
        );

        let entry = self.blocks.get(index as usize).copied().ok_or_else(|| {
            BlockOutOfRangeSnafu {
                index,
                offset: 0u32,
                size: 0u32,
            }
            .build()
        })?;

        let start = self.psar_offset + u64::from(entry.offset);
        ensure!(
            entry.size as usize <= MAX_BLOCK_SECTORS as usize * SECTOR_SIZE
                && start + u64::from(entry.size) <= self.source.len(),
            BlockOutOfRangeSnafu {
                index,
                offset: entry.offset,
                size: entry.size
            }
        );

        scratch.resize(entry.size as usize, 0);
        self.source
            .read_exact_at(start, scratch)
            .context(ReadFailedSnafu { what: "image block" })?;

        if !entry.flags.contains(BlockFlags::PLAIN) {
            self.cipher.decrypt(entry.offset / 16, scratch);
        }

        if scratch.len() == expected {
            trace!(index, "raw block");
            out.copy_from_slice(scratch);
            return Ok(());
        }

        let actual = lzrc::decompress(scratch, out).context(DecompressFailedSnafu { index })?;
        ensure!(
            actual == expected,
            BlockSizeMismatchSnafu {
                index,
                expected,
                actual
            }
        );
        trace!(index, stored = entry.size, "decompressed block");

        Ok(())
    }
}
