use std::fmt;

use snafu::{Snafu, ensure};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32, U64},
};

/// Errors when reading a PKG header.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("PKG file is too small ({len} bytes)"))]
    TooSmall { len: usize },

    #[snafu(display("invalid PKG magic 0x{magic:08X}"))]
    InvalidMagic { magic: u32 },

    #[snafu(display(
        "PKG file is truncated: {required} bytes declared, {actual} bytes available"
    ))]
    Truncated { required: u64, actual: u64 },
}

pub const PKG_MAGIC: u32 = 0x7F504B47;

/// Size of the main header.
pub const HEADER_SIZE: usize = 0xC0;

/// Size of the optional extended header following the main one.
pub const EXT_HEADER_SIZE: usize = 0x40;

/// Size of one encrypted item record.
pub const ITEM_SIZE: u64 = 32;

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PkgHeaderRaw {
    pub magic: U32,              // 0x00 - 0x7F504B47
    pub revision: U16,           // 0x04
    pub pkg_type: U16,           // 0x06 - 1 on PS3, 2 on PSP/Vita
    pub meta_offset: U32,        // 0x08
    pub meta_count: U32,         // 0x0C
    pub meta_size: U32,          // 0x10
    pub item_count: U32,         // 0x14
    pub total_size: U64,         // 0x18
    pub enc_offset: U64,         // 0x20
    pub enc_size: U64,           // 0x28
    pub content_id: [u8; 0x30],  // 0x30 - product id starts at 0x37
    pub digest: [u8; 0x10],      // 0x60
    pub iv: [u8; 0x10],          // 0x70
    pub header_cmac: [u8; 0x10], // 0x80
    pub npdrm_sig: [u8; 0x28],   // 0x90
    pub sha1: [u8; 0x08],        // 0xB8
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PkgExtHeaderRaw {
    pub magic: U32,              // 0xC0 - 0x7F657874, not always present
    pub unknown: U32,            // 0xC4
    pub ext_hdr_size: U32,       // 0xC8
    pub ext_data_size: U32,      // 0xCC
    pub main_hmac_offset: U32,   // 0xD0
    pub meta_hmac_offset: U32,   // 0xD4
    pub tail_offset: U64,        // 0xD8
    pub padding: U32,            // 0xE0
    pub key_id: U32,             // 0xE4 - low 3 bits select the content key
    pub full_hmac_offset: U32,   // 0xE8
    pub padding2: [u8; 0x14],    // 0xEC
}

/// Parsed PKG header.
#[derive(Debug)]
#[must_use]
pub struct PkgHeader {
    raw_header: PkgHeaderRaw,
    key_type: u8,
}

impl PkgHeader {
    /// Parses the header from the start of the package.
    ///
    /// `pkg` must be the complete package so the declared sizes can be checked.
    ///
    /// # Errors
    ///
    /// Fails if the data is too small, the magic is wrong, or the declared
    /// total size or item table extend past the end of `pkg`.
    pub fn read(pkg: &[u8]) -> Result<Self, ReadError> {
        ensure!(pkg.len() >= HEADER_SIZE, TooSmallSnafu { len: pkg.len() });

        let (raw_header, _) = PkgHeaderRaw::read_from_prefix(pkg)
            .map_err(|_| TooSmallSnafu { len: pkg.len() }.build())?;

        let magic = raw_header.magic.get();
        ensure!(magic == PKG_MAGIC, InvalidMagicSnafu { magic });

        let actual = pkg.len() as u64;
        let total = raw_header.total_size.get();
        ensure!(
            actual >= total,
            TruncatedSnafu {
                required: total,
                actual
            }
        );

        let table_end = raw_header
            .enc_offset
            .get()
            .saturating_add(u64::from(raw_header.item_count.get()) * ITEM_SIZE);
        ensure!(
            actual >= table_end,
            TruncatedSnafu {
                required: table_end,
                actual
            }
        );

        // Packages without the extended header have no usable key type.
        let key_type = pkg
            .get(HEADER_SIZE..HEADER_SIZE + EXT_HEADER_SIZE)
            .and_then(|ext| PkgExtHeaderRaw::read_from_prefix(ext).ok())
            .map_or(0, |(ext, _)| (ext.key_id.get() & 7) as u8);

        Ok(Self {
            raw_header,
            key_type,
        })
    }

    /// Returns the package type field (1 for PS3 packages).
    #[must_use]
    pub const fn pkg_type(&self) -> u16 {
        self.raw_header.pkg_type.get()
    }

    #[must_use]
    pub const fn meta_offset(&self) -> u64 {
        self.raw_header.meta_offset.get() as u64
    }

    #[must_use]
    pub const fn meta_count(&self) -> u32 {
        self.raw_header.meta_count.get()
    }

    /// Returns the number of item records.
    #[must_use]
    pub const fn item_count(&self) -> u32 {
        self.raw_header.item_count.get()
    }

    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.raw_header.total_size.get()
    }

    /// Returns the offset of the encrypted region.
    #[must_use]
    pub const fn enc_offset(&self) -> u64 {
        self.raw_header.enc_offset.get()
    }

    /// Returns the length of the encrypted region.
    #[must_use]
    pub const fn enc_size(&self) -> u64 {
        self.raw_header.enc_size.get()
    }

    /// Returns the CTR initialization vector.
    #[must_use]
    pub const fn iv(&self) -> &[u8; 16] {
        &self.raw_header.iv
    }

    /// Returns the 3-bit key type selector.
    #[must_use]
    pub const fn key_type(&self) -> u8 {
        self.key_type
    }

    /// Returns the raw content id field including trailing padding.
    #[must_use]
    pub const fn content_id_bytes(&self) -> &[u8; 0x30] {
        &self.raw_header.content_id
    }

    /// Returns the content id, e.g. `EP9000-PCSF00001_00-0000000000000000`.
    #[must_use]
    pub fn content_id(&self) -> ContentId<'_> {
        ContentId::new(&self.raw_header.content_id)
    }

    /// Returns the 16 bytes at 0x44, used as display title by PSP themes.
    #[must_use]
    pub fn display_title(&self) -> String {
        let bytes = &self.raw_header.content_id[0x14..0x24];
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }

    /// Returns the raw header.
    #[must_use]
    pub const fn raw_header(&self) -> &PkgHeaderRaw {
        &self.raw_header
    }
}

/// View over a NUL padded content id.
///
/// Format: `<service><publisher>-<product id>_<version>-<label>`
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ContentId<'a> {
    raw: &'a [u8],
}

impl<'a> ContentId<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Self { raw: &raw[..len] }
    }

    /// Returns the 9-character product id (e.g. `PCSE00001`).
    #[must_use]
    pub fn product_id(&self) -> &'a str {
        self.field(7, 16)
    }

    /// Returns the label following the product id (the DLC sub-directory name).
    #[must_use]
    pub fn label(&self) -> &'a str {
        self.field(20, self.raw.len())
    }

    #[must_use]
    pub fn as_str(&self) -> &'a str {
        std::str::from_utf8(self.raw).unwrap_or("<invalid>")
    }

    fn field(&self, start: usize, end: usize) -> &'a str {
        self.raw
            .get(start..end.min(self.raw.len()))
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or("")
    }
}

impl fmt::Display for ContentId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ContentId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentId")
            .field("product_id", &self.product_id())
            .field("label", &self.label())
            .finish()
    }
}
