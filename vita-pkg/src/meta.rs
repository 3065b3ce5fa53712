use snafu::{OptionExt, Snafu};
use tracing::trace;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::U32,
};

/// Errors when walking the metadata list.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MetaError {
    #[snafu(display(
        "metadata entry #{index} at offset 0x{offset:X} runs past the end of the PKG"
    ))]
    Truncated { index: u32, offset: u64 },

    #[snafu(display("metadata entry #{index} (type {kind}) is too short ({size} bytes)"))]
    EntryTooShort { index: u32, kind: u32, size: u32 },
}

const META_CONTENT_TYPE: u32 = 2;
const META_INSTALL_DIRECTORY: u32 = 10;
const META_ITEM_TABLE: u32 = 13;
const META_SFO: u32 = 14;

const INSTALL_DIRECTORY_LEN: usize = 0x28;

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct MetaEntryHeader {
    kind: U32, // 0x00
    size: U32, // 0x04
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct MetaRange {
    offset: U32, // 0x08
    size: U32,   // 0x0C
}

/// Values recovered from the metadata list.
///
/// Offsets of the item table are relative to the encrypted region; the SFO
/// offset is absolute.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[must_use]
pub struct Metadata {
    content_type: u32,
    items_offset: u64,
    items_size: u64,
    sfo: Option<(u64, u32)>,
    install_directory: Option<String>,
}

impl Metadata {
    /// Walks `count` entries starting at `offset`.
    ///
    /// Unknown entry types are skipped.
    pub fn read(pkg: &[u8], mut offset: u64, count: u32) -> Result<Self, MetaError> {
        let mut meta = Self::default();

        for index in 0..count {
            let entry = usize::try_from(offset)
                .ok()
                .and_then(|start| pkg.get(start..))
                .context(TruncatedSnafu { index, offset })?;

            let (header, rest) = MetaEntryHeader::read_from_prefix(entry)
                .map_err(|_| TruncatedSnafu { index, offset }.build())?;

            let kind = header.kind.get();
            let size = header.size.get();
            let payload = rest
                .get(..size as usize)
                .context(TruncatedSnafu { index, offset })?;

            trace!(index, kind, size, offset, "metadata entry");

            match kind {
                META_CONTENT_TYPE => {
                    let value = payload
                        .get(..4)
                        .and_then(|v| U32::read_from_bytes(v).ok())
                        .context(EntryTooShortSnafu { index, kind, size })?;
                    meta.content_type = value.get();
                }
                META_ITEM_TABLE | META_SFO => {
                    let (range, _) = MetaRange::read_from_prefix(payload)
                        .map_err(|_| EntryTooShortSnafu { index, kind, size }.build())?;

                    if kind == META_ITEM_TABLE {
                        meta.items_offset = range.offset.get().into();
                        meta.items_size = range.size.get().into();
                    } else {
                        meta.sfo = Some((range.offset.get().into(), range.size.get()));
                    }
                }
                META_INSTALL_DIRECTORY => {
                    let raw = payload.get(8..).unwrap_or_default();
                    let raw = &raw[..raw.len().min(INSTALL_DIRECTORY_LEN)];
                    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    if len != 0 {
                        meta.install_directory =
                            Some(String::from_utf8_lossy(&raw[..len]).into_owned());
                    }
                }
                _ => {}
            }

            offset += size_of::<MetaEntryHeader>() as u64 + u64::from(size);
        }

        Ok(meta)
    }

    /// Returns the numeric content type code (0 when absent).
    #[must_use]
    pub const fn content_type(&self) -> u32 {
        self.content_type
    }

    /// Returns the item table offset relative to the encrypted region.
    #[must_use]
    pub const fn items_offset(&self) -> u64 {
        self.items_offset
    }

    /// Returns the declared item table size in bytes.
    #[must_use]
    pub const fn items_size(&self) -> u64 {
        self.items_size
    }

    /// Returns the absolute offset and size of the embedded plain SFO.
    #[must_use]
    pub const fn sfo(&self) -> Option<(u64, u32)> {
        self.sfo
    }

    /// Returns the install directory, present on legacy DLC packages.
    #[must_use]
    pub fn install_directory(&self) -> Option<&str> {
        self.install_directory.as_deref()
    }
}
