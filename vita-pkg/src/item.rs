use snafu::{Snafu, ensure};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U32, U64},
};

/// Errors for a single item record.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ItemError {
    #[snafu(display("item #{index} record at 0x{offset:X} runs past the end of the PKG"))]
    RecordOutOfRange { index: u32, offset: u64 },

    #[snafu(display("item #{index} {field} offset 0x{offset:X} is not 16-byte aligned"))]
    Misaligned {
        index: u32,
        field: &'static str,
        offset: u64,
    },

    #[snafu(display(
        "item #{index} {field} range ends at 0x{end:X}, past the PKG size 0x{pkg_size:X}"
    ))]
    OutOfRange {
        index: u32,
        field: &'static str,
        end: u64,
        pkg_size: u64,
    },

    #[snafu(display("item #{index} has a {size} byte name"))]
    NameTooLong { index: u32, size: u32 },
}

/// Names of this size or longer are rejected.
pub const MAX_NAME_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct ItemRaw {
    name_offset: U32,  // 0x00
    name_size: U32,    // 0x04
    data_offset: U64,  // 0x08
    data_size: U64,    // 0x10
    payload_type: u8,  // 0x18
    unknown: [u8; 2],  // 0x19
    flags: u8,         // 0x1B
    padding: [u8; 4],  // 0x1C
}

/// A decrypted item record.
///
/// Name and data offsets are relative to the encrypted region.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Item {
    index: u32,
    name: String,
    name_offset: u64,
    name_size: u32,
    data_offset: u64,
    data_size: u64,
    payload_type: u8,
    flags: u8,
}

impl Item {
    pub const RAW_SIZE: usize = size_of::<ItemRaw>();

    /// Parses a decrypted 32-byte record. The name is filled in separately.
    pub(crate) fn parse(index: u32, record: &[u8; 32]) -> Self {
        let raw: ItemRaw = zerocopy::transmute!(*record);

        Self {
            index,
            name: String::new(),
            name_offset: raw.name_offset.get().into(),
            name_size: raw.name_size.get(),
            data_offset: raw.data_offset.get(),
            data_size: raw.data_size.get(),
            payload_type: raw.payload_type,
            flags: raw.flags,
        }
    }

    /// Checks alignment, the name cap and both ranges against the package size.
    pub(crate) fn validate(&self, enc_offset: u64, pkg_size: u64) -> Result<(), ItemError> {
        let index = self.index;

        for (field, offset) in [("name", self.name_offset), ("data", self.data_offset)] {
            ensure!(
                offset % 16 == 0,
                MisalignedSnafu {
                    index,
                    field,
                    offset
                }
            );
        }

        ensure!(
            self.name_size < MAX_NAME_SIZE,
            NameTooLongSnafu {
                index,
                size: self.name_size
            }
        );

        let ranges = [
            ("name", self.name_offset, u64::from(self.name_size)),
            ("data", self.data_offset, self.data_size),
        ];
        for (field, offset, size) in ranges {
            let end = enc_offset
                .checked_add(offset)
                .and_then(|v| v.checked_add(size))
                .unwrap_or(u64::MAX);
            ensure!(
                end <= pkg_size,
                OutOfRangeSnafu {
                    index,
                    field,
                    end,
                    pkg_size
                }
            );
        }

        Ok(())
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Returns the position of this item in the item table.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the decrypted item name, e.g. `sce_sys/param.sfo`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn name_offset(&self) -> u64 {
        self.name_offset
    }

    #[must_use]
    pub const fn name_size(&self) -> u32 {
        self.name_size
    }

    #[must_use]
    pub const fn data_offset(&self) -> u64 {
        self.data_offset
    }

    #[must_use]
    pub const fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Returns the payload type byte; `0x90` marks PSP content in legacy packages.
    #[must_use]
    pub const fn payload_type(&self) -> u8 {
        self.payload_type
    }

    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    /// Returns `true` for directory records (flags 4 or 18).
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        matches!(self.flags, 4 | 18)
    }
}
