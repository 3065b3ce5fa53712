//! `param.sfo` key/value metadata.
//!
//! Reference: <https://www.psdevwiki.com/ps3/PARAM.SFO>

use snafu::{OptionExt, Snafu, ensure};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32},
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SfoError {
    #[snafu(display("SFO is too small ({size} bytes)"))]
    TooSmall { size: u64 },

    #[snafu(display("SFO is too big ({size} bytes)"))]
    TooBig { size: u64 },

    #[snafu(display("invalid SFO magic 0x{magic:08X}"))]
    InvalidMagic { magic: u32 },

    #[snafu(display("SFO entry #{index} points outside the SFO"))]
    EntryOutOfRange { index: u32 },

    #[snafu(display("SFO has no title"))]
    MissingTitle,
}

/// Smallest accepted SFO.
pub const MIN_SFO_SIZE: u64 = 16;

/// Largest accepted SFO.
pub const MAX_SFO_SIZE: u64 = 16 * 1024;

const SFO_MAGIC: u32 = 0x46535000;

/// Longer values are truncated.
const MAX_VALUE_LEN: usize = 255;

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SfoHeader {
    magic: U32,        // 0x00 - "\0PSF"
    version: U32,      // 0x04
    key_table: U32,    // 0x08
    value_table: U32,  // 0x0C
    count: U32,        // 0x10
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SfoEntry {
    key_offset: U16,   // 0x00
    format: U16,       // 0x02
    len: U32,          // 0x04
    max_len: U32,      // 0x08
    value_offset: U32, // 0x0C
}

/// The fields of `param.sfo` used for naming and dispatch.
///
/// The title is returned raw; see [`crate::naming::sanitize_title`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct ParamSfo {
    pub title: String,
    pub content_id: Option<String>,
    pub category: String,
    pub min_version: Option<String>,
    pub app_version: Option<String>,
}

impl ParamSfo {
    /// Parses an SFO blob.
    ///
    /// `STITLE` wins over `TITLE` regardless of order. The firmware version has
    /// one leading and one trailing `0` dropped (`03.600` becomes `3.60`), the
    /// application version one leading `0`.
    pub fn parse(data: &[u8]) -> Result<Self, SfoError> {
        let size = data.len() as u64;
        ensure!(size >= MIN_SFO_SIZE, TooSmallSnafu { size });
        ensure!(size <= MAX_SFO_SIZE, TooBigSnafu { size });

        let (header, _) =
            SfoHeader::read_from_prefix(data).map_err(|_| TooSmallSnafu { size }.build())?;

        let magic = header.magic.get();
        ensure!(magic == SFO_MAGIC, InvalidMagicSnafu { magic });

        let keys = header.key_table.get() as usize;
        let values = header.value_table.get() as usize;

        let mut sfo = Self::default();
        let mut have_short_title = false;
        let mut have_title = false;

        for index in 0..header.count.get() {
            let start = size_of::<SfoHeader>() + index as usize * size_of::<SfoEntry>();
            let (entry, _) = data
                .get(start..)
                .and_then(|v| SfoEntry::read_from_prefix(v).ok())
                .context(EntryOutOfRangeSnafu { index })?;

            let key = c_string(data, keys + usize::from(entry.key_offset.get()))
                .context(EntryOutOfRangeSnafu { index })?;
            let value = || {
                c_string(data, values + entry.value_offset.get() as usize)
                    .context(EntryOutOfRangeSnafu { index })
            };

            match key {
                b"TITLE" if !have_short_title => {
                    sfo.title = lossy(value()?);
                    have_title = true;
                }
                b"STITLE" => {
                    sfo.title = lossy(value()?);
                    have_short_title = true;
                    have_title = true;
                }
                b"CONTENT_ID" => sfo.content_id = Some(lossy(value()?)),
                b"CATEGORY" => sfo.category = lossy(value()?),
                b"PSP2_DISP_VER" => {
                    let v = value()?;
                    let v = v.strip_prefix(b"0").unwrap_or(v);
                    let v = v.strip_suffix(b"0").unwrap_or(v);
                    sfo.min_version = Some(lossy(v));
                }
                b"APP_VER" => {
                    let v = value()?;
                    sfo.app_version = Some(lossy(v.strip_prefix(b"0").unwrap_or(v)));
                }
                _ => {}
            }
        }

        ensure!(have_title, MissingTitleSnafu);

        Ok(sfo)
    }
}

fn c_string(data: &[u8], offset: usize) -> Option<&[u8]> {
    let rest = data.get(offset..)?;
    let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    Some(&rest[..len.min(MAX_VALUE_LEN)])
}

fn lossy(v: &[u8]) -> String {
    String::from_utf8_lossy(v).into_owned()
}
