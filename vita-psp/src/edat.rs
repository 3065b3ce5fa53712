//! Recovery of the game key from `PSP-KEY.EDAT`.

use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;
use vita_pkg::crypto::cmac;
use vita_pkg::source::ItemSource;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned, little_endian::U32};

use crate::keys::{KIRK7_KEY38, PspCipher, SeedKind};

use edat_error::*;

/// Offset of the PGD header inside the file.
const PGD_OFFSET: u64 = 0x90;

const PGD_MAGIC: &[u8; 4] = b"\0PGD";

/// Size of the signed part of [`PgdHeader`].
const PGD_SIGNED_SIZE: usize = 0x70;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PgdHeader {
    magic: [u8; 4],          // 0x00 - "\0PGD"
    key_index: U32,          // 0x04
    drm_type: U32,           // 0x08
    _unknown_0c: U32,        // 0x0C
    iv_seed: [u8; 0x10],     // 0x10
    _unknown_20: [u8; 0x10], // 0x20
    data_key: [u8; 0x10],    // 0x30 - encrypted, then the seed of the key IV
    _unknown_40: U32,        // 0x40
    data_size: U32,          // 0x44 - encrypted
    _unknown_48: U32,        // 0x48
    data_offset: U32,        // 0x4C - encrypted
    _unknown_50: [u8; 0x10], // 0x50
    _unknown_60: [u8; 0x10], // 0x60
    key_seed: [u8; 0x10],    // 0x70
    _unknown_80: [u8; 0x10], // 0x80
    key: [u8; 0x10],         // 0x90 - encrypted
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum EdatError {
    #[snafu(display("PSP-KEY.EDAT is too short ({size} bytes)"))]
    TooShort { size: u64 },

    #[snafu(display("cannot read the PGD header"))]
    ReadFailed { source: std::io::Error },

    #[snafu(display("invalid PGD magic"))]
    InvalidMagic,

    #[snafu(display("unsupported PSP-KEY.EDAT key index {key_index} / DRM type {drm_type}"))]
    UnsupportedType { key_index: u32, drm_type: u32 },

    #[snafu(display("unsupported PSP-KEY.EDAT data size {size:#x} at offset {offset:#x}"))]
    UnsupportedLayout { size: u32, offset: u32 },
}

/// Decrypts the 16-byte key held by the decrypted `PSP-KEY.EDAT` in `source`.
pub fn unwrap_psp_key<S: ItemSource + ?Sized>(source: &S) -> Result<[u8; 16], EdatError> {
    let size = source.len();
    ensure!(
        size >= PGD_OFFSET + size_of::<PgdHeader>() as u64,
        TooShortSnafu { size }
    );

    let mut header = PgdHeader::new_zeroed();
    source
        .read_exact_at(PGD_OFFSET, header.as_mut_bytes())
        .context(ReadFailedSnafu)?;

    ensure!(&header.magic == PGD_MAGIC, InvalidMagicSnafu);
    let key_index = header.key_index.get();
    let drm_type = header.drm_type.get();
    ensure!(
        key_index == 1 && drm_type == 1,
        UnsupportedTypeSnafu {
            key_index,
            drm_type
        }
    );

    let mac = cmac(&KIRK7_KEY38, &header.as_bytes()[..PGD_SIGNED_SIZE]);
    let key = decrypt_key(&mut header, &mac)?;

    debug!("unwrapped PSP-KEY.EDAT");
    Ok(key)
}

/// Decrypts the data descriptor and then the key of a header signed by `mac`.
fn decrypt_key(header: &mut PgdHeader, mac: &[u8; 16]) -> Result<[u8; 16], EdatError> {
    let cipher = PspCipher::derive(SeedKind::Plain, mac, &header.key_seed, &header.iv_seed);
    cipher.decrypt(0, &mut header.as_mut_bytes()[0x30..0x60]);

    let data_size = header.data_size.get();
    let data_offset = header.data_offset.get();
    ensure!(
        data_size == 0x10 && data_offset == 0x90,
        UnsupportedLayoutSnafu {
            size: data_size,
            offset: data_offset
        }
    );

    let cipher = PspCipher::derive(SeedKind::Plain, mac, &header.key_seed, &header.data_key);
    cipher.decrypt(0, &mut header.key);
    Ok(header.key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_file(magic: &[u8; 4], key_index: u32, drm_type: u32) -> Vec<u8> {
        let mut data = vec![0u8; 0x90];
        data.extend_from_slice(magic);
        data.extend_from_slice(&key_index.to_le_bytes());
        data.extend_from_slice(&drm_type.to_le_bytes());
        data.resize(0x90 + 0xA0, 0x33);
        data
    }

    /// A key header whose encrypted fields were produced under the MAC
    /// `A0 A1 .. AF`.
    fn signed_header() -> PgdHeader {
        let mut raw = vec![0u8; 0xA0];
        raw[..4].copy_from_slice(PGD_MAGIC);
        raw[4..8].copy_from_slice(&1u32.to_le_bytes());
        raw[8..12].copy_from_slice(&1u32.to_le_bytes());
        raw[0x10..0x20].copy_from_slice(&std::array::from_fn::<u8, 16, _>(|i| 0x10 + i as u8));
        raw[0x20..0x30].fill(0x55);
        raw[0x30..0x60].copy_from_slice(&[
            0xC9, 0x57, 0xB2, 0x1E, 0xB2, 0x47, 0x7C, 0x8E, 0xE9, 0xA1, 0xE0, 0x0B, //
            0x57, 0x0A, 0x32, 0x33, 0xE3, 0x9A, 0xA6, 0x93, 0x8A, 0x51, 0x33, 0xAC, //
            0xB5, 0x1A, 0xAB, 0x9A, 0xD1, 0x5E, 0x0C, 0x2A, 0x74, 0x41, 0x65, 0x33, //
            0x2F, 0xD0, 0x53, 0xE1, 0x17, 0x5F, 0x31, 0x32, 0x3A, 0xFF, 0xFF, 0x4D,
        ]);
        raw[0x70..0x80].copy_from_slice(&std::array::from_fn::<u8, 16, _>(|i| 0x70 + i as u8));
        raw[0x80..0x90].fill(0x66);
        raw[0x90..0xA0].copy_from_slice(&[
            0x5C, 0x2B, 0x8F, 0xB3, 0xE8, 0x77, 0x8F, 0xC6, 0x4E, 0xC1, 0x7E, 0x70, 0x35, 0x25, 0x3E, 0x50,
        ]);

        let mut header = PgdHeader::new_zeroed();
        header.as_mut_bytes().copy_from_slice(&raw);
        header
    }

    fn test_mac() -> [u8; 16] {
        std::array::from_fn(|i| 0xA0 + i as u8)
    }

    #[test]
    fn key_decrypts_to_known_value() {
        let mut header = signed_header();
        let key = decrypt_key(&mut header, &test_mac()).unwrap();
        assert_eq!(&key, b"ULUS10041 GAMEKY");

        // The descriptor is decrypted in place on the way.
        let data_key: [u8; 16] = std::array::from_fn(|i| 0x30 + i as u8);
        assert_eq!(header.data_key, data_key);
        assert_eq!(header.data_size.get(), 0x10);
        assert_eq!(header.data_offset.get(), 0x90);
    }

    #[test]
    fn wrong_mac_breaks_the_descriptor() {
        let mut mac = test_mac();
        mac[15] ^= 1;
        assert!(matches!(
            decrypt_key(&mut signed_header(), &mac),
            Err(EdatError::UnsupportedLayout { .. })
        ));
    }

    #[test]
    fn short_files_are_rejected() {
        let data = vec![0u8; 0x12F];
        assert!(matches!(
            unwrap_psp_key(data.as_slice()),
            Err(EdatError::TooShort { size: 0x12F })
        ));
    }

    #[test]
    fn header_type_is_checked() {
        assert!(matches!(
            unwrap_psp_key(key_file(b"\0PGX", 1, 1).as_slice()),
            Err(EdatError::InvalidMagic)
        ));
        assert!(matches!(
            unwrap_psp_key(key_file(b"\0PGD", 2, 1).as_slice()),
            Err(EdatError::UnsupportedType {
                key_index: 2,
                drm_type: 1
            })
        ));
    }

    #[test]
    fn undecryptable_layout_is_rejected() {
        // Without the right signature the decrypted size and offset are noise.
        assert!(matches!(
            unwrap_psp_key(key_file(b"\0PGD", 1, 1).as_slice()),
            Err(EdatError::UnsupportedLayout { .. })
        ));
    }
}
