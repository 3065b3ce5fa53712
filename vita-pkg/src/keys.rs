//! Static package keys and per-package key derivation.

use crate::crypto::{KeySchedule, key_expand};
use crate::header::PkgHeader;
use snafu::Snafu;
use tracing::debug;

/// Fixed key of PS3 packages and of legacy items not marked as PSP payload.
pub const PS3_KEY: [u8; 16] = [
    0x2e, 0x7b, 0x71, 0xd7, 0xc9, 0xc9, 0xa1, 0x4e, 0xa3, 0x22, 0x1f, 0x18, 0x88, 0x28, 0xb8, 0xf8,
];

/// Fixed key of PSP and PSX packages.
pub const PSP_KEY: [u8; 16] = [
    0x07, 0xf2, 0xc6, 0x82, 0x90, 0xb5, 0x0d, 0x2c, 0x33, 0x81, 0x8d, 0x70, 0x9b, 0x60, 0xe6, 0x2b,
];

/// Vita key used with key type 2 to encrypt the header IV.
pub const VITA_KEY_2: [u8; 16] = [
    0xe3, 0x1a, 0x70, 0xc9, 0xce, 0x1d, 0xd7, 0x2b, 0xf3, 0xc0, 0x62, 0x29, 0x63, 0xf2, 0xec, 0xcb,
];

/// Vita key used with key type 3.
pub const VITA_KEY_3: [u8; 16] = [
    0x42, 0x3a, 0xca, 0x3a, 0x2b, 0xd5, 0x64, 0x9f, 0x96, 0x86, 0xab, 0xad, 0x6f, 0xd8, 0x80, 0x1f,
];

/// Vita key used with key type 4.
pub const VITA_KEY_4: [u8; 16] = [
    0xaf, 0x07, 0xfd, 0x59, 0x65, 0x25, 0x27, 0xba, 0xf1, 0x33, 0x89, 0x66, 0x8b, 0x17, 0xd9, 0xea,
];

/// Payload type byte marking a legacy item as PSP content.
pub const PSP_PAYLOAD_TYPE: u8 = 0x90;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum KeyError {
    #[snafu(display("unsupported key type {key_type}"))]
    UnsupportedKeyType { key_type: u8 },
}

/// Keys derived once per package.
#[derive(Debug, Clone)]
pub struct DerivedKeys {
    main_raw: [u8; 16],
    main: KeySchedule,
    secondary: Option<KeySchedule>,
}

impl DerivedKeys {
    /// Derives the content keys selected by the header's key type.
    pub fn derive(header: &PkgHeader) -> Result<Self, KeyError> {
        let key_type = header.key_type();
        let iv = header.iv();

        let (main_raw, secondary) = match key_type {
            1 => (PSP_KEY, Some(key_expand(&PS3_KEY))),
            2 => (key_expand(&VITA_KEY_2).encrypt_block(iv), None),
            3 => (key_expand(&VITA_KEY_3).encrypt_block(iv), None),
            4 if header.pkg_type() == 1 => (PS3_KEY, Some(key_expand(&PS3_KEY))),
            4 => (key_expand(&VITA_KEY_4).encrypt_block(iv), None),
            _ => return UnsupportedKeyTypeSnafu { key_type }.fail(),
        };

        debug!(
            key_type,
            pkg_type = header.pkg_type(),
            legacy = secondary.is_some(),
            "derived package keys"
        );

        Ok(Self {
            main_raw,
            main: key_expand(&main_raw),
            secondary,
        })
    }

    /// Returns the raw main content key.
    #[must_use]
    pub const fn main_key(&self) -> &[u8; 16] {
        &self.main_raw
    }

    /// Returns the expanded main content key.
    pub fn main(&self) -> &KeySchedule {
        &self.main
    }

    /// Returns the secondary legacy key, present for PSP/PS3 key types only.
    pub fn secondary(&self) -> Option<&KeySchedule> {
        self.secondary.as_ref()
    }

    /// Selects the key for an item of a legacy package by its payload type.
    ///
    /// Falls back to the main key when no secondary key was derived.
    pub fn legacy_item_key(&self, payload_type: u8) -> &KeySchedule {
        match &self.secondary {
            Some(secondary) if payload_type != PSP_PAYLOAD_TYPE => secondary,
            _ => &self.main,
        }
    }
}
