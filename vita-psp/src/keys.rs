//! Fixed keys and the key derivation of PSP DRM containers.
//!
//! Reference: <https://www.psdevwiki.com/psp/Kirk>

use vita_pkg::crypto::{KeySchedule, chained_decrypt, key_expand, xor_in_place};

/// KIRK command 7 key 0x38, also the CMAC key of every derivation.
pub const KIRK7_KEY38: [u8; 16] = [
    0x12, 0x46, 0x8d, 0x7e, 0x1c, 0x42, 0x20, 0x9b, 0xba, 0x54, 0x26, 0x83, 0x5e, 0xb0, 0x33, 0x03,
];

/// KIRK command 7 key 0x39.
pub const KIRK7_KEY39: [u8; 16] = [
    0xc4, 0x3b, 0xb6, 0xd6, 0x53, 0xee, 0x67, 0x49, 0x3e, 0xa9, 0x5f, 0xbc, 0x0c, 0xed, 0x6f, 0x8a,
];

/// KIRK command 7 key 0x63, the key of the chained cipher.
pub const KIRK7_KEY63: [u8; 16] = [
    0x9c, 0x9b, 0x13, 0x72, 0xf8, 0xc6, 0x40, 0xcf, 0x1c, 0x62, 0xf5, 0xd5, 0x92, 0xdd, 0xb5, 0x82,
];

const AMCTL_HASHKEY_3: [u8; 16] = [
    0xe3, 0x50, 0xed, 0x1d, 0x91, 0x0a, 0x1f, 0xd0, 0x29, 0xbb, 0x1c, 0x3e, 0xf3, 0x40, 0x77, 0xfb,
];

const AMCTL_HASHKEY_4: [u8; 16] = [
    0x13, 0x5f, 0xa4, 0x7c, 0xab, 0x39, 0x5b, 0xa4, 0x76, 0xb8, 0xcc, 0xa9, 0x8f, 0x3a, 0x04, 0x45,
];

const AMCTL_HASHKEY_5: [u8; 16] = [
    0x67, 0x8d, 0x7f, 0xa3, 0x2a, 0x9c, 0xa0, 0xd1, 0x50, 0x8a, 0xd8, 0x38, 0x5e, 0x4b, 0x01, 0x7e,
];

/// How the key seed is stored in a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    /// The seed is itself encrypted with key 0x63 (EBOOT `data.psar`).
    Wrapped,
    /// The seed is stored as is (`PSP-KEY.EDAT`).
    Plain,
}

/// The chained-block cipher of one PSP DRM header.
#[derive(Clone)]
pub struct PspCipher {
    key: KeySchedule,
    iv: [u8; 16],
}

impl std::fmt::Debug for PspCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PspCipher").finish_non_exhaustive()
    }
}

impl PspCipher {
    /// Derives the cipher from a header MAC and two 16-byte header fields.
    ///
    /// `mac` is the CMAC under [`KIRK7_KEY38`] of the signed header prefix.
    pub fn derive(kind: SeedKind, mac: &[u8; 16], key_seed: &[u8; 16], iv_seed: &[u8; 16]) -> Self {
        let key63 = key_expand(&KIRK7_KEY63);

        let seed = match kind {
            SeedKind::Wrapped => key63.decrypt_block(key_seed),
            SeedKind::Plain => *key_seed,
        };
        let seed = key_expand(&KIRK7_KEY38).decrypt_block(&seed);

        let mut iv = *mac;
        for part in [&seed, iv_seed, &AMCTL_HASHKEY_3, &AMCTL_HASHKEY_5] {
            xor_in_place(&mut iv, part);
        }

        let mut iv = key_expand(&KIRK7_KEY39).decrypt_block(&iv);
        xor_in_place(&mut iv, &AMCTL_HASHKEY_4);

        Self { key: key63, iv }
    }

    /// Builds a cipher from an explicit key and IV.
    pub fn new(key: &[u8; 16], iv: [u8; 16]) -> Self {
        Self {
            key: key_expand(key),
            iv,
        }
    }

    /// Decrypts `buf` in place, starting at block `index`.
    pub fn decrypt(&self, index: u32, buf: &mut [u8]) {
        chained_decrypt(&self.key, &self.iv, index, buf);
    }
}
