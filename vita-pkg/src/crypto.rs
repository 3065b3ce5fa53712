//! AES-128 primitives used by every layer of the package format.
//!
//! All functions are pure transforms over caller supplied buffers. CTR mode
//! treats the IV as a 128-bit big-endian counter addressed by 16-byte block
//! index, so any byte range of an encrypted region can be decrypted without
//! touching the bytes before it.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, InnerIvInit, KeyInit, StreamCipher};
use ctr::flavors::Ctr128BE;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128CtrCore = ctr::CtrCore<Aes128, Ctr128BE>;

/// An expanded AES-128 key usable for both directions.
#[derive(Clone)]
pub struct KeySchedule {
    cipher: Aes128,
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySchedule").finish_non_exhaustive()
    }
}

impl KeySchedule {
    /// Encrypts a single block.
    #[must_use]
    pub fn encrypt_block(&self, block: &[u8; 16]) -> [u8; 16] {
        let mut out = GenericArray::clone_from_slice(block);
        self.cipher.encrypt_block(&mut out);
        out.into()
    }

    /// Decrypts a single block.
    #[must_use]
    pub fn decrypt_block(&self, block: &[u8; 16]) -> [u8; 16] {
        let mut out = GenericArray::clone_from_slice(block);
        self.cipher.decrypt_block(&mut out);
        out.into()
    }

    /// XORs `buf` with the CTR keystream starting at `block_index`.
    pub fn ctr_xor(&self, iv: &[u8; 16], block_index: u64, buf: &mut [u8]) {
        self.keystream_xor(iv, u128::from(block_index), 0, buf);
    }

    /// XORs `buf` with the CTR keystream starting at byte `offset`.
    ///
    /// The offset does not need to be block aligned.
    pub fn ctr_xor_at(&self, iv: &[u8; 16], offset: u64, buf: &mut [u8]) {
        let block = u128::from(offset / BLOCK_SIZE as u64);
        let skip = (offset % BLOCK_SIZE as u64) as usize;
        self.keystream_xor(iv, block, skip, buf);
    }

    fn keystream_xor(&self, iv: &[u8; 16], block: u128, skip: usize, buf: &mut [u8]) {
        let counter = u128::from_be_bytes(*iv).wrapping_add(block).to_be_bytes();
        let core =
            Aes128CtrCore::inner_iv_init(self.cipher.clone(), GenericArray::from_slice(&counter));
        let mut stream = Aes128Ctr::from_core(core);

        if skip != 0 {
            let mut discard = [0u8; BLOCK_SIZE];
            stream.apply_keystream(&mut discard[..skip]);
        }

        stream.apply_keystream(buf);
    }
}

/// Expands a raw 16-byte key into its round keys.
#[must_use]
pub fn key_expand(key: &[u8; 16]) -> KeySchedule {
    KeySchedule {
        cipher: Aes128::new(GenericArray::from_slice(key)),
    }
}

/// Encrypts one block in ECB mode.
#[must_use]
pub fn ecb_encrypt(schedule: &KeySchedule, block: &[u8; 16]) -> [u8; 16] {
    schedule.encrypt_block(block)
}

/// Decrypts one block in ECB mode.
#[must_use]
pub fn ecb_decrypt(schedule: &KeySchedule, block: &[u8; 16]) -> [u8; 16] {
    schedule.decrypt_block(block)
}

/// XORs `buf` in place with the CTR keystream for `iv`, starting at `block_index`.
///
/// A trailing partial block uses the leading bytes of its keystream block.
pub fn ctr_xor(schedule: &KeySchedule, iv: &[u8; 16], block_index: u64, buf: &mut [u8]) {
    schedule.ctr_xor(iv, block_index, buf);
}

/// Computes the one-key CMAC (RFC 4493) of `data` under `key`.
#[must_use]
pub fn cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let schedule = key_expand(key);

    let k1 = cmac_double(&schedule.encrypt_block(&[0u8; 16]));
    let k2 = cmac_double(&k1);

    let blocks = data.len().div_ceil(BLOCK_SIZE).max(1);
    let (head, tail) = data.split_at((blocks - 1) * BLOCK_SIZE);

    let mut state = [0u8; 16];
    for chunk in head.chunks_exact(BLOCK_SIZE) {
        xor_in_place(&mut state, chunk);
        state = schedule.encrypt_block(&state);
    }

    let mut last = [0u8; 16];
    if tail.len() == BLOCK_SIZE {
        last.copy_from_slice(tail);
        xor_in_place(&mut last, &k1);
    } else {
        last[..tail.len()].copy_from_slice(tail);
        last[tail.len()] = 0x80;
        xor_in_place(&mut last, &k2);
    }

    xor_in_place(&mut state, &last);
    schedule.encrypt_block(&state)
}

/// Chained-block transform used by nested legacy payloads.
///
/// Each 16-byte block is XORed with `AES-ECB-decrypt(counter)` and the counter
/// block of the previous step. The counter is `iv` with a little-endian 32-bit
/// sequence number in its last four bytes, seeded with `index` and bumped before
/// every block. Index 0 starts from an all-zero previous block. The transform is
/// its own inverse.
pub fn chained_decrypt(schedule: &KeySchedule, iv: &[u8; 16], index: u32, buf: &mut [u8]) {
    let mut prev = [0u8; 16];
    if index != 0 {
        prev[..12].copy_from_slice(&iv[..12]);
        prev[12..].copy_from_slice(&index.to_le_bytes());
    }

    let mut block = *iv;
    let mut counter = index;

    for chunk in buf.chunks_mut(BLOCK_SIZE) {
        counter = counter.wrapping_add(1);
        block[12..].copy_from_slice(&counter.to_le_bytes());

        let out = schedule.decrypt_block(&block);
        for ((byte, p), o) in chunk.iter_mut().zip(prev).zip(out) {
            *byte ^= p ^ o;
        }

        prev = block;
    }
}

/// XORs `src` into `dst`.
pub fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

fn cmac_double(block: &[u8; 16]) -> [u8; 16] {
    let value = u128::from_be_bytes(*block);
    let carry = if value >> 127 == 1 { 0x87 } else { 0 };
    ((value << 1) ^ carry).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn hex16(s: &str) -> [u8; 16] {
        hex(s).try_into().unwrap()
    }

    const NIST_KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const NIST_PLAIN: &str = "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51\
                              30c81c46a35ce411e5fbc1191a0a52eff69f2445df4f9b17ad2b417be66c3710";

    #[test]
    fn ecb_matches_fips197() {
        let schedule = key_expand(&hex16("000102030405060708090a0b0c0d0e0f"));
        let plain = hex16("00112233445566778899aabbccddeeff");
        let cipher = ecb_encrypt(&schedule, &plain);

        assert_eq!(cipher, hex16("69c4e0d86a7b0430d8cdb78070b4c55a"));
        assert_eq!(ecb_decrypt(&schedule, &cipher), plain);
    }

    #[test]
    fn ctr_matches_sp800_38a() {
        let schedule = key_expand(&hex16(NIST_KEY));
        let iv = hex16("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let mut data = hex(NIST_PLAIN);

        ctr_xor(&schedule, &iv, 0, &mut data);

        assert_eq!(
            data,
            hex("874d6191b620e3261bef6864990db6ce9806f66b7970fdff8617187bb9fffdff\
                 5ae4df3edbd5d35e5b4f09020db03eab1e031dda2fbe03d1792170a0f3009cee")
        );
    }

    #[test]
    fn ctr_block_index_addresses_later_blocks() {
        let schedule = key_expand(&hex16(NIST_KEY));
        let iv = hex16("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let mut tail = hex(NIST_PLAIN)[32..].to_vec();

        ctr_xor(&schedule, &iv, 2, &mut tail);

        assert_eq!(
            tail,
            hex("5ae4df3edbd5d35e5b4f09020db03eab1e031dda2fbe03d1792170a0f3009cee")
        );
    }

    #[test]
    fn ctr_unaligned_offsets_and_partial_blocks() {
        let schedule = key_expand(&hex16(NIST_KEY));
        let iv = [0xffu8; 16];
        let plain: Vec<u8> = (0..100u8).collect();

        let mut whole = plain.clone();
        schedule.ctr_xor_at(&iv, 0, &mut whole);

        let mut piece = plain[21..77].to_vec();
        schedule.ctr_xor_at(&iv, 21, &mut piece);
        assert_eq!(piece, whole[21..77]);

        ctr_xor(&schedule, &iv, 0, &mut whole);
        assert_eq!(whole, plain);
    }

    #[test]
    fn ctr_counter_wraps_at_the_top_of_the_block_index_range() {
        let schedule = key_expand(&hex16(NIST_KEY));
        let iv = [0u8; 16];
        let mut data = [0u8; 32];

        schedule.ctr_xor(&iv, u64::MAX, &mut data);

        let first = (u128::from(u64::MAX)).to_be_bytes();
        let second = (u128::from(u64::MAX) + 1).to_be_bytes();
        assert_eq!(data[..16], schedule.encrypt_block(&first));
        assert_eq!(data[16..], schedule.encrypt_block(&second));

        let mut at = [0u8; 5];
        schedule.ctr_xor_at(&iv, u64::MAX, &mut at);
        let last = (u128::from(u64::MAX / 16)).to_be_bytes();
        assert_eq!(at[..1], schedule.encrypt_block(&last)[15..]);
    }

    #[test]
    fn cmac_matches_rfc4493() {
        let key = hex16(NIST_KEY);
        let msg = hex(NIST_PLAIN);

        assert_eq!(cmac(&key, &[]), hex16("bb1d6929e95937287fa37d129b756746"));
        assert_eq!(
            cmac(&key, &msg[..16]),
            hex16("070a16b46b4d4144f79bdd9dd04a287c")
        );
        assert_eq!(
            cmac(&key, &msg[..40]),
            hex16("dfa66747de9ae63030ca32611497c827")
        );
        assert_eq!(cmac(&key, &msg), hex16("51f0bebf7e3b9d92fc49741779363cfe"));
    }

    #[test]
    fn chained_decrypt_is_an_involution() {
        let schedule = key_expand(&hex16(NIST_KEY));
        let iv = hex16("000102030405060708090a0b0c0d0e0f");
        let plain: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(7)).collect();

        let mut data = plain.clone();
        chained_decrypt(&schedule, &iv, 3, &mut data);
        assert_ne!(data, plain);

        chained_decrypt(&schedule, &iv, 3, &mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn chained_decrypt_continues_from_block_index() {
        let schedule = key_expand(&hex16(NIST_KEY));
        let iv = hex16("a0a1a2a3a4a5a6a7a8a9aaabacadaeaf");
        let plain = [0x5au8; 96];

        let mut whole = plain;
        chained_decrypt(&schedule, &iv, 4, &mut whole);

        let mut split = plain;
        let (first, second) = split.split_at_mut(32);
        chained_decrypt(&schedule, &iv, 4, first);
        chained_decrypt(&schedule, &iv, 6, second);

        assert_eq!(whole, split);
    }
}
