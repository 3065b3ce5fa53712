use std::io;

use crate::crypto::KeySchedule;

/// Positional read access to the bytes of one item.
///
/// Implemented by [`ItemReader`] for package items and by byte slices, so the
/// nested decoders can run against in-memory data in tests.
pub trait ItemSource {
    /// Reads bytes at `offset` into `buf`.
    ///
    /// Returns the number of bytes read. A short read means the end of the
    /// item was reached.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the item ends first.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut total = 0;

        while total < buf.len() {
            let n = self.read_at(offset + total as u64, &mut buf[total..])?;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of item",
                ));
            }

            total += n;
        }

        Ok(())
    }

    /// Returns the item length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ItemSource for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Some(rest) = usize::try_from(offset).ok().and_then(|o| self.get(o..)) else {
            return Ok(0);
        };

        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }

    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }
}

impl ItemSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.as_slice().read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        Vec::len(self) as u64
    }
}

/// Reads an item's data, decrypting on the fly.
///
/// Any offset can be read without touching the bytes before it.
#[derive(Clone, Copy)]
#[must_use]
pub struct ItemReader<'a> {
    data: &'a [u8],
    key: Option<&'a KeySchedule>,
    iv: &'a [u8; 16],
    /// Offset of `data` inside the encrypted region.
    base: u64,
}

impl<'a> ItemReader<'a> {
    pub(crate) fn new(
        data: &'a [u8],
        key: Option<&'a KeySchedule>,
        iv: &'a [u8; 16],
        base: u64,
    ) -> Self {
        Self {
            data,
            key,
            iv,
            base,
        }
    }

    /// Returns `true` when reads return plaintext.
    #[must_use]
    pub fn decrypts(&self) -> bool {
        self.key.is_some()
    }

    /// Returns the whole item in one buffer.
    #[must_use]
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = self.data.to_vec();
        if let Some(key) = self.key {
            key.ctr_xor_at(self.iv, self.base, &mut out);
        }
        out
    }
}

impl std::fmt::Debug for ItemReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemReader")
            .field("len", &self.data.len())
            .field("base", &self.base)
            .field("decrypts", &self.decrypts())
            .finish_non_exhaustive()
    }
}

impl ItemSource for ItemReader<'_> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.read_at(offset, buf)?;

        if let Some(key) = self.key {
            key.ctr_xor_at(self.iv, self.base + offset, &mut buf[..n]);
        }

        Ok(n)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_expand;

    #[test]
    fn slices_read_short_at_the_end() {
        let data = vec![1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 4];

        assert_eq!(data.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(data.read_at(9, &mut buf).unwrap(), 0);
        assert!(data.read_exact_at(2, &mut buf).is_err());
    }

    #[test]
    fn reader_decrypts_any_offset() {
        let key = key_expand(&[7u8; 16]);
        let iv = [0x11u8; 16];
        let plain: Vec<u8> = (0..200u8).collect();

        // The item starts 0x40 bytes into the encrypted region.
        let mut cipher = plain.clone();
        key.ctr_xor_at(&iv, 0x40, &mut cipher);

        let reader = ItemReader::new(&cipher, Some(&key), &iv, 0x40);
        let mut buf = [0u8; 50];
        reader.read_exact_at(33, &mut buf).unwrap();

        assert_eq!(buf, plain[33..83]);
        assert_eq!(reader.read_all(), plain);

        let raw = ItemReader::new(&cipher, None, &iv, 0x40);
        assert_eq!(raw.read_all(), cipher);
    }
}
