//! Builders for synthetic packages and a minimal reader for the archives
//! produced from them.

#![allow(dead_code)]

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use std::io::{Cursor, Read};
use vita_pkg::crypto::{KeySchedule, key_expand};
use vita_pkg::header::PKG_MAGIC;
use vita_pkg::keys::{PS3_KEY, PSP_KEY, PSP_PAYLOAD_TYPE, VITA_KEY_2};

pub const IV: [u8; 16] = [0x42; 16];
pub const META_OFFSET: usize = 0x100;

pub const VITA_CONTENT_ID: &str = "UP0001-PCSE00001_00-GAMEDATA00000001";
pub const PSP_CONTENT_ID: &str = "UP9000-ULUS10041_00-0000000000000001";

pub const FLAG_FILE: u8 = 3;
pub const FLAG_DIRECTORY: u8 = 4;

pub struct TestItem {
    pub name: String,
    pub data: Vec<u8>,
    pub flags: u8,
    pub payload_type: u8,
}

pub fn file(name: &str, data: &[u8]) -> TestItem {
    TestItem {
        name: name.to_owned(),
        data: data.to_vec(),
        flags: FLAG_FILE,
        payload_type: 0,
    }
}

pub fn directory(name: &str) -> TestItem {
    TestItem {
        name: name.to_owned(),
        data: Vec::new(),
        flags: FLAG_DIRECTORY,
        payload_type: 0,
    }
}

/// Builds an encrypted package in memory.
pub struct PkgBuilder {
    key_type: u8,
    content_type: u32,
    content_id: String,
    sfo: Option<Vec<u8>>,
    items: Vec<TestItem>,
    tail: usize,
}

impl PkgBuilder {
    /// A key type 2 package.
    pub fn vita(content_type: u32) -> Self {
        Self {
            key_type: 2,
            content_type,
            content_id: VITA_CONTENT_ID.to_owned(),
            sfo: None,
            items: Vec::new(),
            tail: 0x40,
        }
    }

    /// A key type 1 package; items pick their key by payload type.
    pub fn psp(content_type: u32) -> Self {
        Self {
            key_type: 1,
            content_type,
            content_id: PSP_CONTENT_ID.to_owned(),
            sfo: None,
            items: Vec::new(),
            tail: 0,
        }
    }

    pub fn content_id(mut self, content_id: &str) -> Self {
        self.content_id = content_id.to_owned();
        self
    }

    /// Stores a plain SFO referenced from the metadata list.
    pub fn sfo(mut self, sfo: Vec<u8>) -> Self {
        self.sfo = Some(sfo);
        self
    }

    pub fn item(mut self, item: TestItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn tail(mut self, tail: usize) -> Self {
        self.tail = tail;
        self
    }

    fn main_key(&self) -> KeySchedule {
        match self.key_type {
            1 => key_expand(&PSP_KEY),
            _ => key_expand(&key_expand(&VITA_KEY_2).encrypt_block(&IV)),
        }
    }

    fn item_key(&self, item: &TestItem) -> KeySchedule {
        if self.key_type == 1 && item.payload_type != PSP_PAYLOAD_TYPE {
            key_expand(&PS3_KEY)
        } else {
            self.main_key()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let table_size = self.items.len() * 32;

        // Item table, then each name and data block 16-byte aligned.
        let mut body = vec![0u8; table_size];
        let mut records = Vec::new();
        let mut regions = Vec::new();
        for item in &self.items {
            let name_offset = body.len();
            body.extend_from_slice(item.name.as_bytes());
            body.resize(body.len().next_multiple_of(16), 0);
            let data_offset = body.len();
            body.extend_from_slice(&item.data);
            body.resize(body.len().next_multiple_of(16), 0);

            records.write_u32::<BigEndian>(name_offset as u32).unwrap();
            records.write_u32::<BigEndian>(item.name.len() as u32).unwrap();
            records.write_u64::<BigEndian>(data_offset as u64).unwrap();
            records.write_u64::<BigEndian>(item.data.len() as u64).unwrap();
            records.extend_from_slice(&[item.payload_type, 0, 0, item.flags, 0, 0, 0, 0]);

            regions.push((name_offset, item.name.len(), data_offset, item.data.len()));
        }
        body[..table_size].copy_from_slice(&records);

        self.main_key().ctr_xor(&IV, 0, &mut body[..table_size]);
        for (item, (name_offset, name_len, data_offset, data_len)) in self.items.iter().zip(regions) {
            let key = self.item_key(item);
            let name = &mut body[name_offset..name_offset + name_len];
            key.ctr_xor_at(&IV, name_offset as u64, name);
            let data = &mut body[data_offset..data_offset + data_len];
            key.ctr_xor_at(&IV, data_offset as u64, data);
        }

        let mut meta = Vec::new();
        let mut meta_count = 2;
        meta.write_u32::<BigEndian>(2).unwrap();
        meta.write_u32::<BigEndian>(4).unwrap();
        meta.write_u32::<BigEndian>(self.content_type).unwrap();
        meta.write_u32::<BigEndian>(13).unwrap();
        meta.write_u32::<BigEndian>(8).unwrap();
        meta.write_u32::<BigEndian>(0).unwrap();
        meta.write_u32::<BigEndian>(table_size as u32).unwrap();

        let sfo_offset = (META_OFFSET + meta.len() + 16).next_multiple_of(16);
        if let Some(sfo) = &self.sfo {
            meta_count += 1;
            meta.write_u32::<BigEndian>(14).unwrap();
            meta.write_u32::<BigEndian>(8).unwrap();
            meta.write_u32::<BigEndian>(sfo_offset as u32).unwrap();
            meta.write_u32::<BigEndian>(sfo.len() as u32).unwrap();
        }

        let sfo_end = sfo_offset + self.sfo.as_ref().map_or(0, Vec::len);
        let enc_offset = sfo_end.next_multiple_of(16).max(0x200);

        let mut pkg = vec![0u8; enc_offset];
        pkg[..4].copy_from_slice(&PKG_MAGIC.to_be_bytes());
        pkg[0x06..0x08].copy_from_slice(&2u16.to_be_bytes());
        pkg[0x08..0x0C].copy_from_slice(&(META_OFFSET as u32).to_be_bytes());
        pkg[0x0C..0x10].copy_from_slice(&(meta_count as u32).to_be_bytes());
        pkg[0x14..0x18].copy_from_slice(&(self.items.len() as u32).to_be_bytes());
        pkg[0x20..0x28].copy_from_slice(&(enc_offset as u64).to_be_bytes());
        pkg[0x28..0x30].copy_from_slice(&(body.len() as u64).to_be_bytes());
        pkg[0x30..0x30 + self.content_id.len()].copy_from_slice(self.content_id.as_bytes());
        pkg[0x70..0x80].copy_from_slice(&IV);
        pkg[0xE7] = self.key_type;
        pkg[META_OFFSET..META_OFFSET + meta.len()].copy_from_slice(&meta);
        if let Some(sfo) = &self.sfo {
            pkg[sfo_offset..sfo_end].copy_from_slice(sfo);
        }

        pkg.extend_from_slice(&body);
        pkg.resize(pkg.len() + self.tail, 0xEE);
        let total = pkg.len() as u64;
        pkg[0x18..0x20].copy_from_slice(&total.to_be_bytes());
        pkg
    }
}

/// Builds an SFO with string values only.
pub fn build_sfo(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut entries = Vec::new();

    for (key, value) in pairs {
        entries.write_u16::<LittleEndian>(keys.len() as u16).unwrap();
        entries.write_u16::<LittleEndian>(0x0204).unwrap();
        entries.write_u32::<LittleEndian>(value.len() as u32 + 1).unwrap();
        entries.write_u32::<LittleEndian>(value.len() as u32 + 1).unwrap();
        entries.write_u32::<LittleEndian>(values.len() as u32).unwrap();
        keys.extend_from_slice(key.as_bytes());
        keys.push(0);
        values.extend_from_slice(value.as_bytes());
        values.push(0);
    }

    let key_table = 20 + entries.len();
    let value_table = key_table + keys.len();

    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(0x4653_5000).unwrap();
    out.write_u32::<LittleEndian>(0x101).unwrap();
    out.write_u32::<LittleEndian>(key_table as u32).unwrap();
    out.write_u32::<LittleEndian>(value_table as u32).unwrap();
    out.write_u32::<LittleEndian>(pairs.len() as u32).unwrap();
    out.extend_from_slice(&entries);
    out.extend_from_slice(&keys);
    out.extend_from_slice(&values);
    out
}

/// One entry read back from an archive.
#[derive(Debug)]
pub struct ZipEntry {
    pub name: String,
    pub method: u16,
    pub data: Vec<u8>,
}

/// Reads every entry through the central directory, checking sizes and CRCs.
pub fn read_zip(zip: &[u8]) -> Vec<ZipEntry> {
    let end = zip.len() - 22;
    assert_eq!(&zip[end..end + 4], &0x0605_4B50u32.to_le_bytes());

    let locator = end - 20;
    assert_eq!(&zip[locator..locator + 4], &0x0706_4B50u32.to_le_bytes());
    let zip64_end = u64_at(zip, locator + 8) as usize;
    assert_eq!(&zip[zip64_end..zip64_end + 4], &0x0606_4B50u32.to_le_bytes());

    let count = u64_at(zip, zip64_end + 0x20);
    let mut cursor = Cursor::new(&zip[u64_at(zip, zip64_end + 0x30) as usize..]);

    let mut entries = Vec::new();
    for _ in 0..count {
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 0x0201_4B50);
        let mut fixed = [0u8; 0x2E - 4];
        cursor.read_exact(&mut fixed).unwrap();
        let method = u16::from_le_bytes([fixed[6], fixed[7]]);
        let crc = u32::from_le_bytes(fixed[12..16].try_into().unwrap());
        let name_len = u16::from_le_bytes([fixed[24], fixed[25]]) as usize;
        let extra_len = u16::from_le_bytes([fixed[26], fixed[27]]) as usize;

        let mut name = vec![0u8; name_len];
        cursor.read_exact(&mut name).unwrap();
        let mut extra = vec![0u8; extra_len];
        cursor.read_exact(&mut extra).unwrap();
        assert_eq!(u16::from_le_bytes([extra[0], extra[1]]), 1);

        let size = u64_at(&extra, 4) as usize;
        let compressed_size = u64_at(&extra, 12) as usize;
        let offset = u64_at(&extra, 20) as usize;

        let local_name = u16::from_le_bytes([zip[offset + 26], zip[offset + 27]]) as usize;
        let local_extra = u16::from_le_bytes([zip[offset + 28], zip[offset + 29]]) as usize;
        let start = offset + 30 + local_name + local_extra;
        let stored = &zip[start..start + compressed_size];

        let data = match method {
            0 => stored.to_vec(),
            8 => {
                let mut out = Vec::new();
                DeflateDecoder::new(stored).read_to_end(&mut out).unwrap();
                out
            }
            other => panic!("unexpected method {other}"),
        };

        let name = String::from_utf8(name).unwrap();
        assert_eq!(data.len(), size, "size of {name}");
        assert_eq!(crc32fast::hash(&data), crc, "CRC of {name}");
        entries.push(ZipEntry { name, method, data });
    }

    entries
}

fn u64_at(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}
