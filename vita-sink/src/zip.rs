//! Streaming ZIP64 writer.
//!
//! Every entry carries a ZIP64 extended information field, so the 32-bit size
//! and offset fields always hold `0xFFFFFFFF` and no entry needs a second
//! layout once it grows past 4 GiB. Sizes and the CRC are not known until a
//! file is closed; [`OutputSink::end_file`] seeks back and patches them into
//! the local header.
//!
//! Reference: <https://pkware.cachefly.net/webdocs/casestudies/APPNOTE.TXT>

use crate::crc::crc32_combine;
use crate::sink_error::*;
use crate::{OutputSink, SinkError};
use crc32fast::Hasher;
use flate2::{Compress, Compression, FlushCompress, Status};
use snafu::{OptionExt, ResultExt, ensure};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32, U64},
};

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4B50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4B50;
const ZIP64_END_SIGNATURE: u32 = 0x0606_4B50;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4B50;
const END_SIGNATURE: u32 = 0x0605_4B50;

/// Version 4.5, the first with ZIP64.
const VERSION: u16 = 45;
const FLAG_UTF8: u16 = 0x0800;
const METHOD_STORE: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
const ZIP64_EXTRA_TAG: u16 = 0x0001;

const ATTRIBUTE_DIRECTORY: u32 = 0x10;
const ATTRIBUTE_ARCHIVE: u32 = 0x20;

/// Offset of the CRC inside the local header.
const LOCAL_CRC_OFFSET: u64 = 14;

const DEFLATE_CHUNK: usize = 4096;

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct LocalHeader {
    signature: U32,       // 0x00
    version: U16,         // 0x04
    flags: U16,           // 0x06
    method: U16,          // 0x08
    time: U16,            // 0x0A
    date: U16,            // 0x0C
    crc: U32,             // 0x0E
    compressed_size: U32, // 0x12
    size: U32,            // 0x16
    name_len: U16,        // 0x1A
    extra_len: U16,       // 0x1C
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Zip64LocalExtra {
    tag: U16,             // 0x00
    len: U16,             // 0x02
    size: U64,            // 0x04
    compressed_size: U64, // 0x0C
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct CentralHeader {
    signature: U32,           // 0x00
    made_by: U16,             // 0x04
    version: U16,             // 0x06
    flags: U16,               // 0x08
    method: U16,              // 0x0A
    time: U16,                // 0x0C
    date: U16,                // 0x0E
    crc: U32,                 // 0x10
    compressed_size: U32,     // 0x14
    size: U32,                // 0x18
    name_len: U16,            // 0x1C
    extra_len: U16,           // 0x1E
    comment_len: U16,         // 0x20
    disk: U16,                // 0x22
    internal_attributes: U16, // 0x24
    external_attributes: U32, // 0x26
    offset: U32,              // 0x2A
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Zip64CentralExtra {
    tag: U16,             // 0x00
    len: U16,             // 0x02
    size: U64,            // 0x04
    compressed_size: U64, // 0x0C
    offset: U64,          // 0x14
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Zip64End {
    signature: U32,        // 0x00
    record_size: U64,      // 0x04
    made_by: U16,          // 0x0C
    version: U16,          // 0x0E
    disk: U32,             // 0x10
    directory_disk: U32,   // 0x14
    disk_entries: U64,     // 0x18
    entries: U64,          // 0x20
    directory_size: U64,   // 0x28
    directory_offset: U64, // 0x30
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Zip64Locator {
    signature: U32,  // 0x00
    end_disk: U32,   // 0x04
    end_offset: U64, // 0x08
    disks: U32,      // 0x10
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct End {
    signature: U32,        // 0x00
    disk: U16,             // 0x04
    directory_disk: U16,   // 0x06
    disk_entries: U16,     // 0x08
    entries: U16,          // 0x0A
    directory_size: U32,   // 0x0C
    directory_offset: U32, // 0x10
    comment_len: U16,      // 0x14
}

/// An MS-DOS timestamp as stored in ZIP headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct DosDateTime {
    date: u16,
    time: u16,
}

impl DosDateTime {
    /// 1980-01-01 00:00:00, the earliest representable time.
    pub const EPOCH: Self = Self {
        date: (1 << 5) | 1,
        time: 0,
    };

    /// Returns the current time in UTC.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let secs = time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        Self::from_unix(secs)
    }

    /// Converts seconds since the Unix epoch. Times before 1980 clamp to
    /// [`DosDateTime::EPOCH`].
    pub fn from_unix(secs: u64) -> Self {
        let (year, month, day) = civil_from_days(secs / 86_400);
        if year < 1980 {
            return Self::EPOCH;
        }

        let of_day = secs % 86_400;
        let (hour, minute, second) = (of_day / 3600, of_day / 60 % 60, of_day % 60);
        let year = year.min(1980 + 127);

        Self {
            date: (((year - 1980) << 9) | (month << 5) | day) as u16,
            time: ((hour << 11) | (minute << 5) | (second / 2)) as u16,
        }
    }

    #[must_use]
    pub const fn date(&self) -> u16 {
        self.date
    }

    #[must_use]
    pub const fn time(&self) -> u16 {
        self.time
    }
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

struct Entry {
    name: String,
    offset: u64,
    size: u64,
    compressed_size: u64,
    crc: u32,
    method: u16,
    attributes: u32,
}

/// The file being written.
struct OpenFile {
    entry: Entry,
    data_start: u64,
    deflate: Option<Box<Compress>>,
    /// CRC of the bytes appended after the gap.
    crc: Hasher,
    appended: u64,
    compressed: u64,
    /// Bytes skipped by `set_offset`, filled in order by `write_at`.
    gap: u64,
    gap_crc: Hasher,
    filled: u64,
}

/// Writes a ZIP64 archive to any seekable output.
#[must_use]
pub struct ZipWriter<W: Write + Seek> {
    out: W,
    total: u64,
    entries: Vec<Entry>,
    current: Option<OpenFile>,
    timestamp: DosDateTime,
    finished: bool,
}

impl ZipWriter<BufWriter<File>> {
    /// Creates (or truncates) an archive file.
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).context(CreateFailedSnafu { path })?;
        debug!(path = %path.display(), "created archive");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Seek> ZipWriter<W> {
    /// Starts an archive at the beginning of `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            total: 0,
            entries: Vec::new(),
            current: None,
            timestamp: DosDateTime::now(),
            finished: false,
        }
    }

    /// Uses `timestamp` for every entry instead of the creation time.
    pub fn with_timestamp(mut self, timestamp: DosDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the number of entries written so far, folders included.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the underlying output.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.out.write_all(data).context(WriteFailedSnafu)?;
        self.total += data.len() as u64;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), SinkError> {
        self.out
            .seek(SeekFrom::Start(offset))
            .context(WriteFailedSnafu)?;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), SinkError> {
        ensure!(!self.finished, FinishedSnafu);
        if let Some(open) = &self.current {
            return FileStillOpenSnafu {
                path: open.entry.name.clone(),
            }
            .fail();
        }
        Ok(())
    }

    fn start_entry(&mut self, name: String, method: u16, attributes: u32) -> Result<Entry, SinkError> {
        let name_len = u16::try_from(name.len())
            .ok()
            .context(InvalidPathSnafu { path: &name })?;

        let header = LocalHeader {
            signature: U32::new(LOCAL_HEADER_SIGNATURE),
            version: U16::new(VERSION),
            flags: U16::new(FLAG_UTF8),
            method: U16::new(method),
            time: U16::new(self.timestamp.time),
            date: U16::new(self.timestamp.date),
            crc: U32::new(0),
            compressed_size: U32::new(u32::MAX),
            size: U32::new(u32::MAX),
            name_len: U16::new(name_len),
            extra_len: U16::new(size_of::<Zip64LocalExtra>() as u16),
        };
        let extra = Zip64LocalExtra {
            tag: U16::new(ZIP64_EXTRA_TAG),
            len: U16::new(16),
            size: U64::new(0),
            compressed_size: U64::new(0),
        };

        let offset = self.total;
        self.emit(header.as_bytes())?;
        self.emit(name.as_bytes())?;
        self.emit(extra.as_bytes())?;

        Ok(Entry {
            name,
            offset,
            size: 0,
            compressed_size: 0,
            crc: 0,
            method,
            attributes,
        })
    }

    /// Writes the final CRC and sizes into the entry's local header.
    fn patch_local_header(&mut self, entry: &Entry) -> Result<(), SinkError> {
        self.seek(entry.offset + LOCAL_CRC_OFFSET)?;
        self.out
            .write_all(&entry.crc.to_le_bytes())
            .context(WriteFailedSnafu)?;

        // Sizes inside the ZIP64 extra field, after its tag and length.
        let sizes = entry.offset + size_of::<LocalHeader>() as u64 + entry.name.len() as u64 + 4;
        self.seek(sizes)?;
        self.out
            .write_all([entry.size.to_le_bytes(), entry.compressed_size.to_le_bytes()].as_flattened())
            .context(WriteFailedSnafu)?;

        self.seek(self.total)
    }

    fn write_central_directory(&mut self) -> Result<(), SinkError> {
        let directory_offset = self.total;
        let mut directory = Vec::new();

        for entry in &self.entries {
            let header = CentralHeader {
                signature: U32::new(CENTRAL_HEADER_SIGNATURE),
                made_by: U16::new(VERSION),
                version: U16::new(VERSION),
                flags: U16::new(FLAG_UTF8),
                method: U16::new(entry.method),
                time: U16::new(self.timestamp.time),
                date: U16::new(self.timestamp.date),
                crc: U32::new(entry.crc),
                compressed_size: U32::new(u32::MAX),
                size: U32::new(u32::MAX),
                name_len: U16::new(entry.name.len() as u16),
                extra_len: U16::new(size_of::<Zip64CentralExtra>() as u16),
                comment_len: U16::new(0),
                disk: U16::new(0),
                internal_attributes: U16::new(0),
                external_attributes: U32::new(entry.attributes),
                offset: U32::new(u32::MAX),
            };
            let extra = Zip64CentralExtra {
                tag: U16::new(ZIP64_EXTRA_TAG),
                len: U16::new(24),
                size: U64::new(entry.size),
                compressed_size: U64::new(entry.compressed_size),
                offset: U64::new(entry.offset),
            };

            directory.extend_from_slice(header.as_bytes());
            directory.extend_from_slice(entry.name.as_bytes());
            directory.extend_from_slice(extra.as_bytes());
        }
        self.emit(&directory)?;

        let count = self.entries.len() as u64;
        let directory_size = self.total - directory_offset;
        let end_offset = self.total;

        let zip64_end = Zip64End {
            signature: U32::new(ZIP64_END_SIGNATURE),
            record_size: U64::new(size_of::<Zip64End>() as u64 - 12),
            made_by: U16::new(VERSION),
            version: U16::new(VERSION),
            disk: U32::new(0),
            directory_disk: U32::new(0),
            disk_entries: U64::new(count),
            entries: U64::new(count),
            directory_size: U64::new(directory_size),
            directory_offset: U64::new(directory_offset),
        };
        let locator = Zip64Locator {
            signature: U32::new(ZIP64_LOCATOR_SIGNATURE),
            end_disk: U32::new(0),
            end_offset: U64::new(end_offset),
            disks: U32::new(1),
        };
        let end = End {
            signature: U32::new(END_SIGNATURE),
            disk: U16::new(0),
            directory_disk: U16::new(0),
            disk_entries: U16::new(count.min(0xFFFF) as u16),
            entries: U16::new(count.min(0xFFFF) as u16),
            directory_size: U32::new(directory_size.min(0xFFFF_FFFF) as u32),
            directory_offset: U32::new(directory_offset.min(0xFFFF_FFFF) as u32),
            comment_len: U16::new(0),
        };

        self.emit(zip64_end.as_bytes())?;
        self.emit(locator.as_bytes())?;
        self.emit(end.as_bytes())?;

        debug!(entries = count, size = self.total, "wrote central directory");
        Ok(())
    }
}

impl<W: Write + Seek> OutputSink for ZipWriter<W> {
    fn add_folder(&mut self, path: &str) -> Result<(), SinkError> {
        self.ensure_idle()?;

        let name = format!("{}/", entry_name(path)?);
        trace!(name = %name, "folder");

        let entry = self.start_entry(name, METHOD_STORE, ATTRIBUTE_DIRECTORY)?;
        self.entries.push(entry);
        Ok(())
    }

    fn begin_file(&mut self, path: &str, compress: bool) -> Result<u64, SinkError> {
        self.ensure_idle()?;

        let name = entry_name(path)?.to_owned();
        let method = if compress { METHOD_DEFLATE } else { METHOD_STORE };
        trace!(name = %name, compress, "file");

        let entry = self.start_entry(name, method, ATTRIBUTE_ARCHIVE)?;
        let header_len = self.total - entry.offset;

        self.current = Some(OpenFile {
            entry,
            data_start: self.total,
            deflate: compress.then(|| Box::new(Compress::new(Compression::fast(), false))),
            crc: Hasher::new(),
            appended: 0,
            compressed: 0,
            gap: 0,
            gap_crc: Hasher::new(),
            filled: 0,
        });

        Ok(header_len)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let Self {
            out,
            total,
            current,
            ..
        } = self;
        let open = current.as_mut().context(NoOpenFileSnafu)?;

        open.crc.update(data);
        open.appended += data.len() as u64;

        let written = match open.deflate.as_deref_mut() {
            Some(compress) => deflate_into(compress, out, data, FlushCompress::None)?,
            None => {
                out.write_all(data).context(WriteFailedSnafu)?;
                data.len() as u64
            }
        };

        open.compressed += written;
        *total += written;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(0, |open| open.gap + open.appended)
    }

    fn set_offset(&mut self, offset: u64) -> Result<(), SinkError> {
        let open = self.current.as_mut().context(NoOpenFileSnafu)?;
        ensure!(
            open.deflate.is_none(),
            CompressedRandomAccessSnafu {
                path: &open.entry.name
            }
        );
        ensure!(
            open.appended == 0 && offset >= open.gap,
            OffsetAfterWriteSnafu {
                path: &open.entry.name
            }
        );

        open.gap = offset;
        let target = open.data_start + offset;
        self.total = target;
        self.seek(target)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError> {
        let open = self.current.as_mut().context(NoOpenFileSnafu)?;
        ensure!(
            open.deflate.is_none(),
            CompressedRandomAccessSnafu {
                path: &open.entry.name
            }
        );

        let len = data.len() as u64;
        ensure!(
            offset == open.filled && offset + len <= open.gap,
            PatchOutOfOrderSnafu {
                path: &open.entry.name,
                offset,
                len
            }
        );

        open.gap_crc.update(data);
        open.filled += len;
        let target = open.data_start + offset;

        self.seek(target)?;
        self.out.write_all(data).context(WriteFailedSnafu)?;
        self.seek(self.total)
    }

    fn end_file(&mut self) -> Result<(), SinkError> {
        // A file with an unfilled gap stays open, so `finish` fails.
        let open = self.current.as_ref().context(NoOpenFileSnafu)?;
        ensure!(
            open.filled == open.gap,
            UnfilledGapSnafu {
                path: &open.entry.name,
                filled: open.filled,
                reserved: open.gap
            }
        );

        let mut open = self.current.take().context(NoOpenFileSnafu)?;
        if let Some(compress) = open.deflate.as_deref_mut() {
            let written = deflate_into(compress, &mut self.out, &[], FlushCompress::Finish)?;
            open.compressed += written;
            self.total += written;
        }

        let mut entry = open.entry;
        entry.size = open.gap + open.appended;
        entry.compressed_size = open.gap + open.compressed;
        entry.crc = crc32_combine(open.gap_crc.finalize(), open.crc.finalize(), open.appended);

        self.patch_local_header(&entry)?;

        trace!(
            name = %entry.name,
            size = entry.size,
            compressed = entry.compressed_size,
            crc = entry.crc,
            "closed file"
        );

        self.entries.push(entry);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.ensure_idle()?;
        self.write_central_directory()?;
        self.out.flush().context(WriteFailedSnafu)?;
        self.finished = true;
        Ok(())
    }
}

/// Validates an entry name and strips surrounding slashes.
fn entry_name(path: &str) -> Result<&str, SinkError> {
    let name = path.trim_matches('/');
    ensure!(
        !name.is_empty() && !name.contains('\\'),
        InvalidPathSnafu { path }
    );
    Ok(name)
}

/// Runs `input` through the compressor, writing output in fixed-size chunks.
///
/// Returns the number of compressed bytes written.
fn deflate_into<W: Write>(
    compress: &mut Compress,
    out: &mut W,
    mut input: &[u8],
    flush: FlushCompress,
) -> Result<u64, SinkError> {
    let finish = matches!(flush, FlushCompress::Finish);
    let mut buf = [0u8; DEFLATE_CHUNK];
    let mut written = 0u64;

    loop {
        let (in_before, out_before) = (compress.total_in(), compress.total_out());
        let status = compress
            .compress(input, &mut buf, flush)
            .context(DeflateFailedSnafu)?;
        let consumed = (compress.total_in() - in_before) as usize;
        let produced = (compress.total_out() - out_before) as usize;

        input = &input[consumed..];
        out.write_all(&buf[..produced]).context(WriteFailedSnafu)?;
        written += produced as u64;

        let done = if finish {
            status == Status::StreamEnd
        } else {
            input.is_empty() && produced < buf.len()
        };
        let stalled = consumed == 0 && produced == 0 && status == Status::BufError;

        if done || stalled {
            return Ok(written);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Read};

    struct ReadEntry {
        name: String,
        method: u16,
        attributes: u32,
        crc: u32,
        data: Vec<u8>,
    }

    /// Reads every entry back through the ZIP64 end record.
    fn read_archive(raw: &[u8]) -> Vec<ReadEntry> {
        let end_at = raw.len() - size_of::<End>();
        let end = End::read_from_bytes(&raw[end_at..]).unwrap();
        assert_eq!(end.signature.get(), END_SIGNATURE);

        let locator_at = end_at - size_of::<Zip64Locator>();
        let locator = Zip64Locator::read_from_bytes(&raw[locator_at..end_at]).unwrap();
        assert_eq!(locator.signature.get(), ZIP64_LOCATOR_SIGNATURE);

        let (zip64, _) =
            Zip64End::read_from_prefix(&raw[locator.end_offset.get() as usize..]).unwrap();
        assert_eq!(zip64.signature.get(), ZIP64_END_SIGNATURE);
        assert_eq!(zip64.record_size.get(), 44);
        assert_eq!(end.entries.get() as u64, zip64.entries.get());

        let mut at = zip64.directory_offset.get() as usize;
        let mut entries = Vec::new();

        for _ in 0..zip64.entries.get() {
            let (header, rest) = CentralHeader::read_from_prefix(&raw[at..]).unwrap();
            assert_eq!(header.signature.get(), CENTRAL_HEADER_SIGNATURE);
            assert_eq!(header.size.get(), u32::MAX);

            let name_len = header.name_len.get() as usize;
            let name = std::str::from_utf8(&rest[..name_len]).unwrap().to_owned();
            let (extra, _) = Zip64CentralExtra::read_from_prefix(&rest[name_len..]).unwrap();
            assert_eq!(extra.tag.get(), ZIP64_EXTRA_TAG);

            let local_at = extra.offset.get() as usize;
            let (local, _) = LocalHeader::read_from_prefix(&raw[local_at..]).unwrap();
            assert_eq!(local.signature.get(), LOCAL_HEADER_SIGNATURE);
            assert_eq!(local.crc.get(), header.crc.get());

            let data_at = local_at
                + size_of::<LocalHeader>()
                + local.name_len.get() as usize
                + local.extra_len.get() as usize;
            let stored = &raw[data_at..data_at + extra.compressed_size.get() as usize];

            let data = match header.method.get() {
                METHOD_STORE => stored.to_vec(),
                METHOD_DEFLATE => {
                    let mut out = Vec::new();
                    flate2::read::DeflateDecoder::new(stored)
                        .read_to_end(&mut out)
                        .unwrap();
                    out
                }
                other => panic!("unexpected method {other}"),
            };
            assert_eq!(data.len() as u64, extra.size.get());

            entries.push(ReadEntry {
                name,
                method: header.method.get(),
                attributes: header.external_attributes.get(),
                crc: header.crc.get(),
                data,
            });

            at += size_of::<CentralHeader>() + name_len + header.extra_len.get() as usize;
        }

        entries
    }

    /// Seekable output that drops payload-sized writes and keeps the rest.
    #[derive(Default)]
    struct HeaderCapture {
        pos: u64,
        len: u64,
        kept: Vec<(u64, Vec<u8>)>,
    }

    impl HeaderCapture {
        const DROP_AT: usize = 64 * 1024;

        /// Reads back `len` bytes, with dropped writes reading as zero.
        fn read(&self, offset: u64, len: usize) -> Vec<u8> {
            let mut out = vec![0u8; len];
            let end = offset + len as u64;
            for (at, data) in &self.kept {
                let from = (*at).max(offset);
                let to = (at + data.len() as u64).min(end);
                if from < to {
                    out[(from - offset) as usize..(to - offset) as usize]
                        .copy_from_slice(&data[(from - at) as usize..(to - at) as usize]);
                }
            }
            out
        }
    }

    impl Write for HeaderCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.len() < Self::DROP_AT {
                self.kept.push((self.pos, buf.to_vec()));
            }
            self.pos += buf.len() as u64;
            self.len = self.len.max(self.pos);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for HeaderCapture {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            let target = match pos {
                SeekFrom::Start(offset) => Some(offset),
                SeekFrom::End(delta) => self.len.checked_add_signed(delta),
                SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            };
            self.pos = target.ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
            Ok(self.pos)
        }
    }

    fn new_writer() -> ZipWriter<Cursor<Vec<u8>>> {
        ZipWriter::new(Cursor::new(Vec::new())).with_timestamp(DosDateTime::EPOCH)
    }

    #[test]
    fn writes_stored_and_deflated_entries() {
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 97) as u8).collect();

        let mut zip = new_writer();
        zip.add_folder("app/PCSE00001").unwrap();

        let header_len = zip.begin_file("app/PCSE00001/eboot.bin", true).unwrap();
        assert_eq!(header_len, 30 + 23 + 20);
        for chunk in big.chunks(7000) {
            zip.write(chunk).unwrap();
        }
        zip.end_file().unwrap();

        zip.begin_file("/app/PCSE00001/sce_sys/param.sfo", false).unwrap();
        zip.write(b"\0PSF").unwrap();
        zip.end_file().unwrap();

        zip.begin_file("empty.bin", true).unwrap();
        zip.end_file().unwrap();

        zip.finish().unwrap();
        assert_eq!(zip.entry_count(), 4);

        let entries = read_archive(&zip.into_inner().into_inner());
        assert_eq!(entries.len(), 4);

        assert_eq!(entries[0].name, "app/PCSE00001/");
        assert_eq!(entries[0].attributes, ATTRIBUTE_DIRECTORY);
        assert!(entries[0].data.is_empty());

        assert_eq!(entries[1].method, METHOD_DEFLATE);
        assert_eq!(entries[1].data, big);
        assert_eq!(entries[1].crc, crc32fast::hash(&big));

        assert_eq!(entries[2].name, "app/PCSE00001/sce_sys/param.sfo");
        assert_eq!(entries[2].method, METHOD_STORE);
        assert_eq!(entries[2].attributes, ATTRIBUTE_ARCHIVE);
        assert_eq!(entries[2].data, b"\0PSF");

        assert!(entries[3].data.is_empty());
        assert_eq!(entries[3].crc, 0);
    }

    #[test]
    fn standard_reader_accepts_the_archive() {
        let big: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();

        let mut zip = new_writer();
        zip.add_folder("pspemu/ISO").unwrap();

        zip.begin_file("pspemu/ISO/game.cso", false).unwrap();
        let reservation = zip.reserve(6).unwrap();
        zip.write(b" sectors").unwrap();
        zip.patch(reservation, b"CISO16").unwrap();
        zip.end_file().unwrap();

        zip.begin_file("pspemu/ISO/game.iso", true).unwrap();
        for chunk in big.chunks(65536) {
            zip.write(chunk).unwrap();
        }
        zip.end_file().unwrap();

        zip.begin_file("empty.bin", false).unwrap();
        zip.end_file().unwrap();
        zip.finish().unwrap();

        let raw = zip.into_inner().into_inner();
        let mut archive = ::zip::ZipArchive::new(Cursor::new(raw)).unwrap();
        assert_eq!(archive.len(), 4);

        let expected: [(&str, &[u8], ::zip::CompressionMethod); 4] = [
            ("pspemu/ISO/", b"", ::zip::CompressionMethod::Stored),
            ("pspemu/ISO/game.cso", b"CISO16 sectors", ::zip::CompressionMethod::Stored),
            ("pspemu/ISO/game.iso", &big, ::zip::CompressionMethod::Deflated),
            ("empty.bin", b"", ::zip::CompressionMethod::Stored),
        ];
        for (index, (name, data, method)) in expected.into_iter().enumerate() {
            let mut file = archive.by_index(index).unwrap();
            assert_eq!(file.name(), name);
            assert_eq!(file.is_dir(), name.ends_with('/'));
            assert_eq!(file.compression(), method);
            assert_eq!(file.size(), data.len() as u64);
            assert_eq!(file.crc32(), crc32fast::hash(data));

            // Reading to the end also checks the CRC.
            let mut read = Vec::new();
            file.read_to_end(&mut read).unwrap();
            assert_eq!(read, data, "{name}");
        }
    }

    #[test]
    fn entries_past_4_gib_use_zip64_fields() {
        const CHUNK: usize = 1 << 20;
        const CHUNKS: u64 = 4097;
        const SIZE: u64 = CHUNKS * CHUNK as u64;
        const NAME: &str = "pspemu/ISO/huge.iso";

        let zeros = vec![0u8; CHUNK];
        let mut zip = ZipWriter::new(HeaderCapture::default()).with_timestamp(DosDateTime::EPOCH);

        zip.begin_file(NAME, false).unwrap();
        for _ in 0..CHUNKS {
            zip.write(&zeros).unwrap();
        }
        zip.end_file().unwrap();

        zip.begin_file("after.bin", false).unwrap();
        zip.write(b"tail").unwrap();
        zip.end_file().unwrap();
        zip.finish().unwrap();
        let out = zip.into_inner();

        let chunk_crc = crc32fast::hash(&zeros);
        let huge_crc = (0..CHUNKS).fold(0, |crc, _| crc32_combine(crc, chunk_crc, CHUNK as u64));

        let header_len = (size_of::<LocalHeader>() + size_of::<Zip64LocalExtra>()) as u64;
        let after_offset = header_len + NAME.len() as u64 + SIZE;
        assert!(after_offset > u64::from(u32::MAX));

        // Local headers: 32-bit fields saturated, real values in the extra.
        for (offset, name_len, size, crc) in [
            (0, NAME.len(), SIZE, huge_crc),
            (after_offset, "after.bin".len(), 4, crc32fast::hash(b"tail")),
        ] {
            let raw = out.read(offset, size_of::<LocalHeader>());
            let local = LocalHeader::read_from_bytes(&raw).unwrap();
            assert_eq!(local.signature.get(), LOCAL_HEADER_SIGNATURE);
            assert_eq!(local.size.get(), u32::MAX);
            assert_eq!(local.compressed_size.get(), u32::MAX);
            assert_eq!(local.crc.get(), crc);

            let extra_at = offset + (size_of::<LocalHeader>() + name_len) as u64;
            let raw = out.read(extra_at, size_of::<Zip64LocalExtra>());
            let extra = Zip64LocalExtra::read_from_bytes(&raw).unwrap();
            assert_eq!(extra.size.get(), size);
            assert_eq!(extra.compressed_size.get(), size);
        }
        assert_eq!(out.read(after_offset + header_len + 9, 4), b"tail");

        // Central directory through the ZIP64 end record.
        let end_at = out.len - size_of::<End>() as u64;
        let end = End::read_from_bytes(&out.read(end_at, size_of::<End>())).unwrap();
        assert_eq!(end.directory_offset.get(), u32::MAX);

        let locator_at = end_at - size_of::<Zip64Locator>() as u64;
        let raw = out.read(locator_at, size_of::<Zip64Locator>());
        let locator = Zip64Locator::read_from_bytes(&raw).unwrap();
        let raw = out.read(locator.end_offset.get(), size_of::<Zip64End>());
        let zip64 = Zip64End::read_from_bytes(&raw).unwrap();
        assert_eq!(zip64.signature.get(), ZIP64_END_SIGNATURE);
        assert_eq!(zip64.entries.get(), 2);

        let mut at = zip64.directory_offset.get();
        assert_eq!(at, after_offset + header_len + 9 + 4);
        for (name, offset, size) in [(NAME, 0, SIZE), ("after.bin", after_offset, 4)] {
            let raw = out.read(at, size_of::<CentralHeader>());
            let header = CentralHeader::read_from_bytes(&raw).unwrap();
            assert_eq!(header.signature.get(), CENTRAL_HEADER_SIGNATURE);
            assert_eq!(header.size.get(), u32::MAX);
            assert_eq!(header.compressed_size.get(), u32::MAX);
            assert_eq!(header.offset.get(), u32::MAX);
            assert_eq!(out.read(at + size_of::<CentralHeader>() as u64, name.len()), name.as_bytes());

            let extra_at = at + (size_of::<CentralHeader>() + name.len()) as u64;
            let raw = out.read(extra_at, size_of::<Zip64CentralExtra>());
            let extra = Zip64CentralExtra::read_from_bytes(&raw).unwrap();
            assert_eq!(extra.tag.get(), ZIP64_EXTRA_TAG);
            assert_eq!(extra.size.get(), size);
            assert_eq!(extra.compressed_size.get(), size);
            assert_eq!(extra.offset.get(), offset);

            at = extra_at + size_of::<Zip64CentralExtra>() as u64;
        }
    }

    #[test]
    fn reserved_prefix_is_patched_and_crc_combined() {
        let mut zip = new_writer();
        zip.begin_file("image.cso", false).unwrap();

        let reservation = zip.reserve(8).unwrap();
        assert_eq!(zip.position(), 8);
        zip.write(b"payload").unwrap();
        zip.patch(reservation, b"HEADER!!").unwrap();
        zip.end_file().unwrap();
        zip.finish().unwrap();

        let entries = read_archive(&zip.into_inner().into_inner());
        assert_eq!(entries[0].data, b"HEADER!!payload");
        assert_eq!(entries[0].crc, crc32fast::hash(b"HEADER!!payload"));
        assert_eq!(
            entries[0].crc,
            crc32_combine(crc32fast::hash(b"HEADER!!"), crc32fast::hash(b"payload"), 7)
        );
    }

    #[test]
    fn compressed_files_reject_random_access() {
        let mut zip = new_writer();
        zip.begin_file("a.iso", true).unwrap();

        assert!(matches!(
            zip.set_offset(16),
            Err(SinkError::CompressedRandomAccess { .. })
        ));
        assert!(matches!(
            zip.write_at(0, b"x"),
            Err(SinkError::CompressedRandomAccess { .. })
        ));
    }

    #[test]
    fn misuse_is_reported() {
        let mut zip = new_writer();
        assert!(matches!(zip.write(b"x"), Err(SinkError::NoOpenFile)));
        assert!(matches!(zip.add_folder("/"), Err(SinkError::InvalidPath { .. })));

        zip.begin_file("a.bin", false).unwrap();
        assert!(matches!(
            zip.begin_file("b.bin", false),
            Err(SinkError::FileStillOpen { .. })
        ));

        let reservation = zip.reserve(4).unwrap();
        assert!(matches!(
            zip.patch(reservation, b"abc"),
            Err(SinkError::PatchSizeMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            zip.end_file(),
            Err(SinkError::UnfilledGap { filled: 0, reserved: 4, .. })
        ));
        assert!(matches!(zip.finish(), Err(SinkError::FileStillOpen { .. })));

        zip.write_at(0, b"abcd").unwrap();
        zip.end_file().unwrap();
        zip.finish().unwrap();
        assert_eq!(zip.entry_count(), 1);
        assert!(matches!(zip.add_folder("x"), Err(SinkError::Finished)));

        let entries = read_archive(&zip.into_inner().into_inner());
        assert_eq!(entries[0].name, "a.bin");
        assert_eq!(entries[0].data, b"abcd");
    }

    #[test]
    fn dos_time_conversion() {
        assert_eq!(DosDateTime::from_unix(0), DosDateTime::EPOCH);

        // 2023-11-14 22:13:20 UTC
        let t = DosDateTime::from_unix(1_700_000_000);
        assert_eq!(t.date(), (43 << 9) | (11 << 5) | 14);
        assert_eq!(t.time(), (22 << 11) | (13 << 5) | 10);

        // 2000-02-29 00:00:01 UTC
        let leap = DosDateTime::from_unix(951_782_401);
        assert_eq!(leap.date(), (20 << 9) | (2 << 5) | 29);
        assert_eq!(leap.time(), 0);
    }
}
