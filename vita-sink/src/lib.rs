//! Output sinks for extracted package contents.
//!
//! An [`OutputSink`] receives a strictly ordered stream of folders and files.
//! Only one file is open at a time. Two real sinks are provided:
//!
//! - [`ZipWriter`] streams a ZIP64 archive, patching sizes and CRCs in place
//!   once each file is complete.
//! - [`DirectoryWriter`] writes loose files below a root directory.
//!
//! [`MemorySink`] keeps everything in memory and is meant for tests.
//!
//! # Example
//!
//! ```no_run
//! use vita_sink::{OutputSink, ZipWriter};
//!
//! let mut zip = ZipWriter::create("out.zip".as_ref()).unwrap();
//! zip.add_folder("app/PCSE00001").unwrap();
//! zip.begin_file("app/PCSE00001/eboot.bin", true).unwrap();
//! zip.write(b"hello").unwrap();
//! zip.end_file().unwrap();
//! zip.finish().unwrap();
//! ```

pub mod crc;
pub mod dir;
pub mod memory;
pub mod zip;

pub use self::dir::DirectoryWriter;
pub use self::memory::MemorySink;
pub use self::zip::{DosDateTime, ZipWriter};

use snafu::{Snafu, ensure};
use std::path::PathBuf;

use sink_error::*;

/// Receiver of extracted folders and files.
///
/// Offsets passed to [`set_offset`](OutputSink::set_offset) and
/// [`write_at`](OutputSink::write_at) are relative to the start of the current
/// file's data.
pub trait OutputSink {
    /// Creates a folder. Parent folders are not implied.
    fn add_folder(&mut self, path: &str) -> Result<(), SinkError>;

    /// Opens a new file.
    ///
    /// Returns the number of output bytes that precede the file data (the
    /// local header in an archive, zero for loose files).
    fn begin_file(&mut self, path: &str, compress: bool) -> Result<u64, SinkError>;

    /// Appends to the current file.
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;

    /// Returns the append position inside the current file.
    fn position(&self) -> u64;

    /// Moves the append position forward, leaving a gap to be filled with
    /// [`write_at`](OutputSink::write_at).
    fn set_offset(&mut self, offset: u64) -> Result<(), SinkError>;

    /// Writes into a gap left by [`set_offset`](OutputSink::set_offset).
    ///
    /// Fails if the current file is compressed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError>;

    /// Closes the current file.
    fn end_file(&mut self) -> Result<(), SinkError>;

    /// Flushes everything. No other call is allowed afterwards.
    fn finish(&mut self) -> Result<(), SinkError>;

    /// Skips `len` bytes at the append position and returns a handle to them.
    fn reserve(&mut self, len: u64) -> Result<Reservation, SinkError> {
        let offset = self.position();
        self.set_offset(offset + len)?;
        Ok(Reservation { offset, len })
    }

    /// Fills a reserved range. `data` must be exactly as long as the range.
    fn patch(&mut self, reservation: Reservation, data: &[u8]) -> Result<(), SinkError> {
        let actual = data.len() as u64;
        ensure!(
            actual == reservation.len,
            PatchSizeMismatchSnafu {
                expected: reservation.len,
                actual
            }
        );
        self.write_at(reservation.offset, data)
    }
}

/// A byte range of the current file skipped by [`OutputSink::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reservation must be patched before the file is closed"]
pub struct Reservation {
    offset: u64,
    len: u64,
}

impl Reservation {
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Errors returned by every [`OutputSink`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum SinkError {
    #[snafu(display("cannot create {}", path.display()))]
    CreateFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write output"))]
    WriteFailed { source: std::io::Error },

    #[snafu(display("deflate failed"))]
    DeflateFailed { source: flate2::CompressError },

    #[snafu(display("invalid output path '{path}'"))]
    InvalidPath { path: String },

    #[snafu(display("no file is open"))]
    NoOpenFile,

    #[snafu(display("'{path}' is still open"))]
    FileStillOpen { path: String },

    #[snafu(display("cannot write at an offset of the compressed file '{path}'"))]
    CompressedRandomAccess { path: String },

    #[snafu(display("cannot move the offset of '{path}' after data was written"))]
    OffsetAfterWrite { path: String },

    #[snafu(display(
        "write at 0x{offset:X} ({len} bytes) does not fill the gap of '{path}' in order"
    ))]
    PatchOutOfOrder { path: String, offset: u64, len: u64 },

    #[snafu(display("patch is {actual} bytes, the reservation {expected}"))]
    PatchSizeMismatch { expected: u64, actual: u64 },

    #[snafu(display("'{path}' closed with {filled} of {reserved} reserved bytes written"))]
    UnfilledGap {
        path: String,
        filled: u64,
        reserved: u64,
    },

    #[snafu(display("sink is already finished"))]
    Finished,
}
