//! CSO (compressed ISO) writer.
//!
//! A CSO file is a 24-byte header, an index of `sectors + 1` offsets and the
//! sectors themselves, each deflated on its own. The index is only known
//! once every sector is written, so its space is reserved up front and
//! patched by [`CsoWriter::finish()`].

use flate2::{Compress, Compression, FlushCompress, Status};
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;
use vita_sink::{OutputSink, Reservation, SinkError};
use zerocopy::{
    Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U32, U64},
};

use crate::psar::SECTOR_SIZE;

use cso_error::*;

const CSO_MAGIC: &[u8; 4] = b"CISO";
const CSO_VERSION: u8 = 1;

/// Index flag of a sector stored without compression.
pub const STORED_SECTOR: u32 = 0x8000_0000;

#[derive(IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct CsoHeader {
    magic: [u8; 4],      // 0x00 - "CISO"
    header_size: U32,    // 0x04
    total_size: U64,     // 0x08
    block_size: U32,     // 0x10
    version: u8,         // 0x14
    align: u8,           // 0x15
    _reserved: [u8; 2],  // 0x16
}

const HEADER_SIZE: usize = size_of::<CsoHeader>();

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum CsoError {
    #[snafu(display("cannot write CSO data"))]
    Sink { source: SinkError },

    #[snafu(display("cannot deflate sector {index}"))]
    Deflate {
        index: u32,
        source: flate2::CompressError,
    },

    #[snafu(display("sector is {len} bytes, expected {SECTOR_SIZE}"))]
    SectorSize { len: usize },

    #[snafu(display("more than the declared {sectors} sectors were written"))]
    TooManySectors { sectors: u32 },

    #[snafu(display("CSO data offset {offset:#x} does not fit the index"))]
    IndexOverflow { offset: u64 },

    #[snafu(display("CSO finished after {written} of {sectors} sectors"))]
    Incomplete { written: u32, sectors: u32 },
}

/// Streams sectors into the open file of a sink as a CSO image.
pub struct CsoWriter<'s, S: OutputSink + ?Sized> {
    sink: &'s mut S,
    reservation: Reservation,
    total_size: u64,
    sectors: u32,
    index: Vec<U32>,
    offset: u64,
    compress: Compress,
    buffer: Vec<u8>,
}

impl<S: OutputSink + ?Sized> std::fmt::Debug for CsoWriter<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsoWriter")
            .field("total_size", &self.total_size)
            .field("sectors", &self.sectors)
            .field("written", &self.index.len())
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl<'s, S: OutputSink + ?Sized> CsoWriter<'s, S> {
    /// Reserves the header and index in the current file of `sink`.
    ///
    /// The file must have been opened without compression. `level` is the
    /// deflate level, 1 to 9.
    pub fn begin(sink: &'s mut S, total_size: u64, level: u32) -> Result<Self, CsoError> {
        let sectors = total_size.div_ceil(SECTOR_SIZE as u64);
        let sectors = u32::try_from(sectors).map_err(|_| {
            IndexOverflowSnafu {
                offset: total_size,
            }
            .build()
        })?;

        let prefix = (HEADER_SIZE + 4 * (sectors as usize + 1)) as u64;
        ensure!(
            prefix < u64::from(STORED_SECTOR),
            IndexOverflowSnafu { offset: prefix }
        );

        let reservation = sink.reserve(prefix).context(SinkSnafu)?;
        debug!(total_size, sectors, level, "started CSO image");

        Ok(Self {
            sink,
            reservation,
            total_size,
            sectors,
            index: Vec::with_capacity(sectors as usize + 1),
            offset: prefix,
            compress: Compress::new(Compression::new(level), false),
            buffer: vec![0; SECTOR_SIZE],
        })
    }

    /// Returns the number of sectors the image was declared with.
    #[must_use]
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    /// Compresses and appends one sector.
    ///
    /// A sector that does not shrink is stored as is and flagged in the index.
    pub fn write_sector(&mut self, sector: &[u8]) -> Result<(), CsoError> {
        ensure!(
            sector.len() == SECTOR_SIZE,
            SectorSizeSnafu { len: sector.len() }
        );
        let index = self.index.len() as u32;
        ensure!(
            index < self.sectors,
            TooManySectorsSnafu {
                sectors: self.sectors
            }
        );
        ensure!(
            self.offset < u64::from(STORED_SECTOR),
            IndexOverflowSnafu {
                offset: self.offset
            }
        );

        self.compress.reset();
        let status = self
            .compress
            .compress(sector, &mut self.buffer, FlushCompress::Finish)
            .context(DeflateSnafu { index })?;
        let packed = self.compress.total_out() as usize;

        if status == Status::StreamEnd && packed < SECTOR_SIZE {
            self.index.push(U32::new(self.offset as u32));
            self.sink.write(&self.buffer[..packed]).context(SinkSnafu)?;
            self.offset += packed as u64;
        } else {
            self.index.push(U32::new(self.offset as u32 | STORED_SECTOR));
            self.sink.write(sector).context(SinkSnafu)?;
            self.offset += SECTOR_SIZE as u64;
        }

        Ok(())
    }

    /// Writes the header and index into the reserved space.
    ///
    /// Returns the size of the CSO file. The sink's file is left open.
    pub fn finish(mut self) -> Result<u64, CsoError> {
        let written = self.index.len() as u32;
        ensure!(
            written == self.sectors,
            IncompleteSnafu {
                written,
                sectors: self.sectors
            }
        );
        ensure!(
            self.offset < u64::from(STORED_SECTOR),
            IndexOverflowSnafu {
                offset: self.offset
            }
        );
        self.index.push(U32::new(self.offset as u32));

        let header = CsoHeader {
            magic: *CSO_MAGIC,
            header_size: U32::new(HEADER_SIZE as u32),
            total_size: U64::new(self.total_size),
            block_size: U32::new(SECTOR_SIZE as u32),
            version: CSO_VERSION,
            align: 0,
            _reserved: [0; 2],
        };

        let mut prefix = Vec::with_capacity(self.reservation.len() as usize);
        prefix.extend_from_slice(header.as_bytes());
        prefix.extend_from_slice(self.index.as_bytes());

        self.sink
            .patch(self.reservation, &prefix)
            .context(SinkSnafu)?;

        debug!(size = self.offset, sectors = self.sectors, "finished CSO image");
        Ok(self.offset)
    }
}
