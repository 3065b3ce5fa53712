//! Decoders for the PSP content nested inside PKG files.
//!
//! PSP packages carry their game as an encrypted `EBOOT.PBP`. The disc image
//! inside it ([`psar`]) is rebuilt block by block and written either as a
//! plain ISO or re-compressed as a [CSO](cso). The game key in
//! `PSP-KEY.EDAT` is recovered by [`edat`].
//!
//! # Example
//!
//! ```no_run
//! use vita_psp::{ImageFormat, unpack_eboot};
//! use vita_sink::{OutputSink, ZipWriter};
//!
//! # fn example(eboot: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let mut zip = ZipWriter::create("game.zip".as_ref())?;
//! unpack_eboot(eboot, &mut zip, "pspemu/ISO/game.cso", ImageFormat::Cso { level: 9 })?;
//! zip.finish()?;
//! # Ok(())
//! # }
//! ```

use snafu::{ResultExt, Snafu};
use tracing::info;
use vita_pkg::source::ItemSource;
use vita_sink::{OutputSink, SinkError};

use self::cso::{CsoError, CsoWriter};
use self::psar::{PsarError, PsarImage, SECTOR_SIZE};

pub mod cso;
pub mod edat;
pub mod keys;
pub mod lzrc;
pub mod psar;

/// Output format of a rebuilt disc image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Plain ISO, deflated by the archive.
    Iso,
    /// CSO with each sector deflated at `level`.
    Cso { level: u32 },
}

impl ImageFormat {
    /// Returns the file extension without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Iso => "iso",
            Self::Cso { .. } => "cso",
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ImageError {
    #[snafu(display("cannot read the disc image"))]
    ReadImageFailed { source: PsarError },

    #[snafu(display("cannot write '{path}'"))]
    WriteFailed { path: String, source: SinkError },

    #[snafu(display("cannot write CSO '{path}'"))]
    WriteCsoFailed { path: String, source: CsoError },
}

/// Writes the disc image of `image` to a new file at `path`.
///
/// `on_block` is called with the number of blocks done after each block.
/// Returns the size of the written file.
pub fn write_image<S, O>(
    image: &PsarImage<'_, S>,
    sink: &mut O,
    path: &str,
    format: ImageFormat,
    mut on_block: impl FnMut(u32),
) -> Result<u64, ImageError>
where
    S: ItemSource + ?Sized,
    O: OutputSink + ?Sized,
{
    let mut scratch = Vec::new();
    let mut block = vec![0u8; image.block_size()];

    sink.begin_file(path, format == ImageFormat::Iso)
        .context(WriteFailedSnafu { path })?;

    let size = match format {
        ImageFormat::Iso => {
            for index in 0..image.block_count() {
                image
                    .read_block(index, &mut scratch, &mut block)
                    .context(ReadImageFailedSnafu)?;
                sink.write(&block).context(WriteFailedSnafu { path })?;
                on_block(index + 1);
            }
            image.iso_size()
        }
        ImageFormat::Cso { level } => {
            let mut cso = CsoWriter::begin(sink, image.iso_size(), level)
                .context(WriteCsoFailedSnafu { path })?;
            for index in 0..image.block_count() {
                image
                    .read_block(index, &mut scratch, &mut block)
                    .context(ReadImageFailedSnafu)?;
                for sector in block.chunks_exact(SECTOR_SIZE) {
                    cso.write_sector(sector)
                        .context(WriteCsoFailedSnafu { path })?;
                }
                on_block(index + 1);
            }
            cso.finish().context(WriteCsoFailedSnafu { path })?
        }
    };

    sink.end_file().context(WriteFailedSnafu { path })?;

    info!(
        path,
        blocks = image.block_count(),
        size,
        format = format.extension(),
        "rebuilt disc image"
    );
    Ok(size)
}

/// Opens the disc image of a decrypted `EBOOT.PBP` and writes it to `path`.
pub fn unpack_eboot<S, O>(
    eboot: &S,
    sink: &mut O,
    path: &str,
    format: ImageFormat,
) -> Result<u64, ImageError>
where
    S: ItemSource + ?Sized,
    O: OutputSink + ?Sized,
{
    let image = PsarImage::open(eboot).context(ReadImageFailedSnafu)?;
    write_image(&image, sink, path, format, |_| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KIRK7_KEY63, PspCipher};
    use crate::psar::BlockEntry;
    use flate2::{Decompress, FlushDecompress};
    use vita_sink::MemorySink;

    fn two_blocks() -> (Vec<u8>, Vec<u8>) {
        let iso: Vec<u8> = (0..4 * SECTOR_SIZE)
            .map(|i| if i < SECTOR_SIZE { 0 } else { (i / 7) as u8 })
            .collect();

        let mut data = vec![0u8; 0x100];
        data.extend_from_slice(&iso);
        (data, iso)
    }

    fn image(data: &[u8]) -> PsarImage<'_, [u8]> {
        let blocks = (0..2)
            .map(|i| BlockEntry::plain(i * 2 * SECTOR_SIZE as u32, 2 * SECTOR_SIZE as u32))
            .collect();
        PsarImage::from_parts(data, 0x100, 2, PspCipher::new(&KIRK7_KEY63, [0; 16]), blocks)
    }

    #[test]
    fn iso_is_written_block_by_block() {
        let (data, iso) = two_blocks();
        let image = image(&data);
        let mut sink = MemorySink::new();
        let mut progress = Vec::new();

        let size = write_image(&image, &mut sink, "pspemu/ISO/a.iso", ImageFormat::Iso, |done| {
            progress.push(done)
        })
        .unwrap();

        assert_eq!(size, iso.len() as u64);
        assert_eq!(progress, [1, 2]);
        let file = sink.file("pspemu/ISO/a.iso").unwrap();
        assert!(file.compressed);
        assert_eq!(file.data, iso);
    }

    #[test]
    fn cso_sectors_inflate_to_the_iso() {
        let (data, iso) = two_blocks();
        let image = image(&data);
        let mut sink = MemorySink::new();

        let size = write_image(
            &image,
            &mut sink,
            "pspemu/ISO/a.cso",
            ImageFormat::Cso { level: 6 },
            |_| {},
        )
        .unwrap();

        let file = sink.file("pspemu/ISO/a.cso").unwrap();
        assert!(!file.compressed);
        assert_eq!(file.data.len() as u64, size);

        let cso = &file.data;
        let entry = |i: usize| u32::from_le_bytes(cso[24 + 4 * i..28 + 4 * i].try_into().unwrap());
        for (i, expected) in iso.chunks(SECTOR_SIZE).enumerate() {
            let start = (entry(i) & 0x7FFF_FFFF) as usize;
            let end = (entry(i + 1) & 0x7FFF_FFFF) as usize;

            let mut sector = vec![0u8; SECTOR_SIZE];
            if entry(i) & 0x8000_0000 != 0 {
                sector.copy_from_slice(&cso[start..end]);
            } else {
                Decompress::new(false)
                    .decompress(&cso[start..end], &mut sector, FlushDecompress::Finish)
                    .unwrap();
            }
            assert_eq!(sector, expected, "sector {i}");
        }
    }

    #[test]
    fn bad_blocks_abort_the_image() {
        let (data, _) = two_blocks();
        let image = PsarImage::from_parts(
            data.as_slice(),
            0x100,
            2,
            PspCipher::new(&KIRK7_KEY63, [0; 16]),
            vec![BlockEntry::plain(0x10_0000, 2 * SECTOR_SIZE as u32)],
        );
        let mut sink = MemorySink::new();

        assert!(matches!(
            write_image(&image, &mut sink, "a.iso", ImageFormat::Iso, |_| {}),
            Err(ImageError::ReadImageFailed {
                source: PsarError::BlockOutOfRange { index: 0, .. }
            })
        ));
    }

    #[test]
    fn extensions() {
        assert_eq!(ImageFormat::Iso.extension(), "iso");
        assert_eq!(ImageFormat::Cso { level: 1 }.extension(), "cso");
    }
}
