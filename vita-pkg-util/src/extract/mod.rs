mod error;
mod synthetic;

pub use self::error::{ErrorClass, ExtractError};

pub(crate) use self::error::open_class;

use self::error::*;
use crate::progress::ExtractProgress;
use snafu::{ResultExt, ensure};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};
use vita_pkg::Pkg;
use vita_pkg::item::Item;
use vita_pkg::kind::{PathContext, RouteOptions, Transform};
use vita_pkg::naming;
use vita_pkg::source::ItemSource;
use vita_psp::psar::PsarImage;
use vita_psp::{ImageFormat, edat, write_image};
use vita_sink::{DirectoryWriter, OutputSink, ZipWriter};

/// Size of the buffer used to stream item data into the sink.
const COPY_CHUNK: usize = 64 * 1024;

/// Where [`PkgExtractor::extract_to()`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One `{output name}.zip` archive.
    Zip,
    /// Loose files below the output directory.
    Directory,
}

/// A decoded license blob (`work.bin` or RIF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License(Vec<u8>);

impl License {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Options that change what is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Format of rebuilt PSP disc images.
    pub image_format: ImageFormat,
    /// Keep `EBOOT.PBP` instead of rebuilding the disc image.
    pub keep_pbp: bool,
    /// Unwrap `PSP-KEY.EDAT` even when `keep_pbp` is set.
    pub decrypt_always: bool,
    pub license: Option<License>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            image_format: ImageFormat::Iso,
            keep_pbp: false,
            decrypt_always: false,
            license: None,
        }
    }
}

/// Extracts a PKG into an [`OutputSink`].
pub struct PkgExtractor<'a, R: AsRef<[u8]>, P: ExtractProgress> {
    pkg: &'a Pkg<R>,
    progress: P,
    options: ExtractOptions,
}

impl<'a, R: AsRef<[u8]>, P: ExtractProgress> PkgExtractor<'a, R, P> {
    /// Creates a new extractor for the given PKG.
    pub fn new(pkg: &'a Pkg<R>, progress: P, options: ExtractOptions) -> Self {
        Self {
            pkg,
            progress,
            options,
        }
    }

    /// Returns the name of the output for `mode`, e.g. `Game [PCSE00001] [USA].zip`.
    #[must_use]
    pub fn output_name(&self, mode: OutputMode) -> String {
        let name = naming::output_name(self.pkg.info());
        match mode {
            OutputMode::Zip => format!("{name}.zip"),
            OutputMode::Directory => name,
        }
    }

    /// Checks every item record and the license without writing anything.
    pub fn validate(&self) -> Result<(), ExtractError> {
        let count = self.pkg.validate().context(ReadItemSnafu)?;
        debug!(items = count, "validated item table");

        let Some(license) = &self.options.license else {
            return Ok(());
        };
        let Some(layout) = self.pkg.info().kind().license_layout() else {
            debug!(
                kind = self.pkg.info().kind().description(),
                "package takes no license, ignoring it"
            );
            return Ok(());
        };

        let data = license.as_bytes();
        ensure!(
            data.len() == layout.size,
            LicenseSizeSnafu {
                expected: layout.size,
                actual: data.len()
            }
        );

        let raw = &data[layout.content_id_offset..(layout.content_id_offset + 0x30).min(data.len())];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let actual = String::from_utf8_lossy(&raw[..end]);
        let expected = self.pkg.info().content_id();
        ensure!(
            actual == expected.as_str(),
            LicenseMismatchSnafu {
                expected: expected.as_str(),
                actual
            }
        );

        Ok(())
    }

    /// Writes the whole package into `sink` and finishes it.
    ///
    /// Nothing is written unless [`validate()`](Self::validate) passes.
    /// Returns the number of bytes written to files.
    pub fn extract<S: OutputSink + ?Sized>(&self, sink: &mut S) -> Result<u64, ExtractError> {
        self.validate()?;

        let mut out = Output::new(sink);
        self.write_all(&mut out)?;
        out.sink.finish().context(FinishSnafu)?;

        info!(
            bytes = out.bytes,
            kind = self.pkg.info().kind().description(),
            "extraction complete"
        );
        self.progress.completed(out.bytes);
        Ok(out.bytes)
    }

    /// Extracts into `dir`, either as a zip archive or as loose files.
    ///
    /// Returns the path of the archive, or `dir` for loose files. A partial
    /// archive is removed on failure.
    pub fn extract_to(&self, dir: &Path, mode: OutputMode) -> Result<PathBuf, ExtractError> {
        self.validate()?;

        match mode {
            OutputMode::Zip => {
                let path = dir.join(self.output_name(mode));
                let mut zip = ZipWriter::create(&path).context(CreateOutputSnafu)?;

                if let Err(e) = self.extract(&mut zip) {
                    drop(zip);
                    if let Err(remove) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %remove, "cannot remove partial archive");
                    }
                    return Err(e);
                }

                Ok(path)
            }
            OutputMode::Directory => {
                let mut writer = DirectoryWriter::new(dir);
                self.extract(&mut writer)?;
                Ok(dir.to_path_buf())
            }
        }
    }

    fn write_all<S: OutputSink + ?Sized>(&self, out: &mut Output<'_, S>) -> Result<(), ExtractError> {
        let info = self.pkg.info();
        let kind = info.kind();
        let root = kind.root(info.product_id(), info.label());

        for folder in &root.folders {
            out.folder(folder)?;
        }

        let ctx = PathContext {
            root: &root.path,
            product_id: info.product_id(),
            title: info.title(),
            image_extension: self.options.image_format.extension(),
        };
        let route_options = RouteOptions {
            keep_pbp: self.options.keep_pbp,
            decrypt_always: self.options.decrypt_always,
        };
        let total = self.pkg.item_count();

        for item in self.pkg.items() {
            let item = item.context(ReadItemSnafu)?;

            if item.is_directory() {
                if let Some(path) = kind.directory_path(item.name(), &root.path) {
                    trace!(name = item.name(), path = %path, "directory");
                    out.parents(&path)?;
                    out.folder(&path)?;
                }
                continue;
            }

            let Some(route) = kind.route(item.name(), route_options, &ctx) else {
                debug!(name = item.name(), "skipping item");
                self.progress
                    .item_skipped(item.name(), "not part of the output");
                continue;
            };

            trace!(name = item.name(), path = %route.path, transform = ?route.transform, "item");
            self.progress.item_start(&route.path, item.index(), total);
            out.parents(&route.path)?;
            self.write_item(out, &item, &route.path, route.transform)?;
        }

        synthetic::write(self.pkg, self.options.license.as_ref(), &root.path, out)
    }

    fn write_item<S: OutputSink + ?Sized>(
        &self,
        out: &mut Output<'_, S>,
        item: &Item,
        path: &str,
        transform: Transform,
    ) -> Result<(), ExtractError> {
        let name = item.name();

        match transform {
            Transform::Copy => {
                let data = self.pkg.item_data(item).context(ItemDataSnafu { name })?;
                out.copy(path, &data, name)
            }
            Transform::Passthrough => {
                let data = self
                    .pkg
                    .item_ciphertext(item)
                    .context(ItemDataSnafu { name })?;
                info!(name, path, "copying without decryption");
                out.copy(path, &data, name)
            }
            Transform::Image => {
                let data = self.pkg.item_data(item).context(ItemDataSnafu { name })?;
                let image = PsarImage::open(&data).context(OpenImageSnafu { name })?;

                self.progress.image_start(path, image.block_count());
                let size = write_image(
                    &image,
                    &mut *out.sink,
                    path,
                    self.options.image_format,
                    |done| self.progress.image_block(done),
                )
                .context(ImageSnafu { name })?;
                out.bytes += size;
                Ok(())
            }
            Transform::UnwrapKey => {
                let data = self.pkg.item_data(item).context(ItemDataSnafu { name })?;
                let key = edat::unwrap_psp_key(&data).context(UnwrapKeySnafu { name })?;
                info!(name, path, "unwrapped PSP key");
                out.file(path, &key)
            }
        }
    }
}

/// The sink plus the folders already emitted and the bytes written so far.
struct Output<'s, S: OutputSink + ?Sized> {
    sink: &'s mut S,
    folders: HashSet<String>,
    bytes: u64,
}

impl<'s, S: OutputSink + ?Sized> Output<'s, S> {
    fn new(sink: &'s mut S) -> Self {
        Self {
            sink,
            folders: HashSet::new(),
            bytes: 0,
        }
    }

    /// Emits `path` unless it was emitted before.
    fn folder(&mut self, path: &str) -> Result<(), ExtractError> {
        if self.folders.insert(path.to_owned()) {
            self.sink.add_folder(path).context(WriteSnafu { path })?;
        }
        Ok(())
    }

    /// Emits every missing ancestor folder of `path`.
    fn parents(&mut self, path: &str) -> Result<(), ExtractError> {
        for (end, _) in path.match_indices('/') {
            self.folder(&path[..end])?;
        }
        Ok(())
    }

    /// Writes a small file in one piece.
    fn file(&mut self, path: &str, data: &[u8]) -> Result<(), ExtractError> {
        self.sink.begin_file(path, false).context(WriteSnafu { path })?;
        self.sink.write(data).context(WriteSnafu { path })?;
        self.sink.end_file().context(WriteSnafu { path })?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Streams `source` into a new file.
    fn copy<I: ItemSource + ?Sized>(
        &mut self,
        path: &str,
        source: &I,
        name: &str,
    ) -> Result<(), ExtractError> {
        let len = source.len();
        let mut buffer = vec![0u8; COPY_CHUNK.min(len as usize)];

        self.sink.begin_file(path, false).context(WriteSnafu { path })?;
        let mut offset = 0;
        while offset < len {
            let chunk = &mut buffer[..(len - offset).min(COPY_CHUNK as u64) as usize];
            source
                .read_exact_at(offset, chunk)
                .context(ReadDataSnafu { name })?;
            self.sink.write(chunk).context(WriteSnafu { path })?;
            offset += chunk.len() as u64;
        }
        self.sink.end_file().context(WriteSnafu { path })?;

        self.bytes += len;
        Ok(())
    }
}
