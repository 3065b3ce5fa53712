//! Library for converting PlayStation Vita, PSP and PSX PKG files.
//!
//! This crate provides the extraction logic behind the `vita-pkg-util` tool:
//! it walks the item table of a parsed [`vita_pkg::Pkg`], routes every item
//! to its place in the output layout, rebuilds PSP disc images and writes the
//! result to a [`vita_sink::OutputSink`].
//!
//! # Overview
//!
//! The main entry point is [`PkgExtractor`], which takes a parsed package, an
//! [`ExtractProgress`] implementation and [`ExtractOptions`], then writes to
//! any sink. [`PkgExtractor::extract_to()`] covers the two usual outputs: a
//! zip archive named after the package, or loose files.
//!
//! # Example
//!
//! ```no_run
//! use vita_pkg_util::{ExtractOptions, OutputMode, PkgExtractor, SilentProgress, open_pkg};
//!
//! let pkg = unsafe { open_pkg("game.pkg".as_ref()) }.expect("failed to open PKG");
//! let extractor = PkgExtractor::new(&pkg, SilentProgress, ExtractOptions::default());
//! let zip = extractor
//!     .extract_to(".".as_ref(), OutputMode::Zip)
//!     .expect("extraction failed");
//! println!("wrote {}", zip.display());
//! ```
//!
//! # Custom progress reporting
//!
//! You can implement the [`ExtractProgress`] trait to receive fine-grained progress
//! updates during extraction.

pub mod extract;
pub mod progress;

pub use self::extract::{
    ErrorClass, ExtractError, ExtractOptions, License, OutputMode, PkgExtractor,
};
pub use self::progress::{ExtractProgress, SilentProgress};
pub use vita_psp::ImageFormat;

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;

use snafu::{ResultExt, Snafu};
use std::path::Path;

/// Errors that can occur when opening a PKG file from disk.
#[derive(Debug, Snafu)]
pub enum OpenPkgError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("failed to parse PKG"))]
    ParsePkg { source: vita_pkg::OpenError },
}

impl OpenPkgError {
    /// Returns the category of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OpenFile { .. } | Self::MmapFile { .. } => ErrorClass::Io,
            Self::ParsePkg { source } => extract::open_class(source),
        }
    }
}

/// Opens a PKG file from disk using a memory-mapped read.
///
/// The header, metadata and SFO are parsed; items are read during extraction.
///
/// # Safety
///
/// The caller must ensure the file is not modified or truncated while the
/// returned `Pkg` is in use.
pub unsafe fn open_pkg(path: &Path) -> Result<vita_pkg::Pkg<memmap2::Mmap>, OpenPkgError> {
    let file = std::fs::File::open(path).context(OpenFileSnafu)?;
    let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu)? };
    vita_pkg::Pkg::new(raw).context(ParsePkgSnafu)
}
