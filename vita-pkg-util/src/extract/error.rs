use snafu::Snafu;
use std::fmt;
use vita_pkg::OpenError;
use vita_pkg::header::ReadError;
use vita_pkg::item::ItemError;
use vita_pkg::meta::MetaError;
use vita_pkg::sfo::SfoError;
use vita_psp::ImageError;
use vita_psp::cso::CsoError;
use vita_psp::edat::EdatError;
use vita_psp::psar::PsarError;
use vita_sink::SinkError;

/// Errors that can occur during PKG extraction.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ExtractError {
    #[snafu(display("failed to read item record: {source}"))]
    ReadItem { source: ItemError },

    #[snafu(display("cannot locate data of '{name}': {source}"))]
    ItemData { name: String, source: ItemError },

    #[snafu(display("cannot read data of '{name}': {source}"))]
    ReadData {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("license is {actual} bytes, expected {expected}"))]
    LicenseSize { expected: usize, actual: usize },

    #[snafu(display("license is for '{actual}', the package is '{expected}'"))]
    LicenseMismatch { expected: String, actual: String },

    #[snafu(display("cannot create output: {source}"))]
    CreateOutput { source: SinkError },

    #[snafu(display("cannot write '{path}': {source}"))]
    Write { path: String, source: SinkError },

    #[snafu(display("cannot open the disc image in '{name}': {source}"))]
    OpenImage { name: String, source: PsarError },

    #[snafu(display("cannot rebuild the disc image of '{name}': {source}"))]
    Image { name: String, source: ImageError },

    #[snafu(display("cannot unwrap the key in '{name}': {source}"))]
    UnwrapKey { name: String, source: EdatError },

    #[snafu(display("cannot finish output: {source}"))]
    Finish { source: SinkError },
}

/// Broad category of an extraction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad magic or signature in some layer.
    Format,
    /// A declared range runs past the end of the data.
    Truncated,
    /// Content type, key type or block size outside the known set.
    Unsupported,
    /// Internally inconsistent data.
    Corrupt,
    /// The output or the input file failed.
    Io,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Format => "format error",
            Self::Truncated => "truncated input",
            Self::Unsupported => "unsupported variant",
            Self::Corrupt => "corrupt data",
            Self::Io => "I/O error",
        })
    }
}

impl ExtractError {
    /// Returns the category of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ReadItem { source } | Self::ItemData { source, .. } => item_class(source),
            Self::ReadData { .. } => ErrorClass::Io,
            Self::LicenseSize { .. } | Self::LicenseMismatch { .. } => ErrorClass::Format,
            Self::CreateOutput { .. } | Self::Write { .. } | Self::Finish { .. } => ErrorClass::Io,
            Self::OpenImage { source, .. } => psar_class(source),
            Self::Image { source, .. } => match source {
                ImageError::ReadImageFailed { source } => psar_class(source),
                ImageError::WriteCsoFailed { source, .. } => cso_class(source),
                _ => ErrorClass::Io,
            },
            Self::UnwrapKey { source, .. } => edat_class(source),
        }
    }
}

pub(crate) fn open_class(error: &OpenError) -> ErrorClass {
    match error {
        OpenError::ReadHeaderFailed { source } => match source {
            ReadError::InvalidMagic { .. } => ErrorClass::Format,
            _ => ErrorClass::Truncated,
        },
        OpenError::ReadMetadataFailed { source } => match source {
            MetaError::Truncated { .. } => ErrorClass::Truncated,
            _ => ErrorClass::Corrupt,
        },
        OpenError::UnsupportedContent { .. } | OpenError::DeriveKeysFailed { .. } => {
            ErrorClass::Unsupported
        }
        OpenError::ReadItemFailed { source } => item_class(source),
        OpenError::ParseSfoFailed { source } => match source {
            SfoError::TooSmall { .. } | SfoError::EntryOutOfRange { .. } => ErrorClass::Truncated,
            SfoError::TooBig { .. } => ErrorClass::Unsupported,
            _ => ErrorClass::Format,
        },
        _ => ErrorClass::Truncated,
    }
}

fn item_class(error: &ItemError) -> ErrorClass {
    match error {
        ItemError::Misaligned { .. } | ItemError::NameTooLong { .. } => ErrorClass::Corrupt,
        _ => ErrorClass::Truncated,
    }
}

fn psar_class(error: &PsarError) -> ErrorClass {
    match error {
        PsarError::ReadFailed { .. } => ErrorClass::Io,
        PsarError::TooShort { .. }
        | PsarError::PsarOutOfRange { .. }
        | PsarError::TableOutOfRange { .. }
        | PsarError::BlockOutOfRange { .. } => ErrorClass::Truncated,
        PsarError::InvalidEbootMagic | PsarError::InvalidPsarMagic => ErrorClass::Format,
        PsarError::UnsupportedBlockSize { .. } => ErrorClass::Unsupported,
        _ => ErrorClass::Corrupt,
    }
}

fn cso_class(error: &CsoError) -> ErrorClass {
    match error {
        CsoError::IndexOverflow { .. } => ErrorClass::Unsupported,
        CsoError::Sink { .. } | CsoError::Deflate { .. } => ErrorClass::Io,
        _ => ErrorClass::Corrupt,
    }
}

fn edat_class(error: &EdatError) -> ErrorClass {
    match error {
        EdatError::TooShort { .. } => ErrorClass::Truncated,
        EdatError::ReadFailed { .. } => ErrorClass::Io,
        EdatError::InvalidMagic => ErrorClass::Format,
        _ => ErrorClass::Unsupported,
    }
}
