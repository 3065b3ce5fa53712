use crate::sink_error::*;
use crate::{OutputSink, SinkError};
use snafu::{OptionExt, ensure};

/// A file captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFile {
    pub path: String,
    pub data: Vec<u8>,
    pub compressed: bool,
}

/// Keeps all output in memory.
///
/// Enforces the same call rules as [`ZipWriter`](crate::ZipWriter), including
/// the rejection of random access into compressed files.
#[derive(Debug, Default)]
#[must_use]
pub struct MemorySink {
    folders: Vec<String>,
    files: Vec<MemoryFile>,
    current: Option<MemoryFile>,
    position: u64,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the folders in creation order.
    #[must_use]
    pub fn folders(&self) -> &[String] {
        &self.folders
    }

    /// Returns the closed files in creation order.
    #[must_use]
    pub fn files(&self) -> &[MemoryFile] {
        &self.files
    }

    /// Returns the closed file at `path`.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&MemoryFile> {
        self.files.iter().find(|f| f.path == path)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn ensure_idle(&self) -> Result<(), SinkError> {
        ensure!(!self.finished, FinishedSnafu);
        if let Some(open) = &self.current {
            return FileStillOpenSnafu {
                path: open.path.clone(),
            }
            .fail();
        }
        Ok(())
    }

    fn open_uncompressed(&mut self) -> Result<&mut MemoryFile, SinkError> {
        let open = self.current.as_mut().context(NoOpenFileSnafu)?;
        ensure!(
            !open.compressed,
            CompressedRandomAccessSnafu { path: &open.path }
        );
        Ok(open)
    }
}

impl OutputSink for MemorySink {
    fn add_folder(&mut self, path: &str) -> Result<(), SinkError> {
        self.ensure_idle()?;
        self.folders.push(path.to_owned());
        Ok(())
    }

    fn begin_file(&mut self, path: &str, compress: bool) -> Result<u64, SinkError> {
        self.ensure_idle()?;
        self.current = Some(MemoryFile {
            path: path.to_owned(),
            data: Vec::new(),
            compressed: compress,
        });
        self.position = 0;
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let open = self.current.as_mut().context(NoOpenFileSnafu)?;
        let start = self.position as usize;
        let end = start + data.len();

        if open.data.len() < end {
            open.data.resize(end, 0);
        }
        open.data[start..end].copy_from_slice(data);
        self.position = end as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_offset(&mut self, offset: u64) -> Result<(), SinkError> {
        self.open_uncompressed()?;
        self.position = offset;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError> {
        let open = self.open_uncompressed()?;
        let start = offset as usize;
        let end = start + data.len();

        if open.data.len() < end {
            open.data.resize(end, 0);
        }
        open.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn end_file(&mut self) -> Result<(), SinkError> {
        let mut open = self.current.take().context(NoOpenFileSnafu)?;
        let len = self.position as usize;
        if open.data.len() < len {
            open.data.resize(len, 0);
        }
        self.files.push(open);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.ensure_idle()?;
        self.finished = true;
        Ok(())
    }
}
