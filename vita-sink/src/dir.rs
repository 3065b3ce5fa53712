use crate::sink_error::*;
use crate::{OutputSink, SinkError};
use snafu::{OptionExt, ResultExt, ensure};
use std::fs::{File, create_dir_all};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

struct OpenFile {
    name: String,
    file: BufWriter<File>,
    position: u64,
}

/// Writes each file to its own path below a root directory.
///
/// Compression requests are ignored; every file is written as is.
#[must_use]
pub struct DirectoryWriter {
    root: PathBuf,
    current: Option<OpenFile>,
    finished: bool,
}

impl DirectoryWriter {
    /// Creates a writer rooted at `root`. Nothing is created until the first
    /// folder or file.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: None,
            finished: false,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a `/`-separated name below the root, rejecting `..`.
    fn resolve(&self, name: &str) -> Result<PathBuf, SinkError> {
        let mut path = self.root.clone();
        let mut depth = 0;

        for part in name.split('/') {
            match part {
                "" | "." => {}
                ".." => return InvalidPathSnafu { path: name }.fail(),
                part => {
                    ensure!(!part.contains('\\'), InvalidPathSnafu { path: name });
                    path.push(part);
                    depth += 1;
                }
            }
        }

        ensure!(depth > 0, InvalidPathSnafu { path: name });
        Ok(path)
    }

    fn ensure_idle(&self) -> Result<(), SinkError> {
        ensure!(!self.finished, FinishedSnafu);
        if let Some(open) = &self.current {
            return FileStillOpenSnafu {
                path: open.name.clone(),
            }
            .fail();
        }
        Ok(())
    }

    fn open(&mut self) -> Result<&mut OpenFile, SinkError> {
        self.current.as_mut().context(NoOpenFileSnafu)
    }
}

impl OutputSink for DirectoryWriter {
    fn add_folder(&mut self, path: &str) -> Result<(), SinkError> {
        self.ensure_idle()?;

        let dir = self.resolve(path)?;
        create_dir_all(&dir).context(CreateFailedSnafu { path: &dir })?;
        Ok(())
    }

    fn begin_file(&mut self, path: &str, _compress: bool) -> Result<u64, SinkError> {
        self.ensure_idle()?;

        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            create_dir_all(parent).context(CreateFailedSnafu { path: parent })?;
        }

        let file = File::create(&target).context(CreateFailedSnafu { path: &target })?;
        trace!(path = %target.display(), "file");

        self.current = Some(OpenFile {
            name: path.to_owned(),
            file: BufWriter::new(file),
            position: 0,
        });

        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let open = self.open()?;
        open.file.write_all(data).context(WriteFailedSnafu)?;
        open.position += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.current.as_ref().map_or(0, |open| open.position)
    }

    fn set_offset(&mut self, offset: u64) -> Result<(), SinkError> {
        let open = self.open()?;
        open.file
            .seek(SeekFrom::Start(offset))
            .context(WriteFailedSnafu)?;
        open.position = offset;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError> {
        let open = self.open()?;
        open.file
            .seek(SeekFrom::Start(offset))
            .context(WriteFailedSnafu)?;
        open.file.write_all(data).context(WriteFailedSnafu)?;
        open.file
            .seek(SeekFrom::Start(open.position))
            .context(WriteFailedSnafu)?;
        Ok(())
    }

    fn end_file(&mut self) -> Result<(), SinkError> {
        let mut open = self.current.take().context(NoOpenFileSnafu)?;

        // A gap left at the end of the file still has to exist on disk.
        let end = open.file.seek(SeekFrom::End(0)).context(WriteFailedSnafu)?;
        if end < open.position {
            open.file
                .get_ref()
                .set_len(open.position)
                .context(WriteFailedSnafu)?;
        }

        open.file.flush().context(WriteFailedSnafu)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.ensure_idle()?;
        self.finished = true;
        Ok(())
    }
}
