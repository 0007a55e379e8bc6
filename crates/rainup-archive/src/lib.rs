//! Read-only access to release archives.
//!
//! [`ArchiveReader`] hides whether a release ships as a random-access `.zip`
//! or a sequential `.tar` (optionally gzip-wrapped). Callers list entries with
//! [`ArchiveReader::files`], pull single entries out with
//! [`ArchiveReader::extract_file`], or stream everything once with
//! [`ArchiveReader::for_each_entry`].

mod entry;
mod error;
mod tar_reader;
mod zip_reader;

use std::io::Read;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use rainup_core::ArchiveType;

pub use entry::ArchiveEntry;
pub use error::ArchiveError;
pub use tar_reader::TarReader;
pub use zip_reader::ZipReader;

pub enum ArchiveReader {
    Zip(ZipReader),
    Tar(TarReader),
}

impl ArchiveReader {
    /// Opens `path`, choosing the format from its file name.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let archive_type =
            ArchiveType::infer_from_path(path).ok_or_else(|| ArchiveError::UnsupportedFormat {
                path: path.to_path_buf(),
            })?;
        Self::open_as(path, archive_type)
    }

    pub fn open_as(path: &Path, archive_type: ArchiveType) -> Result<Self, ArchiveError> {
        match archive_type {
            ArchiveType::Zip => ZipReader::open(path).map(Self::Zip),
            ArchiveType::Tar => TarReader::open(path).map(Self::Tar),
            ArchiveType::TarGz => TarReader::open_gzipped(path).map(Self::Tar),
        }
    }

    pub fn archive_type(&self) -> ArchiveType {
        match self {
            Self::Zip(_) => ArchiveType::Zip,
            Self::Tar(_) => ArchiveType::Tar,
        }
    }

    /// Path of the container actually being read; for gzip-wrapped archives
    /// this is the decompressed temporary copy.
    pub fn path(&self) -> &Path {
        match self {
            Self::Zip(reader) => reader.path(),
            Self::Tar(reader) => reader.path(),
        }
    }

    /// Regular files in archive order. Stable for the reader's lifetime.
    pub fn files(&self) -> &[ArchiveEntry] {
        match self {
            Self::Zip(reader) => reader.files(),
            Self::Tar(reader) => reader.files(),
        }
    }

    /// Writes one entry to `dest_dir/<entry path>`, overwriting an existing file.
    pub fn extract_file(&mut self, entry_path: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        match self {
            Self::Zip(reader) => reader.extract_file(entry_path, dest_dir),
            Self::Tar(reader) => reader.extract_file(entry_path, dest_dir),
        }
    }

    /// Extracts every file. `dest_dir` may already hold files; they are replaced.
    pub fn extract_all(&mut self, dest_dir: &Path) -> Result<(), ArchiveError> {
        self.for_each_entry(|entry, reader| -> Result<_, ArchiveError> {
            entry::write_entry(dest_dir, entry, reader)?;
            Ok(ControlFlow::Continue(()))
        })
    }

    /// Streams each file entry once, in [`files`](Self::files) order. The
    /// visitor may stop the walk by returning [`ControlFlow::Break`].
    pub fn for_each_entry<E, F>(&mut self, visit: F) -> Result<(), E>
    where
        E: From<ArchiveError>,
        F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<ControlFlow<()>, E>,
    {
        match self {
            Self::Zip(reader) => reader.for_each_entry(visit),
            Self::Tar(reader) => reader.for_each_entry(visit),
        }
    }

    /// Writes `entry`, whose bytes `reader` yields, below `dest_dir`. For use
    /// inside a [`for_each_entry`](Self::for_each_entry) visitor.
    pub fn write_entry(
        dest_dir: &Path,
        entry: &ArchiveEntry,
        reader: &mut dyn Read,
    ) -> Result<PathBuf, ArchiveError> {
        entry::write_entry(dest_dir, entry, reader)
    }
}
