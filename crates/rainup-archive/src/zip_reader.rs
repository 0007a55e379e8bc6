use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;

use crate::entry::{normalize_entry_name, write_entry, ArchiveEntry, EntryName};
use crate::error::ArchiveError;

/// Random-access reader over a `.zip` archive. The central directory is
/// walked once in [`ZipReader::open`].
pub struct ZipReader {
    path: PathBuf,
    archive: ZipArchive<File>,
    entries: Vec<ArchiveEntry>,
}

impl ZipReader {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let directory_err = |source: zip::result::ZipError| ArchiveError::Directory {
            path: path.to_path_buf(),
            source: io::Error::other(source),
        };
        let mut archive = ZipArchive::new(file).map_err(directory_err)?;

        let mut entries = Vec::with_capacity(archive.len());
        let mut positions = HashMap::new();
        for index in 0..archive.len() {
            let member = archive.by_index_raw(index).map_err(directory_err)?;
            if member.is_dir() {
                continue;
            }

            let name = match normalize_entry_name(member.name()) {
                EntryName::Relative(name) => name,
                EntryName::Root => continue,
                EntryName::Unsafe => {
                    return Err(ArchiveError::UnsafeEntry {
                        archive: path.to_path_buf(),
                        entry: member.name().to_string(),
                    })
                }
            };
            // A repeated name keeps its first position but reads the last member.
            if let Some(&position) = positions.get(&name) {
                debug!("zip member '{name}' in {} is superseded", path.display());
                entries[position] = ArchiveEntry::new(name, member.size(), member.unix_mode(), index);
                continue;
            }
            positions.insert(name.clone(), entries.len());
            entries.push(ArchiveEntry::new(
                name,
                member.size(),
                member.unix_mode(),
                index,
            ));
        }

        debug!("opened zip archive {} ({} files)", path.display(), entries.len());
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn files(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn extract_file(&mut self, entry_path: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.path() == entry_path)
            .ok_or_else(|| ArchiveError::EntryMissing {
                archive: self.path.clone(),
                entry: entry_path.to_string(),
            })?;

        let mut member = self
            .archive
            .by_index(entry.index())
            .map_err(|source| ArchiveError::Directory {
                path: self.path.clone(),
                source: io::Error::other(source),
            })?;
        write_entry(dest_dir, entry, &mut member)
    }

    pub fn for_each_entry<E, F>(&mut self, mut visit: F) -> Result<(), E>
    where
        E: From<ArchiveError>,
        F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<ControlFlow<()>, E>,
    {
        for entry in &self.entries {
            let mut member =
                self.archive
                    .by_index(entry.index())
                    .map_err(|source| ArchiveError::Directory {
                        path: self.path.clone(),
                        source: io::Error::other(source),
                    })?;
            if visit(entry, &mut member)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}
