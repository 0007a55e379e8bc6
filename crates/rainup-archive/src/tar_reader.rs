use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::entry::{normalize_entry_name, write_entry, ArchiveEntry, EntryName};
use crate::error::ArchiveError;

static DECOMPRESS_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sequential reader over a `.tar` archive, optionally produced from a
/// `.tar.gz` by [`TarReader::open_gzipped`].
///
/// Every pass (listing, single-entry extraction, full extraction) re-reads the
/// container from its first header.
pub struct TarReader {
    path: PathBuf,
    temporary: bool,
    entries: Vec<ArchiveEntry>,
}

impl TarReader {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        Self::open_with(path.to_path_buf(), false)
    }

    /// Decompresses `tar_gz_path` into a uniquely named `.tar` in the system
    /// temp directory and reads that copy. The copy is removed on drop.
    pub fn open_gzipped(tar_gz_path: &Path) -> Result<Self, ArchiveError> {
        let tar_path = decompress_to_temp(tar_gz_path)?;
        match Self::open_with(tar_path.clone(), true) {
            Ok(reader) => Ok(reader),
            Err(err) => {
                if let Err(remove_err) = fs::remove_file(&tar_path) {
                    warn!(
                        "failed to remove temporary tar {}: {remove_err}",
                        tar_path.display()
                    );
                }
                Err(err)
            }
        }
    }

    fn open_with(path: PathBuf, temporary: bool) -> Result<Self, ArchiveError> {
        let entries = list_entries(&path)?;
        debug!("opened tar archive {} ({} files)", path.display(), entries.len());
        Ok(Self {
            path,
            temporary,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn files(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn extract_file(&self, entry_path: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        if !self.entries.iter().any(|entry| entry.path() == entry_path) {
            return Err(ArchiveError::EntryMissing {
                archive: self.path.clone(),
                entry: entry_path.to_string(),
            });
        }

        let mut written = None;
        self.for_each_entry(|entry, reader| -> Result<_, ArchiveError> {
            if entry.path() != entry_path {
                return Ok(ControlFlow::Continue(()));
            }
            written = Some(write_entry(dest_dir, entry, reader)?);
            Ok(ControlFlow::Break(()))
        })?;

        written.ok_or_else(|| ArchiveError::EntryMissing {
            archive: self.path.clone(),
            entry: entry_path.to_string(),
        })
    }

    pub fn for_each_entry<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        E: From<ArchiveError>,
        F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<ControlFlow<()>, E>,
    {
        let directory_err = |source: io::Error| ArchiveError::Directory {
            path: self.path.clone(),
            source,
        };

        let file = File::open(&self.path).map_err(|source| ArchiveError::Open {
            path: self.path.clone(),
            source,
        })?;
        let mut archive = tar::Archive::new(BufReader::new(file));
        let mut pending = self.entries.iter().peekable();
        // Members read ahead of their listing position, which only happens
        // when a later duplicate supersedes an earlier name.
        let wanted: HashSet<usize> = self.entries.iter().map(ArchiveEntry::index).collect();
        let mut buffered: HashMap<usize, Vec<u8>> = HashMap::new();

        for (index, member) in archive.entries().map_err(directory_err)?.enumerate() {
            while let Some(data) = pending
                .peek()
                .and_then(|entry| buffered.remove(&entry.index()))
            {
                let Some(entry) = pending.next() else {
                    break;
                };
                if visit(entry, &mut Cursor::new(data))?.is_break() {
                    return Ok(());
                }
            }

            let Some(next_index) = pending.peek().map(|entry| entry.index()) else {
                break;
            };
            let mut member = member.map_err(directory_err)?;
            if index == next_index {
                let Some(entry) = pending.next() else {
                    break;
                };
                if visit(entry, &mut member)?.is_break() {
                    return Ok(());
                }
            } else if wanted.contains(&index) {
                let mut data = Vec::new();
                member.read_to_end(&mut data).map_err(directory_err)?;
                buffered.insert(index, data);
            }
        }

        for entry in pending {
            let Some(data) = buffered.remove(&entry.index()) else {
                continue;
            };
            if visit(entry, &mut Cursor::new(data))?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for TarReader {
    fn drop(&mut self) {
        if !self.temporary {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(
                "failed to remove temporary tar {}: {err}",
                self.path.display()
            );
        }
    }
}

fn list_entries(path: &Path) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let directory_err = |source: io::Error| ArchiveError::Directory {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|source| ArchiveError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    let mut entries = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (index, member) in archive.entries().map_err(directory_err)?.enumerate() {
        let member = member.map_err(directory_err)?;
        if !member.header().entry_type().is_file() {
            continue;
        }

        let raw_name = String::from_utf8_lossy(&member.path_bytes()).into_owned();
        let name = match normalize_entry_name(&raw_name) {
            EntryName::Relative(name) => name,
            EntryName::Root => continue,
            EntryName::Unsafe => {
                return Err(ArchiveError::UnsafeEntry {
                    archive: path.to_path_buf(),
                    entry: raw_name,
                })
            }
        };
        let mode = member.header().mode().ok();
        // A repeated name keeps its first position but reads the last member,
        // matching what `tar -x` leaves on disk.
        if let Some(&position) = positions.get(&name) {
            debug!("tar member '{name}' in {} is superseded", path.display());
            entries[position] = ArchiveEntry::new(name, member.size(), mode, index);
            continue;
        }
        positions.insert(name.clone(), entries.len());
        entries.push(ArchiveEntry::new(name, member.size(), mode, index));
    }

    Ok(entries)
}

fn decompress_to_temp(tar_gz_path: &Path) -> Result<PathBuf, ArchiveError> {
    let source = File::open(tar_gz_path).map_err(|source| ArchiveError::Open {
        path: tar_gz_path.to_path_buf(),
        source,
    })?;

    let file_name = tar_gz_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("archive");
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let seq = DECOMPRESS_SEQ.fetch_add(1, Ordering::Relaxed);
    let tar_path = std::env::temp_dir().join(format!(
        "{file_name}-{}-{millis}-{seq}.tar",
        std::process::id()
    ));

    let decompress_err = |source: io::Error| ArchiveError::Decompress {
        path: tar_gz_path.to_path_buf(),
        source,
    };
    let output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tar_path)
        .map_err(|source| ArchiveError::Write {
            path: tar_path.clone(),
            source,
        })?;

    let mut writer = BufWriter::new(output);
    let copied = io::copy(&mut GzDecoder::new(BufReader::new(source)), &mut writer)
        .and_then(|_| writer.flush());
    if let Err(err) = copied {
        drop(writer);
        if let Err(remove_err) = fs::remove_file(&tar_path) {
            warn!(
                "failed to remove partial tar {}: {remove_err}",
                tar_path.display()
            );
        }
        return Err(decompress_err(err));
    }

    debug!(
        "decompressed {} into {}",
        tar_gz_path.display(),
        tar_path.display()
    );
    Ok(tar_path)
}
