use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::ArchiveError;

/// One regular file inside an archive.
///
/// `path` is relative, `/`-separated and free of `.`/`..` components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    path: String,
    size: u64,
    mode: Option<u32>,
    index: usize,
}

impl ArchiveEntry {
    pub(crate) fn new(path: String, size: u64, mode: Option<u32>, index: usize) -> Self {
        Self {
            path,
            size,
            mode,
            index,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Unix permission bits recorded by the archiver, if any.
    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Location of this entry once extracted below `root`.
    pub fn destination(&self, root: &Path) -> PathBuf {
        let mut dest = root.to_path_buf();
        for component in self.path.split('/') {
            dest.push(component);
        }
        dest
    }
}

/// Result of normalizing a raw archive member name.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EntryName {
    Relative(String),
    /// Names only the archive root (e.g. `./`).
    Root,
    Unsafe,
}

pub(crate) fn normalize_entry_name(raw: &str) -> EntryName {
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return EntryName::Unsafe;
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return EntryName::Unsafe,
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        EntryName::Root
    } else {
        EntryName::Relative(parts.join("/"))
    }
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Streams `reader` into `entry`'s destination below `dest_root`, replacing
/// whatever file or symlink is already there.
pub(crate) fn write_entry(
    dest_root: &Path,
    entry: &ArchiveEntry,
    reader: &mut dyn Read,
) -> Result<PathBuf, ArchiveError> {
    let dest = entry.destination(dest_root);
    if !dest.starts_with(dest_root) {
        return Err(ArchiveError::UnsafeEntry {
            archive: dest_root.to_path_buf(),
            entry: entry.path().to_string(),
        });
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|source| ArchiveError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let write_err = |source: io::Error| ArchiveError::Write {
        path: dest.clone(),
        source,
    };
    // A link at the destination is replaced, never written through.
    match fs::symlink_metadata(&dest) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            fs::remove_file(&dest).map_err(write_err)?;
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(write_err(err)),
    }
    let mut file = File::create(&dest).map_err(write_err)?;
    io::copy(reader, &mut file).map_err(write_err)?;
    drop(file);

    apply_mode(&dest, entry.mode()).map_err(write_err)?;
    Ok(dest)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // Owner write stays set so a later update can replace the file.
    match mode.map(|mode| mode & 0o777) {
        Some(bits) if bits != 0 => {
            fs::set_permissions(path, fs::Permissions::from_mode(bits | 0o200))
        }
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}
