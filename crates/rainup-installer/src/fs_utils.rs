use std::collections::BTreeSet;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::debug;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Removes whatever sits at `path` without following it: a symlink is
/// unlinked, a directory is removed with its contents.
pub fn remove_path_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => remove_file_if_exists(path),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Removes directories left empty below `root`, starting from each of
/// `touched` and walking up. `root` itself is never removed.
///
/// Returns the directories that were removed, deepest first.
pub fn prune_empty_dirs(root: &Path, touched: &BTreeSet<PathBuf>) -> io::Result<Vec<PathBuf>> {
    let mut candidates: Vec<&PathBuf> = touched.iter().collect();
    candidates.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));

    let mut removed = Vec::new();
    for start in candidates {
        let mut current = start.as_path();
        while current != root && current.starts_with(root) {
            match is_empty_dir(current) {
                Ok(true) => {
                    fs::remove_dir(current)?;
                    debug!("removed empty directory {}", current.display());
                    removed.push(current.to_path_buf());
                }
                Ok(false) => break,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            let Some(parent) = current.parent() else {
                break;
            };
            current = parent;
        }
    }
    Ok(removed)
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}
