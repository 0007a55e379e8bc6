use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rainup_core::{ArchiveType, Platform, ReleaseDescriptor};

use crate::error::InstallError;

const PART_SUFFIX: &str = "part";

/// Where downloaded release archives are kept between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    cache_dir: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// `<install_dir>/.rainup/cache`
    pub fn for_install_dir(install_dir: &Path) -> Self {
        Self::new(install_dir.join(".rainup").join("cache"))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn archive_cache_path(
        &self,
        release: &ReleaseDescriptor,
        platform: Platform,
        archive_type: ArchiveType,
    ) -> PathBuf {
        self.cache_dir.join(format!(
            "{}-{}.{}",
            release.cache_label(),
            platform.as_str(),
            archive_type.cache_extension()
        ))
    }

    pub fn part_path(cache_path: &Path) -> PathBuf {
        let file_name = cache_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("archive");
        cache_path.with_file_name(format!("{file_name}.{PART_SUFFIX}"))
    }

    pub fn ensure_dirs(&self) -> Result<(), InstallError> {
        fs::create_dir_all(&self.cache_dir)
            .map_err(|source| InstallError::filesystem("create", &self.cache_dir, source))
    }

    /// Completed archives currently in the cache, sorted by file name.
    pub fn cached_archives(&self) -> Result<Vec<PathBuf>, InstallError> {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(InstallError::filesystem("read", &self.cache_dir, err)),
        };

        let mut archives = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| InstallError::filesystem("read", &self.cache_dir, source))?
                .path();
            let is_part = path
                .extension()
                .is_some_and(|extension| extension == PART_SUFFIX);
            if path.is_file() && !is_part {
                archives.push(path);
            }
        }
        archives.sort();
        Ok(archives)
    }
}
