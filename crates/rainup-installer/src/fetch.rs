use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rainup_core::{Platform, ReleaseDescriptor};
use reqwest::blocking::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::InstallError;
use crate::fs_utils::remove_file_if_exists;
use crate::layout::CacheLayout;

const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Longest a connect or a single body read may stall before the transfer
/// fails. It bounds how long a cancelled run can wait on a silent server.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download of {url} failed with status {status}")]
    Transfer { url: String, status: u16 },

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("i/o error while downloading to {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Completed,
    /// The progress callback asked to stop; `dest` may hold a partial file.
    Aborted,
}

/// Retrieves a download reference to a local file.
///
/// `on_progress(bytes_done, bytes_total)` is called as data arrives; returning
/// `false` stops the transfer and yields [`FetchStatus::Aborted`].
pub trait Downloader: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<FetchStatus, FetchError>;
}

pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(DEFAULT_READ_TIMEOUT)
    }

    /// `timeout` applies to the connect and to each read of the body, so a
    /// large archive on a slow but live connection still completes.
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("rainup/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<FetchStatus, FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transfer {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let io_err = |source: io::Error| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut writer = BufWriter::new(File::create(dest).map_err(io_err)?);
        let mut buffer = vec![0_u8; DOWNLOAD_CHUNK];
        let mut downloaded = 0_u64;
        if !on_progress(downloaded, total) {
            return Ok(FetchStatus::Aborted);
        }

        loop {
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_err(err)),
            };
            writer.write_all(&buffer[..read]).map_err(io_err)?;
            downloaded += read as u64;
            if !on_progress(downloaded, total) {
                return Ok(FetchStatus::Aborted);
            }
        }

        writer.flush().map_err(io_err)?;
        Ok(FetchStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    CacheHit(PathBuf),
    Downloaded(PathBuf),
    Aborted,
}

/// Makes `release`'s archive for `platform` available in the cache.
///
/// An archive already in the cache is reused. Otherwise it is downloaded to a
/// `.part` sibling that is renamed into place on success and removed on abort
/// or failure.
pub fn fetch_release_archive(
    downloader: &dyn Downloader,
    layout: &CacheLayout,
    release: &ReleaseDescriptor,
    platform: Platform,
    on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
) -> Result<FetchOutcome, InstallError> {
    let (Some(url), Some(archive_type)) = (
        release.download_for(platform),
        release.archive_type_for(platform),
    ) else {
        return Err(InstallError::NoPlatformBuild {
            version: release.version.clone(),
            platform,
        });
    };

    let cache_path = layout.archive_cache_path(release, platform, archive_type);
    if cache_path.is_file() {
        debug!("cache hit for {} at {}", release.version, cache_path.display());
        return Ok(FetchOutcome::CacheHit(cache_path));
    }

    layout.ensure_dirs()?;
    let part_path = CacheLayout::part_path(&cache_path);
    info!("downloading {url} into {}", cache_path.display());
    let status = match downloader.fetch(url, &part_path, on_progress) {
        Ok(status) => status,
        Err(err) => {
            discard_part(&part_path);
            return Err(err.into());
        }
    };

    if status == FetchStatus::Aborted {
        discard_part(&part_path);
        info!("download of {url} cancelled");
        return Ok(FetchOutcome::Aborted);
    }

    fs::rename(&part_path, &cache_path).map_err(|source| {
        discard_part(&part_path);
        InstallError::filesystem("move downloaded archive into", &cache_path, source)
    })?;
    Ok(FetchOutcome::Downloaded(cache_path))
}

fn discard_part(part_path: &Path) {
    if let Err(err) = remove_file_if_exists(part_path) {
        warn!("failed to remove partial download {}: {err}", part_path.display());
    }
}
