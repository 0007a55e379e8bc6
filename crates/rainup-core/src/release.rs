use std::collections::BTreeMap;
use std::fmt;

use anyhow::anyhow;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    Macos,
}

impl Platform {
    pub fn current() -> Option<Self> {
        match std::env::consts::OS {
            "linux" => Some(Self::Linux),
            "windows" => Some(Self::Windows),
            "macos" => Some(Self::Macos),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Macos => "macos",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "linux" => Some(Self::Linux),
            "windows" | "win" => Some(Self::Windows),
            "macos" | "darwin" | "apple" => Some(Self::Macos),
            _ => None,
        }
    }

    /// Container format this platform's builds are published in when a
    /// download reference does not reveal it.
    pub fn default_archive_type(self) -> ArchiveType {
        match self {
            Self::Windows => ArchiveType::Zip,
            Self::Linux | Self::Macos => ArchiveType::TarGz,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published release. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub version: String,
    pub changelog: String,
    pub downloads: BTreeMap<Platform, String>,
}

impl ReleaseDescriptor {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            changelog: String::new(),
            downloads: BTreeMap::new(),
        }
    }

    pub fn with_changelog(mut self, changelog: impl Into<String>) -> Self {
        self.changelog = changelog.into();
        self
    }

    pub fn with_download(mut self, platform: Platform, url: impl Into<String>) -> Self {
        self.downloads.insert(platform, url.into());
        self
    }

    pub fn download_for(&self, platform: Platform) -> Option<&str> {
        self.downloads.get(&platform).map(String::as_str)
    }

    pub fn archive_type_for(&self, platform: Platform) -> Option<ArchiveType> {
        let url = self.download_for(platform)?;
        Some(ArchiveType::infer_from_url(url).unwrap_or_else(|| platform.default_archive_type()))
    }

    /// Beta builds are labelled with a leading `b` (e.g. `b1.4.2`).
    pub fn is_beta(&self) -> bool {
        self.version.starts_with('b')
    }

    pub fn semver(&self) -> anyhow::Result<Version> {
        let trimmed = self.version.trim().trim_start_matches('v');
        Version::parse(trimmed)
            .map_err(|err| anyhow!("release label '{}' is not a semantic version: {err}", self.version))
    }

    /// File-system safe form of the version label, used to name cached
    /// archives. Distinct labels always map to distinct names: bytes outside
    /// `[A-Za-z0-9._-]` are written as `%XX`.
    pub fn cache_label(&self) -> String {
        if self.version.is_empty() {
            return "%".to_string();
        }
        let all_dots = self.version.bytes().all(|byte| byte == b'.');
        let mut label = String::with_capacity(self.version.len());
        for byte in self.version.bytes() {
            let plain = byte.is_ascii_alphanumeric()
                || matches!(byte, b'-' | b'_')
                || (byte == b'.' && !all_dots);
            if plain {
                label.push(char::from(byte));
            } else {
                label.push_str(&format!("%{byte:02X}"));
            }
        }
        label
    }
}
