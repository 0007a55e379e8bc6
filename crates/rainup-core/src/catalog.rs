use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::release::{Platform, ReleaseDescriptor};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    releases: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    version: String,
    #[serde(default)]
    changelog: String,
    #[serde(default)]
    downloads: BTreeMap<String, String>,
}

/// Releases known to the updater, in the order the catalog lists them
/// (newest first by convention).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseCatalog {
    pub releases: Vec<ReleaseDescriptor>,
}

impl ReleaseCatalog {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let raw: CatalogFile = toml::from_str(input).context("failed to parse release catalog")?;

        let mut seen = HashSet::new();
        let mut releases = Vec::with_capacity(raw.releases.len());
        for entry in raw.releases {
            let version = entry.version.trim().to_string();
            if version.is_empty() {
                return Err(anyhow!("release catalog contains an entry with an empty version"));
            }
            if !seen.insert(version.clone()) {
                return Err(anyhow!("release catalog lists version '{version}' more than once"));
            }

            let mut release = ReleaseDescriptor::new(version).with_changelog(entry.changelog);
            for (key, url) in entry.downloads {
                let platform = Platform::parse(&key).ok_or_else(|| {
                    anyhow!(
                        "release '{}' names unknown platform '{key}'; supported: linux, windows, macos",
                        release.version
                    )
                })?;
                if url.trim().is_empty() {
                    return Err(anyhow!(
                        "release '{}' has an empty download reference for {platform}",
                        release.version
                    ));
                }
                release = release.with_download(platform, url.trim());
            }
            releases.push(release);
        }

        Ok(Self { releases })
    }

    pub fn find(&self, version: &str) -> Option<&ReleaseDescriptor> {
        let wanted = version.trim().trim_start_matches('v');
        self.releases
            .iter()
            .find(|release| release.version.trim_start_matches('v') == wanted)
    }

    pub fn stable(&self) -> impl Iterator<Item = &ReleaseDescriptor> {
        self.releases.iter().filter(|release| !release.is_beta())
    }
}
