use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rainup_installer::{
    CacheLayout, ProtectedPathPolicy, DEFAULT_PROTECTED_FILES, DEFAULT_UNCHECKED_PREFIXES,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "rainup.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdaterConfig {
    /// Relative paths resolve against the install directory.
    pub cache_dir: Option<PathBuf>,
    pub protected_files: Vec<String>,
    pub unchecked_prefixes: Vec<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            protected_files: DEFAULT_PROTECTED_FILES
                .iter()
                .map(|path| path.to_string())
                .collect(),
            unchecked_prefixes: DEFAULT_UNCHECKED_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
        }
    }
}

impl UpdaterConfig {
    /// Reads `explicit` when given (it must exist), otherwise the default
    /// config file if present, otherwise built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::read(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::read(&path),
            _ => Ok(Self::default()),
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn cache_layout(&self, install_dir: &Path) -> CacheLayout {
        match &self.cache_dir {
            Some(dir) if dir.is_absolute() => CacheLayout::new(dir),
            Some(dir) => CacheLayout::new(install_dir.join(dir)),
            None => CacheLayout::for_install_dir(install_dir),
        }
    }

    pub fn policy(&self) -> ProtectedPathPolicy {
        ProtectedPathPolicy::new(&self.protected_files, &self.unchecked_prefixes)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}
