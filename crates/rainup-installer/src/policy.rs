use std::collections::BTreeSet;
use std::path::Path;

pub const DEFAULT_PROTECTED_FILES: &[&str] = &["config/preferences.json", "imgui.ini"];
pub const DEFAULT_UNCHECKED_PREFIXES: &[&str] = &["assets/", "data/"];

/// Decides which installed files an update may inspect, delete or overwrite.
///
/// Protected paths are never deleted, overwritten or diffed. Paths under an
/// unchecked prefix are deleted and replaced like any other file but are
/// never compared byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPathPolicy {
    protected: BTreeSet<String>,
    unchecked_prefixes: Vec<String>,
}

impl Default for ProtectedPathPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROTECTED_FILES.iter().copied(),
            DEFAULT_UNCHECKED_PREFIXES.iter().copied(),
        )
    }
}

impl ProtectedPathPolicy {
    pub fn new<P, U>(protected: P, unchecked_prefixes: U) -> Self
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        U: IntoIterator,
        U::Item: AsRef<str>,
    {
        Self {
            protected: protected
                .into_iter()
                .map(|path| normalize(path.as_ref()))
                .filter(|path| !path.is_empty())
                .collect(),
            unchecked_prefixes: unchecked_prefixes
                .into_iter()
                .map(|prefix| prefix.as_ref().replace('\\', "/"))
                .filter(|prefix| !prefix.is_empty())
                .collect(),
        }
    }

    /// Protects the running updater binary when it lives inside `install_dir`.
    pub fn protect_executable(&mut self, install_dir: &Path, executable: &Path) {
        let Ok(relative) = executable.strip_prefix(install_dir) else {
            return;
        };
        let relative = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !relative.is_empty() {
            self.protected.insert(relative);
        }
    }

    pub fn is_protected(&self, entry_path: &str) -> bool {
        self.protected.contains(entry_path)
    }

    pub fn skips_diff(&self, entry_path: &str) -> bool {
        self.unchecked_prefixes
            .iter()
            .any(|prefix| entry_path.starts_with(prefix.as_str()))
    }

    pub fn protected_paths(&self) -> impl Iterator<Item = &str> {
        self.protected.iter().map(String::as_str)
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}
