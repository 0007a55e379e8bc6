use std::path::PathBuf;

use rainup_core::Platform;

/// Runtime facts about the updater, captured once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterEnv {
    pub install_dir: PathBuf,
    /// The running updater binary, protected when it sits inside `install_dir`.
    pub self_executable: Option<PathBuf>,
    pub platform: Platform,
}

impl UpdaterEnv {
    pub fn new(install_dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            install_dir: install_dir.into(),
            self_executable: None,
            platform,
        }
    }

    pub fn with_self_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.self_executable = Some(executable.into());
        self
    }
}
