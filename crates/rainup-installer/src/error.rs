use std::io;
use std::path::PathBuf;

use rainup_archive::ArchiveError;
use rainup_core::Platform;
use thiserror::Error;

use crate::fetch::FetchError;

/// Terminal failure of an install run. Never retried internally.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Transfer(#[from] FetchError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("failed to {action} {}", .path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("release {version} has no build for {platform}")]
    NoPlatformBuild { version: String, platform: Platform },

    #[error("could not start the install worker")]
    Worker(#[source] io::Error),
}

impl InstallError {
    pub(crate) fn filesystem(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    /// The error and its sources joined with `": "`, as shown to the user.
    pub fn fault_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !message.ends_with(&cause_text) {
                message.push_str(": ");
                message.push_str(&cause_text);
            }
            source = cause.source();
        }
        message
    }
}
