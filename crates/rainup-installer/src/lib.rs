//! Install and update runs for a self-updating application.
//!
//! An [`InstallOrchestrator`] fetches the installed and the target release
//! archives, removes files the installed release left behind (asking before
//! touching any the user modified), and extracts the target release in place.
//! The run executes on a background thread; the caller polls snapshots and
//! answers conflicts.

mod compare;
mod conflict;
mod env;
mod error;
mod fetch;
mod fs_utils;
mod layout;
mod orchestrator;
mod policy;
mod state;

pub use compare::contents_match;
pub use conflict::{ConflictError, ConflictOutcome, ConflictRequest};
pub use env::UpdaterEnv;
pub use error::InstallError;
pub use fetch::{
    fetch_release_archive, Downloader, FetchError, FetchOutcome, FetchStatus, HttpDownloader,
};
pub use fs_utils::{prune_empty_dirs, remove_file_if_exists, remove_path_if_exists};
pub use layout::CacheLayout;
pub use orchestrator::{InstallOrchestrator, InstallSettings};
pub use policy::{ProtectedPathPolicy, DEFAULT_PROTECTED_FILES, DEFAULT_UNCHECKED_PREFIXES};
pub use state::{InstallPhase, InstallSnapshot, ProgressPoll, RunOutcome};

#[cfg(test)]
mod tests;
