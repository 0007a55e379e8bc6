use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rainup_archive::ArchiveReader;
use rainup_core::ReleaseDescriptor;
use tracing::{debug, error, info, warn};

use crate::compare::contents_match;
use crate::conflict::{ConflictError, ConflictOutcome, ConflictPrompt, ConflictRequest};
use crate::env::UpdaterEnv;
use crate::error::InstallError;
use crate::fetch::{fetch_release_archive, Downloader, FetchOutcome};
use crate::fs_utils::{prune_empty_dirs, remove_path_if_exists};
use crate::layout::CacheLayout;
use crate::policy::ProtectedPathPolicy;
use crate::state::{InstallPhase, InstallSnapshot, ProgressChannel, ProgressPoll, RunOutcome};

/// Everything a run needs besides the releases themselves.
#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub env: UpdaterEnv,
    pub cache: CacheLayout,
    pub policy: ProtectedPathPolicy,
}

impl InstallSettings {
    /// Default cache location and path policy for `env`.
    pub fn new(env: UpdaterEnv) -> Self {
        let cache = CacheLayout::for_install_dir(&env.install_dir);
        Self {
            env,
            cache,
            policy: ProtectedPathPolicy::default(),
        }
    }

    pub fn with_cache(mut self, cache: CacheLayout) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_policy(mut self, policy: ProtectedPathPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// One install or update run, executing on its own worker thread.
///
/// The run starts on construction. The foreground polls it and answers
/// conflicts; it never blocks on the worker except through [`wait`].
/// Dropping the orchestrator cancels the run and joins the worker.
///
/// [`wait`]: InstallOrchestrator::wait
pub struct InstallOrchestrator {
    channel: ProgressChannel,
    prompt: ConflictPrompt,
    worker: Option<JoinHandle<()>>,
}

impl InstallOrchestrator {
    /// Starts installing `new_release` into `settings.env.install_dir`.
    /// `old_release` is `None` for a fresh install.
    pub fn start(
        settings: InstallSettings,
        downloader: Arc<dyn Downloader>,
        old_release: Option<ReleaseDescriptor>,
        new_release: ReleaseDescriptor,
    ) -> Result<Self, InstallError> {
        let channel = ProgressChannel::new();
        let prompt = ConflictPrompt::new(channel.clone());

        let mut policy = settings.policy;
        if let Some(executable) = &settings.env.self_executable {
            policy.protect_executable(&settings.env.install_dir, executable);
        }

        let run = InstallRun {
            env: settings.env,
            cache: settings.cache,
            policy,
            downloader,
            channel: channel.clone(),
            prompt: prompt.clone(),
            old_release,
            new_release,
        };
        let worker = thread::Builder::new()
            .name("rainup-install".to_string())
            .spawn(move || run.execute())
            .map_err(InstallError::Worker)?;

        Ok(Self {
            channel,
            prompt,
            worker: Some(worker),
        })
    }

    pub fn poll_progress(&self) -> ProgressPoll {
        let snapshot = self.channel.snapshot();
        if snapshot.done {
            ProgressPoll::Done
        } else {
            ProgressPoll::Running {
                message: snapshot.message,
                fraction: snapshot.fraction,
            }
        }
    }

    /// The fault message, once the run has finished abnormally.
    pub fn poll_fault(&self) -> Option<String> {
        let snapshot = self.channel.snapshot();
        if snapshot.done {
            snapshot.fault
        } else {
            None
        }
    }

    pub fn poll_conflict(&self) -> Option<ConflictRequest> {
        self.prompt.pending()
    }

    pub fn resolve_conflict(&self, outcome: ConflictOutcome) -> Result<(), ConflictError> {
        self.prompt.resolve(outcome)
    }

    /// Requests cooperative cancellation. A worker parked on a conflict is
    /// released as if the user had answered cancel.
    pub fn cancel(&self) {
        let mut shared = self.channel.lock();
        if shared.state.done {
            return;
        }
        if !shared.state.cancelled {
            info!("cancellation requested");
        }
        shared.state.cancelled = true;
        ConflictPrompt::cancel_pending(&mut shared);
    }

    pub fn snapshot(&self) -> InstallSnapshot {
        self.channel.snapshot()
    }

    /// `None` while the run is still going.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.channel.snapshot().outcome
    }

    /// Blocks until the worker exits and returns the final snapshot.
    pub fn wait(&mut self) -> InstallSnapshot {
        self.join_worker();
        self.channel.snapshot()
    }

    fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.join().is_err() {
            error!("install worker panicked");
            self.channel.finish(
                RunOutcome::Faulted,
                "Update failed.",
                Some("install worker panicked".to_string()),
            );
        }
    }
}

impl Drop for InstallOrchestrator {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel();
            self.join_worker();
        }
    }
}

enum Flow {
    Continue,
    Cancelled,
}

struct InstallRun {
    env: UpdaterEnv,
    cache: CacheLayout,
    policy: ProtectedPathPolicy,
    downloader: Arc<dyn Downloader>,
    channel: ProgressChannel,
    prompt: ConflictPrompt,
    old_release: Option<ReleaseDescriptor>,
    new_release: ReleaseDescriptor,
}

impl InstallRun {
    fn execute(self) {
        info!(
            "installing {} into {} (from {})",
            self.new_release.version,
            self.env.install_dir.display(),
            self.old_release
                .as_ref()
                .map_or("nothing", |release| release.version.as_str())
        );

        match self.run() {
            Ok(Flow::Continue) => {
                info!("installed {}", self.new_release.version);
                self.channel.finish(
                    RunOutcome::Completed,
                    format!("Installed {}.", self.new_release.version),
                    None,
                );
            }
            Ok(Flow::Cancelled) => {
                info!("install of {} cancelled", self.new_release.version);
                self.channel
                    .finish(RunOutcome::Cancelled, "Update cancelled.", None);
            }
            Err(err) => {
                let fault = err.fault_message();
                error!("install of {} failed: {fault}", self.new_release.version);
                self.channel
                    .finish(RunOutcome::Faulted, "Update failed.", Some(fault));
            }
        }
    }

    fn run(&self) -> Result<Flow, InstallError> {
        let platform = self.env.platform;
        if self.new_release.download_for(platform).is_none() {
            return Err(InstallError::NoPlatformBuild {
                version: self.new_release.version.clone(),
                platform,
            });
        }

        let old_archive = match &self.old_release {
            Some(old) if old.download_for(platform).is_none() => {
                warn!(
                    "installed release {} has no {platform} build; skipping the diff",
                    old.version
                );
                None
            }
            Some(old) => match self.fetch(old, InstallPhase::FetchingOld)? {
                Some(path) => Some(path),
                None => return Ok(Flow::Cancelled),
            },
            None => None,
        };

        let Some(new_archive) = self.fetch(&self.new_release, InstallPhase::FetchingNew)? else {
            return Ok(Flow::Cancelled);
        };

        let mut ignore = BTreeSet::new();
        if let Some(old_archive) = old_archive {
            if let Flow::Cancelled = self.remove_old_files(&old_archive, &mut ignore)? {
                return Ok(Flow::Cancelled);
            }
        }

        self.extract(&new_archive, &ignore)
    }

    /// `None` when the download was cancelled.
    fn fetch(
        &self,
        release: &ReleaseDescriptor,
        phase: InstallPhase,
    ) -> Result<Option<PathBuf>, InstallError> {
        if self.channel.is_cancelled() {
            return Ok(None);
        }
        self.channel
            .publish(phase, format!("Downloading {}...", release.version), None);

        let channel = &self.channel;
        let fetched = fetch_release_archive(
            self.downloader.as_ref(),
            &self.cache,
            release,
            self.env.platform,
            &mut |done, total| {
                match total {
                    Some(total) if total > 0 => {
                        channel.set_fraction(Some(done as f32 / total as f32))
                    }
                    _ => channel.set_fraction(None),
                }
                !channel.is_cancelled()
            },
        );
        // A transfer that fails after cancellation (e.g. a stalled read
        // timing out) ends the run as cancelled, not faulted.
        let outcome = match fetched {
            Ok(outcome) => outcome,
            Err(err) if self.channel.is_cancelled() => {
                info!(
                    "download of {} stopped after cancellation: {}",
                    release.version,
                    err.fault_message()
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        match outcome {
            FetchOutcome::CacheHit(path) => {
                info!("using cached archive {}", path.display());
                Ok(Some(path))
            }
            FetchOutcome::Downloaded(path) => Ok(Some(path)),
            FetchOutcome::Aborted => Ok(None),
        }
    }

    /// Deletes files the old release installed, asking about any the user
    /// modified, then prunes directories left empty.
    fn remove_old_files(
        &self,
        old_archive: &Path,
        ignore: &mut BTreeSet<String>,
    ) -> Result<Flow, InstallError> {
        let install_dir = self.env.install_dir.as_path();
        self.channel.publish(
            InstallPhase::Diffing,
            "Checking installed files...",
            Some(0.0),
        );

        let mut reader = ArchiveReader::open(old_archive)?;
        let total = reader.files().len();
        let mut processed = 0;
        let mut touched_dirs = BTreeSet::new();
        let mut cancelled = false;

        reader.for_each_entry(|entry, archived| -> Result<_, InstallError> {
            if self.channel.is_cancelled() {
                cancelled = true;
                return Ok(ControlFlow::Break(()));
            }
            processed += 1;
            self.channel.set_counted_progress(processed, total);

            let path = entry.path();
            if self.policy.is_protected(path) {
                debug!("{path} is protected; leaving it");
                return Ok(ControlFlow::Continue(()));
            }

            let live = entry.destination(install_dir);
            let regular = match fs::symlink_metadata(&live) {
                Ok(metadata) => metadata.is_file(),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Ok(ControlFlow::Continue(()));
                }
                Err(err) => return Err(InstallError::filesystem("inspect", &live, err)),
            };

            // A link or directory where the release put a file is a local
            // change, even under an unchecked prefix.
            let modified = if !regular {
                debug!("{path} was replaced by a link or directory");
                true
            } else if self.policy.skips_diff(path) {
                debug!("{path} is not diffed");
                false
            } else {
                !self.matches_archive(&live, archived)?
            };

            if modified {
                match self.prompt.ask(path) {
                    ConflictOutcome::Overwrite => debug!("overwriting local changes to {path}"),
                    ConflictOutcome::KeepLocal => {
                        ignore.insert(path.to_string());
                        self.channel.keep_local(path);
                        return Ok(ControlFlow::Continue(()));
                    }
                    ConflictOutcome::Cancel => {
                        cancelled = true;
                        return Ok(ControlFlow::Break(()));
                    }
                }
                self.channel.set_message("Checking installed files...");
            }

            remove_path_if_exists(&live)
                .map_err(|source| InstallError::filesystem("delete", &live, source))?;
            debug!("removed {path}");
            if let Some(parent) = live.parent() {
                touched_dirs.insert(parent.to_path_buf());
            }
            Ok(ControlFlow::Continue(()))
        })?;
        drop(reader);

        if cancelled {
            return Ok(Flow::Cancelled);
        }

        self.channel.publish(
            InstallPhase::Pruning,
            "Removing empty directories...",
            None,
        );
        prune_empty_dirs(install_dir, &touched_dirs)
            .map_err(|source| InstallError::filesystem("prune", install_dir, source))?;
        Ok(Flow::Continue)
    }

    fn matches_archive(
        &self,
        live: &Path,
        archived: &mut dyn std::io::Read,
    ) -> Result<bool, InstallError> {
        let file =
            File::open(live).map_err(|source| InstallError::filesystem("read", live, source))?;
        contents_match(&mut BufReader::new(file), archived)
            .map_err(|source| InstallError::filesystem("compare", live, source))
    }

    fn extract(&self, new_archive: &Path, ignore: &BTreeSet<String>) -> Result<Flow, InstallError> {
        let install_dir = self.env.install_dir.as_path();
        self.channel.publish(
            InstallPhase::Extracting,
            format!("Installing {}...", self.new_release.version),
            Some(0.0),
        );
        fs::create_dir_all(install_dir)
            .map_err(|source| InstallError::filesystem("create", install_dir, source))?;

        let mut reader = ArchiveReader::open(new_archive)?;
        let total = reader.files().len();
        let mut processed = 0;
        let mut cancelled = false;

        reader.for_each_entry(|entry, data| -> Result<_, InstallError> {
            if self.channel.is_cancelled() {
                cancelled = true;
                return Ok(ControlFlow::Break(()));
            }
            processed += 1;
            self.channel.set_counted_progress(processed, total);

            let path = entry.path();
            if ignore.contains(path) {
                debug!("keeping local {path}");
                return Ok(ControlFlow::Continue(()));
            }
            if self.policy.is_protected(path)
                && fs::symlink_metadata(entry.destination(install_dir)).is_ok()
            {
                debug!("{path} is protected; not overwriting");
                return Ok(ControlFlow::Continue(()));
            }

            ArchiveReader::write_entry(install_dir, entry, data)?;
            Ok(ControlFlow::Continue(()))
        })?;

        if cancelled {
            warn!("extraction cancelled; {} is partially updated", install_dir.display());
            return Ok(Flow::Cancelled);
        }
        Ok(Flow::Continue)
    }
}
