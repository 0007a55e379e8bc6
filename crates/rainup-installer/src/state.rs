use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::conflict::PendingConflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Starting,
    FetchingOld,
    FetchingNew,
    Diffing,
    Pruning,
    Extracting,
    Finished,
}

impl InstallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::FetchingOld => "fetch-old",
            Self::FetchingNew => "fetch-new",
            Self::Diffing => "diff",
            Self::Pruning => "prune",
            Self::Extracting => "extract",
            Self::Finished => "finished",
        }
    }
}

/// How a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Faulted,
}

/// Owned copy of the install state at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallSnapshot {
    pub phase: InstallPhase,
    pub message: String,
    /// Progress in `[0, 1]`; `None` while the current step is indeterminate.
    pub fraction: Option<f32>,
    pub cancelled: bool,
    pub done: bool,
    pub outcome: Option<RunOutcome>,
    pub fault: Option<String>,
    /// Paths the user chose to keep; extraction skips them.
    pub kept_local: Vec<String>,
}

impl InstallSnapshot {
    fn initial() -> Self {
        Self {
            phase: InstallPhase::Starting,
            message: "Preparing update...".to_string(),
            fraction: None,
            cancelled: false,
            done: false,
            outcome: None,
            fault: None,
            kept_local: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressPoll {
    Running {
        message: String,
        fraction: Option<f32>,
    },
    Done,
}

/// Everything shared between the worker and the foreground.
pub(crate) struct Shared {
    pub(crate) state: InstallSnapshot,
    pub(crate) pending: Option<PendingConflict>,
}

/// Mutex-guarded install state. The worker publishes through it; the
/// foreground only ever takes snapshots.
#[derive(Clone)]
pub(crate) struct ProgressChannel {
    shared: Arc<Mutex<Shared>>,
}

impl ProgressChannel {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: InstallSnapshot::initial(),
                pending: None,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock()
    }

    pub(crate) fn publish(&self, phase: InstallPhase, message: impl Into<String>, fraction: Option<f32>) {
        let mut shared = self.lock();
        if shared.state.done {
            return;
        }
        shared.state.phase = phase;
        shared.state.message = message.into();
        shared.state.fraction = fraction;
        debug!("[{}] {}", phase.as_str(), shared.state.message);
    }

    pub(crate) fn set_message(&self, message: impl Into<String>) {
        let mut shared = self.lock();
        if !shared.state.done {
            shared.state.message = message.into();
        }
    }

    pub(crate) fn set_fraction(&self, fraction: Option<f32>) {
        let mut shared = self.lock();
        if !shared.state.done {
            shared.state.fraction = fraction.map(|value| value.clamp(0.0, 1.0));
        }
    }

    pub(crate) fn set_counted_progress(&self, processed: usize, total: usize) {
        let fraction = if total == 0 {
            1.0
        } else {
            processed as f32 / total as f32
        };
        self.set_fraction(Some(fraction));
    }

    pub(crate) fn keep_local(&self, path: &str) {
        let mut shared = self.lock();
        if !shared.state.done {
            shared.state.kept_local.push(path.to_string());
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock().state.cancelled
    }

    /// Marks the run terminal. Later writes are ignored.
    pub(crate) fn finish(&self, outcome: RunOutcome, message: impl Into<String>, fault: Option<String>) {
        let mut shared = self.lock();
        if shared.state.done {
            return;
        }
        shared.state.phase = InstallPhase::Finished;
        shared.state.message = message.into();
        shared.state.fraction = match outcome {
            RunOutcome::Completed => Some(1.0),
            RunOutcome::Cancelled | RunOutcome::Faulted => None,
        };
        shared.state.outcome = Some(outcome);
        shared.state.fault = fault;
        shared.state.done = true;
        shared.pending = None;
    }

    pub(crate) fn snapshot(&self) -> InstallSnapshot {
        self.lock().state.clone()
    }
}
