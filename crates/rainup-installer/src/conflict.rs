use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, info};

use crate::state::{ProgressChannel, Shared};

/// Decision for a locally modified file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Delete the local copy; the new release's version replaces it.
    Overwrite,
    /// Leave the local copy in place and skip it during extraction.
    KeepLocal,
    /// Abort the whole run without a fault.
    Cancel,
}

/// A file the worker is waiting on a decision for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRequest {
    path: String,
}

impl ConflictRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Path relative to the install directory.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("no conflict is waiting for a decision")]
    NoPendingConflict,
}

pub(crate) struct PendingConflict {
    request: ConflictRequest,
    responder: Sender<ConflictOutcome>,
}

/// Single-slot handshake between the worker, which parks in [`ask`], and the
/// foreground, which answers with [`resolve`].
///
/// [`ask`]: ConflictPrompt::ask
/// [`resolve`]: ConflictPrompt::resolve
#[derive(Clone)]
pub(crate) struct ConflictPrompt {
    channel: ProgressChannel,
}

impl ConflictPrompt {
    pub(crate) fn new(channel: ProgressChannel) -> Self {
        Self { channel }
    }

    /// Publishes a request for `path` and blocks until it is answered. A run
    /// that is already cancelled, or a responder that goes away, answers
    /// [`ConflictOutcome::Cancel`].
    pub(crate) fn ask(&self, path: &str) -> ConflictOutcome {
        let (responder, decision) = crossbeam_channel::bounded(1);
        {
            let mut shared = self.channel.lock();
            if shared.state.cancelled || shared.state.done {
                return ConflictOutcome::Cancel;
            }
            debug_assert!(shared.pending.is_none(), "only one conflict may be outstanding");
            shared.pending = Some(PendingConflict {
                request: ConflictRequest::new(path),
                responder,
            });
            shared.state.message = format!("{path} was modified locally");
        }

        info!("waiting for a decision on locally modified {path}");
        let outcome = decision.recv().unwrap_or(ConflictOutcome::Cancel);
        debug!("conflict on {path} resolved as {outcome:?}");
        outcome
    }

    pub(crate) fn pending(&self) -> Option<ConflictRequest> {
        self.channel
            .lock()
            .pending
            .as_ref()
            .map(|pending| pending.request.clone())
    }

    pub(crate) fn resolve(&self, outcome: ConflictOutcome) -> Result<(), ConflictError> {
        let mut shared = self.channel.lock();
        let pending = shared
            .pending
            .take()
            .ok_or(ConflictError::NoPendingConflict)?;
        let _ = pending.responder.try_send(outcome);
        Ok(())
    }

    /// Answers any outstanding request with `Cancel`. Caller holds the lock.
    pub(crate) fn cancel_pending(shared: &mut Shared) {
        if let Some(pending) = shared.pending.take() {
            let _ = pending.responder.try_send(ConflictOutcome::Cancel);
        }
    }
}
