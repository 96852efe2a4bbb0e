//! Status reconciliation.
//!
//! The worker reports `uploading`, the digest backlog and file counts as
//! separate signals in no fixed order. Each one updates a single field of
//! [`ReconcilerSnapshot`]; the operational state is recomputed from the
//! whole snapshot after every update.

use serde::Serialize;
use std::fmt;

/// The reconciler's working memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerSnapshot {
    pub uploading: bool,
    pub digest_remaining: u32,
    pub files_done: u32,
    pub files_in_flight: u32,
    pub files_total: u32,
}

impl ReconcilerSnapshot {
    /// All queued files are uploaded and nothing is left to digest.
    /// Never true before any work was queued.
    pub fn is_finished(&self) -> bool {
        self.files_done == self.files_total && self.digest_remaining == 0 && self.files_total > 0
    }

    /// Files not yet uploaded plus blobs not yet digested
    pub fn remaining(&self) -> u64 {
        u64::from(self.files_total.saturating_sub(self.files_done))
            + u64::from(self.digest_remaining)
    }
}

/// UI-facing operational state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalState {
    #[default]
    Idle,
    Digesting,
    Uploading,
    Paused,
    Finished,
}

impl OperationalState {
    /// Status line shown next to the controls
    pub fn label(&self) -> &'static str {
        match self {
            OperationalState::Idle => "Idle.",
            OperationalState::Digesting => "Digesting...",
            OperationalState::Uploading => "Uploading...",
            OperationalState::Paused => "Paused.",
            OperationalState::Finished => "Finished.",
        }
    }

    /// Whether the worker is making progress right now
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            OperationalState::Digesting | OperationalState::Uploading
        )
    }
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the single pause/resume control does in a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleAction {
    Pause,
    Resume,
    Disabled,
}

impl ToggleAction {
    pub fn for_state(state: OperationalState) -> Self {
        match state {
            OperationalState::Uploading | OperationalState::Digesting => ToggleAction::Pause,
            OperationalState::Paused | OperationalState::Idle => ToggleAction::Resume,
            OperationalState::Finished => ToggleAction::Disabled,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ToggleAction::Pause => "Pause",
            ToggleAction::Resume => "Resume",
            ToggleAction::Disabled => "Pause/Resume",
        }
    }
}

/// Pure mapping from snapshot to state.
///
/// `Finished` wins over everything; otherwise active uploading wins over a
/// digest backlog, and a digest backlog counts as working rather than
/// paused.
pub fn reconcile(snapshot: &ReconcilerSnapshot) -> OperationalState {
    if snapshot.is_finished() {
        OperationalState::Finished
    } else if snapshot.uploading {
        OperationalState::Uploading
    } else if snapshot.digest_remaining > 0 {
        OperationalState::Digesting
    } else if snapshot.remaining() > 0 {
        OperationalState::Paused
    } else {
        OperationalState::Idle
    }
}

/// Cumulative snapshot plus the state derived from it
#[derive(Debug, Default)]
pub struct StatusReconciler {
    snapshot: ReconcilerSnapshot,
    state: OperationalState,
    /// The worker has said whether it is uploading this session
    status_known: bool,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_uploading(&mut self, uploading: bool) -> OperationalState {
        self.snapshot.uploading = uploading;
        self.status_known = true;
        self.recompute()
    }

    pub fn set_digest_remaining(&mut self, remaining: u32) -> OperationalState {
        self.snapshot.digest_remaining = remaining;
        self.recompute()
    }

    pub fn set_file_status(&mut self, done: u32, in_flight: u32, total: u32) -> OperationalState {
        self.snapshot.files_done = done.min(total);
        self.snapshot.files_in_flight = in_flight;
        self.snapshot.files_total = total;
        self.recompute()
    }

    pub fn snapshot(&self) -> ReconcilerSnapshot {
        self.snapshot
    }

    pub fn state(&self) -> OperationalState {
        self.state
    }

    /// The pause/resume control is usable exactly when not finished.
    pub fn control_enabled(&self) -> bool {
        !self.snapshot.is_finished()
    }

    pub fn status_known(&self) -> bool {
        self.status_known
    }

    /// `Disabled` until the worker reports its uploading flag: before that
    /// an `Idle` state says nothing about what the worker is doing.
    pub fn toggle_action(&self) -> ToggleAction {
        if !self.status_known {
            return ToggleAction::Disabled;
        }
        ToggleAction::for_state(self.state)
    }

    /// Forget everything learned from the previous worker session.
    pub fn reset(&mut self) {
        self.snapshot = ReconcilerSnapshot::default();
        self.state = reconcile(&self.snapshot);
        self.status_known = false;
    }

    fn recompute(&mut self) -> OperationalState {
        self.state = reconcile(&self.snapshot);
        self.state
    }
}
