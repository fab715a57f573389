//! Migration run state machine and progress reporting.
//!
//! A run moves `Idle → InProgress(step) → {Completed | Failed(error)}`.
//! Snapshots are published on a [`tokio::sync::watch`] channel so a UI or
//! CLI can follow along from another thread or task.

use super::error::MigrationError;
use parking_lot::Mutex;
use tokio::sync::watch;

/// State of a migration run.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MigrationState {
    /// Nothing has happened yet.
    #[default]
    Idle,
    /// Work in progress, with a description of the current activity.
    InProgress(String),
    /// The run finished and the store is at the target version.
    Completed,
    /// The run failed.
    Failed(MigrationError),
}

impl MigrationState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Completed | MigrationState::Failed(_))
    }

    /// Check whether moving to `next` is a legal transition.
    ///
    /// `Idle` may go anywhere, `InProgress` may move on to another activity or
    /// a terminal state, and terminal states are final.
    pub fn can_transition_to(&self, next: &MigrationState) -> bool {
        match (self, next) {
            (MigrationState::Idle, MigrationState::Idle) => false,
            (MigrationState::Idle, _) => true,
            (MigrationState::InProgress(_), MigrationState::Idle) => false,
            (MigrationState::InProgress(_), _) => true,
            (MigrationState::Completed | MigrationState::Failed(_), _) => false,
        }
    }

    /// The failure, if the run failed.
    pub fn error(&self) -> Option<&MigrationError> {
        match self {
            MigrationState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Idle => write!(f, "idle"),
            MigrationState::InProgress(step) => write!(f, "in_progress: {}", step),
            MigrationState::Completed => write!(f, "completed"),
            MigrationState::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// A point-in-time view of a run, as published to observers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressSnapshot {
    /// Current state.
    pub state: MigrationState,
    /// Overall progress in `[0, 1]`.
    pub progress: f32,
    /// Description of the current activity.
    pub current_step: String,
}

/// Publishes state transitions of a single run.
///
/// Owned by the orchestrator for the duration of a run. Every published
/// snapshot is also kept in an in-memory history for the run's result.
pub struct ProgressReporter {
    tx: watch::Sender<ProgressSnapshot>,
    history: Mutex<Vec<ProgressSnapshot>>,
}

impl ProgressReporter {
    /// Create a reporter starting at `Idle`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self {
            tx,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to snapshots. The receiver sees the latest value immediately.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// The latest snapshot.
    pub fn current(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Start a new run: reset to `Idle` and clear the history.
    pub fn reset(&self) {
        self.history.lock().clear();
        self.tx.send_replace(ProgressSnapshot::default());
    }

    /// Move to `InProgress(description)` at the given progress.
    pub fn in_progress(&self, description: &str, progress: f32) {
        self.publish(
            MigrationState::InProgress(description.to_string()),
            progress,
            description,
        );
    }

    /// Move to `Completed`.
    pub fn completed(&self) {
        self.publish(MigrationState::Completed, 1.0, "Migration complete");
    }

    /// Move to `Failed(error)`, keeping the last reported progress.
    pub fn failed(&self, error: MigrationError) {
        let progress = self.tx.borrow().progress;
        let description = error.to_string();
        self.publish(MigrationState::Failed(error), progress, &description);
    }

    /// Snapshots published since the last reset.
    pub fn history(&self) -> Vec<ProgressSnapshot> {
        self.history.lock().clone()
    }

    fn publish(&self, state: MigrationState, progress: f32, description: &str) {
        let current = self.tx.borrow().state.clone();
        if !current.can_transition_to(&state) {
            tracing::error!(from = %current, to = %state, "illegal migration state transition");
            return;
        }

        let snapshot = ProgressSnapshot {
            state,
            progress: progress.clamp(0.0, 1.0),
            current_step: description.to_string(),
        };
        self.history.lock().push(snapshot.clone());
        self.tx.send_replace(snapshot);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let idle = MigrationState::Idle;
        let busy = MigrationState::InProgress("Preparing migration".to_string());
        let done = MigrationState::Completed;
        let failed = MigrationState::Failed(MigrationError::backup_failed("disk"));

        assert!(idle.can_transition_to(&busy));
        assert!(idle.can_transition_to(&done));
        assert!(busy.can_transition_to(&busy));
        assert!(busy.can_transition_to(&done));
        assert!(busy.can_transition_to(&failed));
        assert!(!busy.can_transition_to(&idle));
        assert!(!done.can_transition_to(&busy));
        assert!(!failed.can_transition_to(&busy));
        assert!(!failed.can_transition_to(&done));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!MigrationState::Idle.is_terminal());
        assert!(!MigrationState::InProgress("x".into()).is_terminal());
        assert!(MigrationState::Completed.is_terminal());
        assert!(MigrationState::Failed(MigrationError::data_corruption("x")).is_terminal());
    }

    #[test]
    fn test_reporter_publishes_to_subscribers() {
        let reporter = ProgressReporter::new();
        let rx = reporter.subscribe();

        reporter.in_progress("Creating backup", 0.2);
        assert_eq!(
            rx.borrow().state,
            MigrationState::InProgress("Creating backup".to_string())
        );
        assert_eq!(rx.borrow().progress, 0.2);

        reporter.completed();
        assert_eq!(rx.borrow().state, MigrationState::Completed);
        assert_eq!(rx.borrow().progress, 1.0);
        assert_eq!(reporter.history().len(), 2);
    }

    #[test]
    fn test_failed_keeps_progress() {
        let reporter = ProgressReporter::new();
        reporter.in_progress("Step 2", 0.55);
        reporter.failed(MigrationError::data_corruption("bad"));

        let current = reporter.current();
        assert_eq!(current.progress, 0.55);
        assert!(matches!(current.state, MigrationState::Failed(_)));
    }

    #[test]
    fn test_reset_clears_history() {
        let reporter = ProgressReporter::new();
        reporter.completed();
        reporter.reset();

        assert!(reporter.history().is_empty());
        assert_eq!(reporter.current().state, MigrationState::Idle);
    }
}
