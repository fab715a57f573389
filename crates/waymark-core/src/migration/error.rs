//! Migration-specific error types.

use thiserror::Error;

/// The kinds of failure a migration run can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationErrorKind {
    /// The pre-migration backup could not be written.
    BackupFailed,
    /// A step failed while executing.
    MigrationStepFailed,
    /// Restoring the backup failed; the store is indeterminate.
    RollbackFailed,
    /// Data failed an integrity or validation check.
    DataCorruption,
    /// Not enough storage (or no usable backup location) to run safely.
    InsufficientStorage,
}

impl std::fmt::Display for MigrationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationErrorKind::BackupFailed => write!(f, "backup_failed"),
            MigrationErrorKind::MigrationStepFailed => write!(f, "migration_step_failed"),
            MigrationErrorKind::RollbackFailed => write!(f, "rollback_failed"),
            MigrationErrorKind::DataCorruption => write!(f, "data_corruption"),
            MigrationErrorKind::InsufficientStorage => write!(f, "insufficient_storage"),
        }
    }
}

/// Migration failures as seen by callers.
///
/// Every internal error is normalized into one of these before it leaves the
/// engine. Causes are carried as text so the error can travel inside
/// [`MigrationState`](super::MigrationState) snapshots.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    /// Backup creation failed; nothing was mutated.
    #[error("backup failed: {reason}")]
    BackupFailed {
        /// Why the backup could not be written.
        reason: String,
    },

    /// A migration step raised an error.
    #[error("migration step '{step}' failed: {cause}")]
    MigrationStepFailed {
        /// Description of the failed step.
        step: String,
        /// Underlying cause.
        cause: String,
    },

    /// Restore failed. Manual intervention is required.
    #[error("rollback failed: {reason}")]
    RollbackFailed {
        /// Why the restore failed.
        reason: String,
    },

    /// A validation or integrity check failed.
    #[error("data corruption detected: {reason}")]
    DataCorruption {
        /// What was found.
        reason: String,
    },

    /// Pre-flight storage or permission check failed.
    #[error("insufficient storage: {reason}")]
    InsufficientStorage {
        /// What was missing.
        reason: String,
    },
}

impl MigrationError {
    /// The failure kind.
    pub fn kind(&self) -> MigrationErrorKind {
        match self {
            MigrationError::BackupFailed { .. } => MigrationErrorKind::BackupFailed,
            MigrationError::MigrationStepFailed { .. } => MigrationErrorKind::MigrationStepFailed,
            MigrationError::RollbackFailed { .. } => MigrationErrorKind::RollbackFailed,
            MigrationError::DataCorruption { .. } => MigrationErrorKind::DataCorruption,
            MigrationError::InsufficientStorage { .. } => MigrationErrorKind::InsufficientStorage,
        }
    }

    /// Shorthand for a backup failure.
    pub fn backup_failed(reason: impl ToString) -> Self {
        MigrationError::BackupFailed {
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a rollback failure.
    pub fn rollback_failed(reason: impl ToString) -> Self {
        MigrationError::RollbackFailed {
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a corruption finding.
    pub fn data_corruption(reason: impl ToString) -> Self {
        MigrationError::DataCorruption {
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a failed step.
    pub fn step_failed(step: impl Into<String>, cause: impl ToString) -> Self {
        MigrationError::MigrationStepFailed {
            step: step.into(),
            cause: cause.to_string(),
        }
    }

    /// Whether the store may be left in an indeterminate state.
    pub fn is_fatal(&self) -> bool {
        self.kind() == MigrationErrorKind::RollbackFailed
    }
}

/// Errors raised by an individual step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The record store failed.
    #[error("store error: {0}")]
    Store(#[from] crate::error::Error),

    /// Rollback was requested on a one-way step.
    #[error("step '{step}' is not reversible")]
    NotReversible {
        /// Description of the step.
        step: String,
    },

    /// A record had a shape the step cannot work with.
    #[error("invalid record {kind}/{id}: {reason}")]
    InvalidRecord {
        /// Record kind.
        kind: String,
        /// Record id.
        id: String,
        /// What was wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            MigrationError::backup_failed("disk full").kind(),
            MigrationErrorKind::BackupFailed
        );
        assert_eq!(
            MigrationError::step_failed("Backfill", "boom").kind(),
            MigrationErrorKind::MigrationStepFailed
        );
        assert!(MigrationError::rollback_failed("no backup").is_fatal());
        assert!(!MigrationError::data_corruption("missing field").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = MigrationError::step_failed("Default challenge streaks", "io error");
        assert_eq!(
            err.to_string(),
            "migration step 'Default challenge streaks' failed: io error"
        );
        assert_eq!(MigrationErrorKind::RollbackFailed.to_string(), "rollback_failed");
    }

    #[test]
    fn test_step_error_display() {
        let err = StepError::NotReversible {
            step: "Compute analytics".to_string(),
        };
        assert!(err.to_string().contains("not reversible"));
    }
}
