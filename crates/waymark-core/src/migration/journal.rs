//! Persistent journal of migration runs.
//!
//! Each mutating run is recorded in the settings database before the first
//! backup is taken and updated when it ends. A run still marked `Running` at
//! the next launch was interrupted mid-flight.

use super::error::MigrationError;
use crate::error::Error;
use crate::storage::key::{current_timestamp, generate_id};
use rkyv::{Archive, Deserialize, Serialize};

/// What a run was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum RunKind {
    /// Forward migration to a target version.
    Migrate,
    /// Manual reversal of reversible steps.
    Rollback,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKind::Migrate => write!(f, "migrate"),
            RunKind::Rollback => write!(f, "rollback"),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum RunStatus {
    /// Started and not yet finished (or interrupted).
    Running,
    /// Finished and committed.
    Completed,
    /// Failed; the store was restored from the backup.
    Failed,
    /// Failed and the restore failed too.
    RollbackFailed,
    /// A failed or interrupted run whose backup was later restored.
    Recovered,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::RollbackFailed => write!(f, "rollback_failed"),
            RunStatus::Recovered => write!(f, "recovered"),
        }
    }
}

/// One journaled run.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Unique, time-ordered run ID.
    pub run_id: [u8; 16],
    /// What the run did.
    pub kind: RunKind,
    /// Version the store was at.
    pub from_version: String,
    /// Version the run was heading to.
    pub to_version: String,
    /// Current status.
    pub status: RunStatus,
    /// When the run started (microseconds since epoch).
    pub started_at: u64,
    /// When the run finished (microseconds since epoch).
    pub finished_at: Option<u64>,
    /// Error message if the run failed.
    pub error: Option<String>,
    /// Name of the backup blob taken for this run.
    pub backup_blob: Option<String>,
    /// Descriptions of the steps that executed.
    pub steps_executed: Vec<String>,
}

impl MigrationRun {
    /// Start a new run.
    pub fn start(kind: RunKind, from_version: impl Into<String>, to_version: impl Into<String>) -> Self {
        Self {
            run_id: generate_id(),
            kind,
            from_version: from_version.into(),
            to_version: to_version.into(),
            status: RunStatus::Running,
            started_at: current_timestamp(),
            finished_at: None,
            error: None,
            backup_blob: None,
            steps_executed: Vec::new(),
        }
    }

    /// Mark the run as committed.
    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.finished_at = Some(current_timestamp());
    }

    /// Mark the run as failed with the given terminal error.
    pub fn fail(&mut self, error: &MigrationError) {
        self.status = if error.is_fatal() {
            RunStatus::RollbackFailed
        } else {
            RunStatus::Failed
        };
        self.finished_at = Some(current_timestamp());
        self.error = Some(error.to_string());
    }

    /// Mark the run as recovered from its backup.
    pub fn recover(&mut self) {
        self.status = RunStatus::Recovered;
        if self.finished_at.is_none() {
            self.finished_at = Some(current_timestamp());
        }
    }

    /// Check if the run has finished.
    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }

    /// Whether the store may not match any committed version.
    pub fn needs_recovery(&self) -> bool {
        matches!(self.status, RunStatus::Running | RunStatus::RollbackFailed)
    }

    /// Serialize the run to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a run from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Journal store for runs.
pub struct MigrationJournal {
    tree: sled::Tree,
}

impl MigrationJournal {
    /// Tree name for the journal.
    pub const TREE_NAME: &'static str = "migration:journal";

    /// Open or create the journal.
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Save a run and flush it.
    pub fn save(&self, run: &MigrationRun) -> Result<(), Error> {
        self.tree.insert(run.run_id, run.to_bytes()?)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Load a run.
    pub fn load(&self, run_id: &[u8; 16]) -> Result<Option<MigrationRun>, Error> {
        match self.tree.get(run_id)? {
            Some(bytes) => Ok(Some(MigrationRun::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All runs, oldest first.
    pub fn list(&self) -> Result<Vec<MigrationRun>, Error> {
        let mut runs = Vec::new();
        for result in self.tree.iter() {
            let (_, value) = result?;
            runs.push(MigrationRun::from_bytes(&value)?);
        }
        Ok(runs)
    }

    /// The most recent run.
    pub fn latest(&self) -> Result<Option<MigrationRun>, Error> {
        match self.tree.last()? {
            Some((_, value)) => Ok(Some(MigrationRun::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    /// Runs that left the store in an unknown state.
    pub fn pending_recovery(&self) -> Result<Vec<MigrationRun>, Error> {
        Ok(self
            .list()?
            .into_iter()
            .filter(MigrationRun::needs_recovery)
            .collect())
    }

    /// Mark every run needing recovery as recovered. Returns how many changed.
    pub fn mark_recovered(&self) -> Result<usize, Error> {
        let pending = self.pending_recovery()?;
        for mut run in pending.iter().cloned() {
            run.recover();
            self.save(&run)?;
        }
        Ok(pending.len())
    }
}
