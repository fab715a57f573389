//! Waymark Core - record storage and versioned data migration.
//!
//! This crate provides the storage boundary, the version marker store and the
//! migration engine that upgrades a store across releases.

pub mod error;
pub mod migration;
pub mod settings;
pub mod storage;

pub use error::Error;
pub use migration::{
    BackupManager, BackupManifest, MigrationConfig, MigrationError, MigrationErrorKind,
    MigrationOrchestrator, MigrationResult, MigrationState, OrchestratorConfig, ProgressSnapshot,
    Version,
};
pub use settings::{SettingsStore, VersionRecord};
pub use storage::{Record, RecordStore, StorageConfig, StorageEngine};
