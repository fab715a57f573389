//! Versioned data migration for Waymark.
//!
//! This module upgrades a persisted record store across releases:
//! - Dotted version ordering and step selection
//! - A closed set of idempotent migration steps
//! - Full-store backup and checksummed restore
//! - A progress-reporting state machine
//! - Crash detection via a persisted run journal
//!
//! # Run lifecycle
//!
//! | Phase | Progress | On failure |
//! |-------|----------|------------|
//! | Pre-flight checks | 0.10 - 0.15 | Store untouched |
//! | Backup | 0.20 | Store untouched |
//! | Steps (execute + validate) | 0.30 - 0.80 | Restore backup |
//! | Post-migration checks | 0.90 | Restore backup |
//! | Commit marker | 0.95 - 1.0 | Restore backup |
//!
//! # Example
//!
//! ```ignore
//! use waymark_core::migration::{MigrationOrchestrator, OrchestratorConfig};
//!
//! let config = OrchestratorConfig::new(store, settings, blobs, "1.4.0");
//! let mut orchestrator = MigrationOrchestrator::new(config);
//! let progress = orchestrator.subscribe();
//!
//! let result = orchestrator.run();
//! if let Some(error) = result.error() {
//!     eprintln!("migration failed: {}", error);
//! }
//! ```

pub mod backup;
pub mod catalog;
pub mod checks;
pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod state;
pub mod step;
pub mod version;

// Version types
pub use version::{compare_versions, is_greater, Version};

// Error types
pub use error::{MigrationError, MigrationErrorKind, StepError};

// State types
pub use state::{MigrationState, ProgressReporter, ProgressSnapshot};

// Step types
pub use catalog::{default_catalog, StepCatalog, CURRENT_VERSION};
pub use step::{normalize_text, FieldMatch, MigrationStep, StepAction};

// Backup types
pub use backup::{BackupManager, BackupManifest, BlobEntry, BlobStore, FsBlobStore, RestoreSource};

// Check types
pub use checks::{DiskSpaceProbe, FixedSpaceProbe, RelationRule, ResourceRule, SpaceProbe};

// Journal types
pub use journal::{MigrationJournal, MigrationRun, RunKind, RunStatus};

// Orchestrator types
pub use orchestrator::{
    MigrationConfig, MigrationOrchestrator, MigrationResult, OrchestratorConfig, INITIAL_VERSION,
};
