//! Migration orchestrator - drives a run from the version marker to the target.
//!
//! A run reads the marker, runs pre-flight checks, takes a backup, applies the
//! applicable steps in version order (validating each), runs post-migration
//! checks and only then commits the new marker. Any failure after the backup
//! restores it.

use super::backup::{BackupManager, BackupManifest, BlobStore, RestoreSource};
use super::catalog::{default_catalog, StepCatalog};
use super::checks::{
    check_headroom, cleanup_orphans, dangling_references, integrity_scan, spot_check,
    DiskSpaceProbe, RelationRule, ResourceRule, SpaceProbe,
};
use super::error::MigrationError;
use super::journal::{MigrationJournal, MigrationRun, RunKind, RunStatus};
use super::state::{MigrationState, ProgressReporter, ProgressSnapshot};
use super::step::MigrationStep;
use super::version::{compare_versions, is_greater, Version};
use crate::error::Error;
use crate::settings::VersionRecord;
use crate::storage::RecordStore;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::watch;

/// Version assumed for a store that has never been migrated.
pub const INITIAL_VERSION: &str = "0.0.0";

/// Policy knobs for a run.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Treat dangling references as corruption instead of warnings.
    pub strict_relationships: bool,
    /// Report the plan without checking, backing up or mutating anything.
    pub dry_run: bool,
    /// Minimum free space required for a backup, in bytes.
    pub min_free_bytes: u64,
    /// Free space required as a multiple of the store's size on disk.
    pub headroom_factor: f64,
    /// Records per kind inspected by the pre-flight spot check.
    pub spot_check_sample: usize,
    /// References checked after migrating.
    pub relations: Vec<RelationRule>,
    /// Resource files cleaned up after migrating.
    pub resources: Option<ResourceRule>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            strict_relationships: false,
            dry_run: false,
            min_free_bytes: 16 * 1024 * 1024,
            headroom_factor: 2.0,
            spot_check_sample: 32,
            relations: Vec::new(),
            resources: None,
        }
    }
}

impl MigrationConfig {
    /// Fail the run on dangling references.
    pub fn with_strict_relationships(mut self, strict: bool) -> Self {
        self.strict_relationships = strict;
        self
    }

    /// Only compute the plan.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the free-space floor.
    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    /// Set the headroom multiple.
    pub fn with_headroom_factor(mut self, factor: f64) -> Self {
        self.headroom_factor = factor;
        self
    }

    /// Set the spot-check sample size.
    pub fn with_spot_check_sample(mut self, sample: usize) -> Self {
        self.spot_check_sample = sample;
        self
    }

    /// Add a relationship rule.
    pub fn with_relation(mut self, rule: RelationRule) -> Self {
        self.relations.push(rule);
        self
    }

    /// Set the resource cleanup rule.
    pub fn with_resources(mut self, rule: ResourceRule) -> Self {
        self.resources = Some(rule);
        self
    }
}

/// Everything an orchestrator is built from.
pub struct OrchestratorConfig {
    /// The host's record store.
    pub store: Arc<dyn RecordStore>,
    /// Where the version marker lives.
    pub versions: Arc<dyn VersionRecord>,
    /// Where backups are written.
    pub blobs: Arc<dyn BlobStore>,
    /// Free-space source for the headroom check.
    pub space: Arc<dyn SpaceProbe>,
    /// Run journal, if runs should be recorded.
    pub journal: Option<MigrationJournal>,
    /// Steps known to this release.
    pub catalog: StepCatalog,
    /// Version to migrate to.
    pub target_version: String,
    /// Run policy.
    pub migration: MigrationConfig,
}

impl OrchestratorConfig {
    /// Build a config with the shipped catalog and a disk-backed space probe
    /// on the backup location.
    pub fn new(
        store: Arc<dyn RecordStore>,
        versions: Arc<dyn VersionRecord>,
        blobs: Arc<dyn BlobStore>,
        target_version: impl Into<String>,
    ) -> Self {
        let space: Arc<dyn SpaceProbe> = Arc::new(DiskSpaceProbe::new(blobs.location("")));
        Self {
            store,
            versions,
            blobs,
            space,
            journal: None,
            catalog: default_catalog(),
            target_version: target_version.into(),
            migration: MigrationConfig::default(),
        }
    }

    /// Use a different space probe.
    pub fn with_space_probe(mut self, space: Arc<dyn SpaceProbe>) -> Self {
        self.space = space;
        self
    }

    /// Record runs in a journal.
    pub fn with_journal(mut self, journal: MigrationJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Use a different step catalog.
    pub fn with_catalog(mut self, catalog: StepCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Set the run policy.
    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }
}

/// Outcome of a run, rollback or recovery.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    /// Final state.
    pub state: MigrationState,
    /// Marker value when the run started.
    pub from_version: String,
    /// Version the run was heading to.
    pub to_version: String,
    /// Steps that executed (or were reverted), in order.
    pub steps_executed: Vec<String>,
    /// Steps a dry run would execute, in order.
    pub planned: Vec<String>,
    /// Backup taken (or restored) by the run.
    pub backup: Option<BackupManifest>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
    /// Orphaned resource files deleted.
    pub orphans_removed: usize,
}

impl MigrationResult {
    fn new(from_version: impl Into<String>, to_version: impl Into<String>) -> Self {
        Self {
            state: MigrationState::Idle,
            from_version: from_version.into(),
            to_version: to_version.into(),
            steps_executed: Vec::new(),
            planned: Vec::new(),
            backup: None,
            warnings: Vec::new(),
            orphans_removed: 0,
        }
    }

    /// Whether the run ended `Completed`.
    pub fn is_completed(&self) -> bool {
        self.state == MigrationState::Completed
    }

    /// The failure, if the run failed.
    pub fn error(&self) -> Option<&MigrationError> {
        self.state.error()
    }
}

/// Sequences migration steps around a backup.
///
/// Runs borrow the orchestrator mutably, so only one can be active at a time.
/// All work is blocking; async callers should move the orchestrator onto a
/// blocking task and follow [`subscribe`](Self::subscribe).
pub struct MigrationOrchestrator {
    store: Arc<dyn RecordStore>,
    versions: Arc<dyn VersionRecord>,
    backups: BackupManager,
    space: Arc<dyn SpaceProbe>,
    journal: Option<MigrationJournal>,
    catalog: StepCatalog,
    target: String,
    config: MigrationConfig,
    progress: ProgressReporter,
}

impl MigrationOrchestrator {
    /// Create an orchestrator.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            store: config.store,
            versions: config.versions,
            backups: BackupManager::new(config.blobs),
            space: config.space,
            journal: config.journal,
            catalog: config.catalog,
            target: config.target_version,
            config: config.migration,
            progress: ProgressReporter::new(),
        }
    }

    /// Follow progress snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    /// The latest snapshot.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.current()
    }

    /// The current state.
    pub fn state(&self) -> MigrationState {
        self.progress.current().state
    }

    /// Snapshots published by the latest run.
    pub fn history(&self) -> Vec<ProgressSnapshot> {
        self.progress.history()
    }

    /// Version this orchestrator migrates to.
    pub fn target_version(&self) -> &str {
        &self.target
    }

    /// The step catalog.
    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    /// The backup manager.
    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// The run journal, if one is configured.
    pub fn journal(&self) -> Option<&MigrationJournal> {
        self.journal.as_ref()
    }

    /// The run policy.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Read the version marker, defaulting to [`INITIAL_VERSION`].
    pub fn last_applied(&self) -> Result<String, MigrationError> {
        self.versions
            .last_migration_version()
            .map(|v| v.unwrap_or_else(|| INITIAL_VERSION.to_string()))
            .map_err(|e| MigrationError::data_corruption(format!("reading version marker: {}", e)))
    }

    /// Whether the marker is behind the target.
    pub fn needs_migration(&self) -> Result<bool, MigrationError> {
        Ok(is_greater(&self.target, &self.last_applied()?))
    }

    /// Steps a run would execute, in order.
    pub fn plan(&self) -> Result<Vec<&MigrationStep>, MigrationError> {
        let last = self.last_applied()?;
        Ok(self.catalog.applicable(&last, &self.target))
    }

    /// Migrate the store to the target version.
    pub fn run(&mut self) -> MigrationResult {
        self.progress.reset();
        let mut result = MigrationResult::new(INITIAL_VERSION, self.target.clone());

        let last = match self.last_applied() {
            Ok(last) => last,
            Err(e) => return self.fail(result, e),
        };
        result.from_version = last.clone();

        match compare_versions(&last, &self.target) {
            Ordering::Equal => {
                tracing::info!(version = %last, "store is up to date");
                return self.complete(result);
            }
            Ordering::Greater => {
                tracing::warn!(
                    stored = %last,
                    target = %self.target,
                    "store is newer than this release, leaving it untouched"
                );
                return self.complete(result);
            }
            Ordering::Less => {}
        }

        let steps: Vec<MigrationStep> = self
            .catalog
            .applicable(&last, &self.target)
            .into_iter()
            .cloned()
            .collect();

        if self.config.dry_run {
            self.progress.in_progress("Planning migration", 0.10);
            result.planned = steps.iter().map(|s| s.description().to_string()).collect();
            tracing::info!(
                from = %last,
                to = %self.target,
                steps = steps.len(),
                "dry run, nothing applied"
            );
            return self.complete(result);
        }

        if let Err(e) = self.ensure_no_interrupted_run() {
            return self.fail(result, e);
        }

        tracing::info!(from = %last, to = %self.target, steps = steps.len(), "starting migration");
        self.progress.in_progress("Preparing migration", 0.10);
        if let Err(e) = self.preflight() {
            return self.fail(result, e);
        }
        self.progress.in_progress("Pre-flight checks passed", 0.15);

        let mut run = MigrationRun::start(RunKind::Migrate, last.clone(), self.target.clone());
        if let Err(e) = self.journal_start(&run) {
            return self.fail(result, e);
        }

        self.progress.in_progress("Creating backup", 0.20);
        let target = self.target.clone();
        let backup = match self.backups.create_backup(self.store.as_ref(), &target) {
            Ok(manifest) => manifest,
            Err(e) => {
                run.fail(&e);
                self.journal_save(&run);
                return self.fail(result, e);
            }
        };
        run.backup_blob = Some(backup.blob_name.clone());
        self.journal_save(&run);
        result.backup = Some(backup.clone());

        let outcome = self
            .apply(&steps, &mut result)
            .and_then(|()| self.post_checks(&mut result))
            .and_then(|()| self.commit(&target));
        run.steps_executed = result.steps_executed.clone();

        match outcome {
            Ok(()) => {
                run.complete();
                self.journal_save(&run);
                tracing::info!(
                    version = %target,
                    steps = result.steps_executed.len(),
                    "migration completed"
                );
                self.complete(result)
            }
            Err(e) => {
                let error = self.restore(&backup, e);
                run.fail(&error);
                self.journal_save(&run);
                self.fail(result, error)
            }
        }
    }

    /// Restore the most recent backup without re-running any step.
    ///
    /// The marker is left as it is: it was never advanced by the failed run.
    /// With a journal configured, recovery is refused when the latest run
    /// committed, since its backup predates the marker.
    pub fn recover_from_failed_migration(&mut self) -> MigrationResult {
        self.progress.reset();
        let last = self
            .last_applied()
            .unwrap_or_else(|_| INITIAL_VERSION.to_string());
        let mut result = MigrationResult::new(last.clone(), last);

        if let Err(e) = self.ensure_recoverable() {
            return self.fail(result, e);
        }

        self.progress.in_progress("Restoring from backup", 0.50);
        match self
            .backups
            .restore_backup(self.store.as_ref(), RestoreSource::MostRecent)
        {
            Ok(manifest) => {
                if let Some(journal) = &self.journal {
                    match journal.mark_recovered() {
                        Ok(n) if n > 0 => tracing::info!(runs = n, "marked runs recovered"),
                        Ok(_) => {}
                        Err(e) => result
                            .warnings
                            .push(format!("could not update run journal: {}", e)),
                    }
                }
                result.backup = Some(manifest);
                self.complete(result)
            }
            Err(e) => self.fail(result, e),
        }
    }

    /// Reverse applied steps above `version`, newest first.
    ///
    /// Refuses before touching the store if any of those steps is one-way. A
    /// backup is taken first and restored if a reversal fails. Reversals are
    /// best effort; see [`StepAction::DefaultField`](super::step::StepAction).
    pub fn rollback_to(&mut self, version: &str) -> MigrationResult {
        self.progress.reset();
        let mut result = MigrationResult::new(INITIAL_VERSION, version);

        let current = match self.last_applied() {
            Ok(current) => current,
            Err(e) => return self.fail(result, e),
        };
        result.from_version = current.clone();

        if !is_greater(&current, version) {
            tracing::info!(current = %current, requested = %version, "nothing to roll back");
            return self.complete(result);
        }

        let steps: Vec<MigrationStep> = self
            .catalog
            .applied_above(version, &current)
            .into_iter()
            .cloned()
            .collect();
        if let Some(step) = steps.iter().find(|s| !s.is_reversible()) {
            return self.fail(
                result,
                MigrationError::step_failed(step.description(), "not reversible"),
            );
        }

        if let Err(e) = self.ensure_no_interrupted_run() {
            return self.fail(result, e);
        }

        self.progress.in_progress("Preparing rollback", 0.10);
        if let Err(e) = self.preflight() {
            return self.fail(result, e);
        }

        let mut run = MigrationRun::start(RunKind::Rollback, current.clone(), version);
        if let Err(e) = self.journal_start(&run) {
            return self.fail(result, e);
        }

        self.progress.in_progress("Creating backup", 0.20);
        let label = format!("rollback-{}", version);
        let backup = match self.backups.create_labelled_backup(
            self.store.as_ref(),
            &label,
            Version::parse(version),
        ) {
            Ok(manifest) => manifest,
            Err(e) => {
                run.fail(&e);
                self.journal_save(&run);
                return self.fail(result, e);
            }
        };
        run.backup_blob = Some(backup.blob_name.clone());
        self.journal_save(&run);
        result.backup = Some(backup.clone());

        let outcome = self
            .revert(&steps, &mut result)
            .and_then(|()| self.commit(version));
        run.steps_executed = result.steps_executed.clone();

        match outcome {
            Ok(()) => {
                run.complete();
                self.journal_save(&run);
                tracing::info!(from = %current, to = %version, "rollback completed");
                self.complete(result)
            }
            Err(e) => {
                let error = self.restore(&backup, e);
                run.fail(&error);
                self.journal_save(&run);
                self.fail(result, error)
            }
        }
    }

    fn ensure_no_interrupted_run(&self) -> Result<(), MigrationError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let pending = journal
            .pending_recovery()
            .map_err(|e| MigrationError::data_corruption(format!("reading run journal: {}", e)))?;
        match pending.last() {
            Some(run) => Err(MigrationError::data_corruption(format!(
                "{} run {} -> {} ended {}; recover from backup first",
                run.kind, run.from_version, run.to_version, run.status
            ))),
            None => Ok(()),
        }
    }

    fn ensure_recoverable(&self) -> Result<(), MigrationError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let read_err = |e: Error| MigrationError::data_corruption(format!("reading run journal: {}", e));
        if !journal.pending_recovery().map_err(read_err)?.is_empty() {
            return Ok(());
        }
        match journal.latest().map_err(read_err)? {
            Some(run) if run.status == RunStatus::Completed => {
                Err(MigrationError::rollback_failed(format!(
                    "nothing to recover: {} run {} -> {} completed",
                    run.kind, run.from_version, run.to_version
                )))
            }
            _ => Ok(()),
        }
    }

    fn preflight(&self) -> Result<(), MigrationError> {
        check_headroom(
            self.store.as_ref(),
            self.space.as_ref(),
            self.config.min_free_bytes,
            self.config.headroom_factor,
        )?;
        let checked = spot_check(self.store.as_ref(), self.config.spot_check_sample)?;
        tracing::debug!(records = checked, "spot check passed");
        self.backups
            .probe()
            .map_err(|e| MigrationError::InsufficientStorage {
                reason: format!("backup location is not writable: {}", e),
            })
    }

    fn apply(
        &self,
        steps: &[MigrationStep],
        result: &mut MigrationResult,
    ) -> Result<(), MigrationError> {
        let total = steps.len().max(1) as f32;
        for (i, step) in steps.iter().enumerate() {
            let description = step.description();
            self.progress
                .in_progress(description, 0.30 + 0.50 * (i as f32 / total));

            let changed = step
                .execute(self.store.as_ref())
                .map_err(|e| MigrationError::step_failed(description, e))?;
            result.steps_executed.push(description.to_string());

            match step.validate(self.store.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(MigrationError::data_corruption(format!(
                        "validation failed after '{}'",
                        description
                    )))
                }
                Err(e) => return Err(MigrationError::step_failed(description, e)),
            }
            tracing::info!(
                step = %description,
                version = %step.target_version(),
                changed,
                "step applied"
            );
        }

        self.store
            .save()
            .map_err(|e| MigrationError::step_failed("Flush migrated data", e))
    }

    fn post_checks(&self, result: &mut MigrationResult) -> Result<(), MigrationError> {
        self.progress.in_progress("Verifying migrated data", 0.90);
        integrity_scan(self.store.as_ref())?;

        let dangling = dangling_references(self.store.as_ref(), &self.config.relations)
            .map_err(|e| MigrationError::data_corruption(format!("relationship scan: {}", e)))?;
        if !dangling.is_empty() {
            if self.config.strict_relationships {
                return Err(MigrationError::data_corruption(format!(
                    "{} dangling references: {}",
                    dangling.len(),
                    dangling.join("; ")
                )));
            }
            for finding in &dangling {
                tracing::warn!(finding = %finding, "dangling reference");
            }
            result.warnings.extend(dangling);
        }

        if let Some(rule) = &self.config.resources {
            match cleanup_orphans(self.store.as_ref(), rule) {
                Ok(report) => {
                    for failure in &report.failures {
                        tracing::warn!(failure = %failure, "orphan cleanup");
                    }
                    if let Some(reason) = &report.skipped {
                        tracing::warn!(reason = %reason, "orphan cleanup skipped");
                        result.warnings.push(reason.clone());
                    }
                    result.orphans_removed = report.removed.len();
                    result.warnings.extend(report.failures);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "orphan cleanup skipped");
                    result.warnings.push(format!("orphan cleanup skipped: {}", e));
                }
            }
        }
        Ok(())
    }

    fn revert(
        &self,
        steps: &[MigrationStep],
        result: &mut MigrationResult,
    ) -> Result<(), MigrationError> {
        let total = steps.len().max(1) as f32;
        for (i, step) in steps.iter().enumerate() {
            let description = format!("Reverting {}", step.description());
            self.progress
                .in_progress(&description, 0.30 + 0.50 * (i as f32 / total));
            step.rollback(self.store.as_ref())
                .map_err(|e| MigrationError::step_failed(step.description(), e))?;
            result.steps_executed.push(step.description().to_string());
        }
        self.store
            .save()
            .map_err(|e| MigrationError::step_failed("Flush reverted data", e))
    }

    fn commit(&self, version: &str) -> Result<(), MigrationError> {
        self.progress.in_progress("Committing version", 0.95);
        self.versions
            .set_last_migration_version(version)
            .map_err(|e| MigrationError::step_failed("Commit version marker", e))
    }

    /// Restore `backup` after `error`. Returns the error to surface.
    fn restore(&self, backup: &BackupManifest, error: MigrationError) -> MigrationError {
        tracing::warn!(error = %error, blob = %backup.blob_name, "rolling back changes");
        let progress = self.progress.current().progress;
        self.progress.in_progress("Rolling back changes", progress);

        match self
            .backups
            .restore_backup(self.store.as_ref(), RestoreSource::Manifest(backup))
        {
            Ok(_) => error,
            Err(restore_error) => {
                tracing::error!(
                    original = %error,
                    error = %restore_error,
                    "rollback failed, store needs recovery"
                );
                restore_error
            }
        }
    }

    fn journal_start(&self, run: &MigrationRun) -> Result<(), MigrationError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        journal
            .save(run)
            .map_err(|e| MigrationError::backup_failed(format!("recording run: {}", e)))
    }

    fn journal_save(&self, run: &MigrationRun) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save(run) {
                tracing::warn!(error = %e, status = %run.status, "could not update run journal");
            }
        }
    }

    fn complete(&self, mut result: MigrationResult) -> MigrationResult {
        self.progress.completed();
        result.state = MigrationState::Completed;
        result
    }

    fn fail(&self, mut result: MigrationResult, error: MigrationError) -> MigrationResult {
        tracing::error!(error = %error, kind = %error.kind(), "migration failed");
        self.progress.failed(error.clone());
        result.state = MigrationState::Failed(error);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::backup::FsBlobStore;
    use crate::migration::checks::FixedSpaceProbe;
    use crate::migration::error::MigrationErrorKind;
    use crate::settings::SettingsStore;
    use crate::storage::{Record, StorageConfig, StorageEngine};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<StorageEngine>,
        settings: Arc<SettingsStore>,
        blobs: Arc<FsBlobStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let blobs = Arc::new(FsBlobStore::open(dir.path().join("backups")).unwrap());
            Self {
                _dir: dir,
                store: Arc::new(StorageEngine::open(StorageConfig::temporary()).unwrap()),
                settings: Arc::new(SettingsStore::open(StorageConfig::temporary()).unwrap()),
                blobs,
            }
        }

        fn config(&self, target: &str) -> OrchestratorConfig {
            OrchestratorConfig::new(
                self.store.clone(),
                self.settings.clone(),
                self.blobs.clone(),
                target,
            )
            .with_space_probe(Arc::new(FixedSpaceProbe(u64::MAX)))
        }
    }

    #[test]
    fn test_default_catalog_run() {
        let fx = Fixture::new();
        fx.store
            .insert(&Record::new("challenge", "c1").with_field("name", "Run daily"))
            .unwrap();
        fx.store
            .insert(
                &Record::new("task", "t1")
                    .with_field("title", "  Morning RUN ")
                    .with_field("challenge_id", "c1")
                    .with_field("completed", true),
            )
            .unwrap();

        let mut orchestrator = MigrationOrchestrator::new(fx.config("1.4.0"));
        let result = orchestrator.run();

        assert!(result.is_completed(), "{:?}", result.state);
        assert_eq!(result.from_version, INITIAL_VERSION);
        assert_eq!(result.steps_executed.len(), 5);
        assert_eq!(
            fx.settings.last_migration_version().unwrap().as_deref(),
            Some("1.4.0")
        );

        let challenge = fx.store.get("challenge", "c1").unwrap().unwrap();
        assert_eq!(challenge.get("streak_count"), Some(&serde_json::json!(0)));
        assert_eq!(challenge.get("completed_tasks"), Some(&serde_json::json!(1)));
        assert_eq!(fx.store.count("analytics"), 1);
    }

    #[test]
    fn test_up_to_date_is_noop() {
        let fx = Fixture::new();
        fx.settings.set_last_migration_version("1.4").unwrap();

        let mut orchestrator = MigrationOrchestrator::new(fx.config("1.4.0"));
        let result = orchestrator.run();

        assert!(result.is_completed());
        assert!(result.backup.is_none());
        assert!(fx.blobs.list().unwrap().is_empty());
        assert_eq!(orchestrator.history().len(), 1);
    }

    #[test]
    fn test_newer_store_is_left_alone() {
        let fx = Fixture::new();
        fx.settings.set_last_migration_version("2.0.0").unwrap();

        let mut orchestrator = MigrationOrchestrator::new(fx.config("1.4.0"));
        let result = orchestrator.run();

        assert!(result.is_completed());
        assert!(result.steps_executed.is_empty());
        assert_eq!(
            fx.settings.last_migration_version().unwrap().as_deref(),
            Some("2.0.0")
        );
    }

    #[test]
    fn test_plan_and_dry_run() {
        let fx = Fixture::new();
        fx.settings.set_last_migration_version("1.2.0").unwrap();

        let mut orchestrator = MigrationOrchestrator::new(
            fx.config("1.4.0")
                .with_migration(MigrationConfig::default().with_dry_run(true)),
        );
        let planned: Vec<_> = orchestrator
            .plan()
            .unwrap()
            .iter()
            .map(|s| s.description().to_string())
            .collect();
        assert_eq!(planned.len(), 3);

        let result = orchestrator.run();
        assert!(result.is_completed());
        assert_eq!(result.planned, planned);
        assert!(result.steps_executed.is_empty());
        assert!(fx.blobs.list().unwrap().is_empty());
        assert_eq!(
            fx.settings.last_migration_version().unwrap().as_deref(),
            Some("1.2.0")
        );
    }

    #[test]
    fn test_progress_reaches_completion() {
        let fx = Fixture::new();
        let mut orchestrator = MigrationOrchestrator::new(fx.config("1.4.0"));
        let rx = orchestrator.subscribe();

        orchestrator.run();

        let last = rx.borrow().clone();
        assert_eq!(last.state, MigrationState::Completed);
        assert_eq!(last.progress, 1.0);

        let history = orchestrator.history();
        assert!(history
            .windows(2)
            .all(|w| w[0].progress <= w[1].progress));
        assert_eq!(history[0].current_step, "Preparing migration");
    }

    #[test]
    fn test_rollback_refuses_one_way_steps() {
        let fx = Fixture::new();
        let mut orchestrator = MigrationOrchestrator::new(fx.config("1.4.0"));
        assert!(orchestrator.run().is_completed());

        let result = orchestrator.rollback_to("1.2.0");
        let error = result.error().unwrap();
        assert_eq!(error.kind(), MigrationErrorKind::MigrationStepFailed);
        assert!(error.to_string().contains("not reversible"));
        assert_eq!(
            fx.settings.last_migration_version().unwrap().as_deref(),
            Some("1.4.0")
        );
    }
}
