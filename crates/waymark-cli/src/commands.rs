//! Subcommand implementations.

use crate::config::{BackupAction, CliConfig, Command, OutputFormat};
use crate::error::Error;
use chrono::{DateTime, Utc};
use comfy_table::Table;
use std::sync::Arc;
use waymark_core::migration::{
    FsBlobStore, MigrationJournal, MigrationOrchestrator, MigrationResult, MigrationRun,
    MigrationState, ProgressSnapshot,
};
use waymark_core::{
    OrchestratorConfig, Record, RecordStore, SettingsStore, StorageConfig, StorageEngine,
};

/// Runs shown by `status`.
const STATUS_RUNS: usize = 10;

/// Open handles on a data directory.
pub struct DataDir {
    store: Arc<StorageEngine>,
    settings: Arc<SettingsStore>,
    blobs: Arc<FsBlobStore>,
}

impl DataDir {
    /// Open (creating if needed) the store, settings and backup directory.
    pub fn open(config: &CliConfig) -> Result<Self, Error> {
        if config.data_dir.exists() && !config.data_dir.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                config.data_dir.display()
            )));
        }
        std::fs::create_dir_all(&config.data_dir)?;

        let store = StorageEngine::open(StorageConfig::new(config.store_path()))?;
        if store.was_recovered() {
            tracing::debug!(path = %config.store_path().display(), "store reopened");
        }
        let settings = SettingsStore::open(StorageConfig::new(config.settings_path()))?;
        let blobs = FsBlobStore::open(config.backups_dir())?;

        Ok(Self {
            store: Arc::new(store),
            settings: Arc::new(settings),
            blobs: Arc::new(blobs),
        })
    }

    fn journal(&self) -> Result<MigrationJournal, Error> {
        Ok(MigrationJournal::open(self.settings.db())?)
    }

    fn orchestrator(&self, config: &CliConfig) -> Result<MigrationOrchestrator, Error> {
        let orchestrator_config = OrchestratorConfig::new(
            self.store.clone(),
            self.settings.clone(),
            self.blobs.clone(),
            config.target_version(),
        )
        .with_journal(self.journal()?)
        .with_migration(config.migration_config());
        Ok(MigrationOrchestrator::new(orchestrator_config))
    }
}

/// Run the configured subcommand.
pub async fn execute(config: CliConfig) -> Result<(), Error> {
    let data = DataDir::open(&config)?;

    match &config.command {
        Command::Migrate { .. } => {
            let orchestrator = data.orchestrator(&config)?;
            let result = run_with_progress(orchestrator, |mut o| o.run()).await?;
            report(&result)
        }
        Command::Status => status(&data, &config),
        Command::Recover => {
            let orchestrator = data.orchestrator(&config)?;
            let result =
                run_with_progress(orchestrator, |mut o| o.recover_from_failed_migration()).await?;
            report(&result)
        }
        Command::Rollback { to } => {
            let orchestrator = data.orchestrator(&config)?;
            let to = to.clone();
            let result = run_with_progress(orchestrator, move |mut o| o.rollback_to(&to)).await?;
            report(&result)
        }
        Command::Backups { action } => backups(&data, &config, action),
        Command::Seed { challenges } => seed(&data, &config, *challenges),
    }
}

/// Run blocking orchestrator work off the async runtime, printing progress.
///
/// The orchestrator is dropped when `work` returns, which closes the progress
/// channel and ends the printer.
async fn run_with_progress<F>(
    orchestrator: MigrationOrchestrator,
    work: F,
) -> Result<MigrationResult, Error>
where
    F: FnOnce(MigrationOrchestrator) -> MigrationResult + Send + 'static,
{
    let mut rx = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            print_progress(&snapshot);
        }
    });

    let result = tokio::task::spawn_blocking(move || work(orchestrator)).await?;
    printer.await?;
    Ok(result)
}

fn print_progress(snapshot: &ProgressSnapshot) {
    if let MigrationState::InProgress(step) = &snapshot.state {
        println!("[{:>3.0}%] {}", snapshot.progress * 100.0, step);
    }
}

fn report(result: &MigrationResult) -> Result<(), Error> {
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    if !result.planned.is_empty() {
        println!(
            "Plan {} -> {} ({} steps):",
            result.from_version,
            result.to_version,
            result.planned.len()
        );
        for step in &result.planned {
            println!("  - {}", step);
        }
    }
    if let Some(backup) = &result.backup {
        println!("Backup: {}", backup.blob_location.display());
    }
    if result.orphans_removed > 0 {
        println!("Removed {} orphaned files", result.orphans_removed);
    }

    match &result.state {
        MigrationState::Completed => {
            println!(
                "Completed: {} -> {} ({} steps)",
                result.from_version,
                result.to_version,
                result.steps_executed.len()
            );
            Ok(())
        }
        MigrationState::Failed(e) => Err(e.clone().into()),
        other => Err(Error::Config(format!("run ended in state {}", other))),
    }
}

fn status(data: &DataDir, config: &CliConfig) -> Result<(), Error> {
    let orchestrator = data.orchestrator(config)?;
    let last = orchestrator.last_applied()?;
    let pending: Vec<String> = orchestrator
        .plan()?
        .iter()
        .map(|s| format!("{} {}", s.target_version(), s.description()))
        .collect();
    let mut runs = data.journal()?.list()?;
    runs.reverse();
    runs.truncate(STATUS_RUNS);

    if config.format == OutputFormat::Json {
        let runs: Vec<serde_json::Value> = runs.iter().map(run_json).collect();
        let value = serde_json::json!({
            "last_migration_version": last,
            "target_version": orchestrator.target_version(),
            "pending_steps": pending,
            "runs": runs,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Version: {} (target {})", last, orchestrator.target_version());
    if pending.is_empty() {
        println!("Up to date");
    } else {
        println!("Pending steps:");
        for step in &pending {
            println!("  - {}", step);
        }
    }

    if !runs.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Started", "Kind", "From", "To", "Status", "Error"]);
        for run in &runs {
            table.add_row(vec![
                format_micros(run.started_at),
                run.kind.to_string(),
                run.from_version.clone(),
                run.to_version.clone(),
                run.status.to_string(),
                run.error.clone().unwrap_or_default(),
            ]);
        }
        println!("{}", table);
    }
    Ok(())
}

fn run_json(run: &MigrationRun) -> serde_json::Value {
    serde_json::json!({
        "run_id": hex::encode(run.run_id),
        "kind": run.kind.to_string(),
        "from": run.from_version,
        "to": run.to_version,
        "status": run.status.to_string(),
        "started_at": format_micros(run.started_at),
        "finished_at": run.finished_at.map(format_micros),
        "error": run.error,
        "backup": run.backup_blob,
        "steps": run.steps_executed,
    })
}

fn backups(data: &DataDir, config: &CliConfig, action: &BackupAction) -> Result<(), Error> {
    let orchestrator = data.orchestrator(config)?;
    let manager = orchestrator.backups();

    match action {
        BackupAction::List => {
            let manifests = manager.list()?;
            if config.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&manifests)?);
                return Ok(());
            }
            if manifests.is_empty() {
                println!("No backups");
                return Ok(());
            }
            let mut table = Table::new();
            table.set_header(vec!["Created", "Version", "Records", "Blob", "Checksum"]);
            for manifest in &manifests {
                table.add_row(vec![
                    manifest.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    manifest.label.clone(),
                    manifest.record_count.to_string(),
                    manifest.blob_name.clone(),
                    manifest.checksum.chars().take(12).collect(),
                ]);
            }
            println!("{}", table);
        }
        BackupAction::Prune { keep } => {
            let removed = manager.prune(*keep)?;
            for name in &removed {
                println!("removed {}", name);
            }
            println!("Kept {} newest backups, removed {}", keep, removed.len());
        }
    }
    Ok(())
}

/// Demo data as the first release wrote it: no derived fields and photos
/// still pointing at their file through `file`.
fn seed(data: &DataDir, config: &CliConfig, challenges: usize) -> Result<(), Error> {
    let photos = config.photos_dir();
    std::fs::create_dir_all(&photos)?;

    let mut written = 0;
    for c in 1..=challenges {
        let challenge_id = format!("challenge-{}", c);
        data.store.insert(
            &Record::new("challenge", challenge_id.as_str())
                .with_field("name", format!("Challenge {}", c))
                .with_field("duration_days", 30),
        )?;
        written += 1;

        for t in 1..=3 {
            data.store.insert(
                &Record::new("task", format!("{}-task-{}", challenge_id, t))
                    .with_field("challenge_id", challenge_id.as_str())
                    .with_field("title", format!("  Day {}  Workout ", t))
                    .with_field("completed", t % 2 == 1),
            )?;
            written += 1;
        }

        let file_name = format!("{}.jpg", challenge_id);
        std::fs::write(photos.join(&file_name), b"")?;
        data.store.insert(
            &Record::new("photo", format!("{}-photo", challenge_id))
                .with_field("challenge_id", challenge_id.as_str())
                .with_field("file", format!("photos/{}", file_name)),
        )?;
        written += 1;
    }
    data.store.save()?;

    tracing::info!(records = written, "seeded demo data");
    println!("Seeded {} records", written);
    Ok(())
}

fn format_micros(micros: u64) -> String {
    i64::try_from(micros)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| micros.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use waymark_core::migration::{FixedSpaceProbe, CURRENT_VERSION};
    use waymark_core::VersionRecord;

    fn config(dir: &std::path::Path, command: Command) -> CliConfig {
        CliConfig::new(dir, command)
    }

    async fn seed_and_migrate(dir: &std::path::Path, target: &str) -> (DataDir, MigrationResult) {
        execute(config(dir, Command::Seed { challenges: 2 }))
            .await
            .unwrap();

        let migrate = config(
            dir,
            Command::Migrate {
                target: target.to_string(),
                dry_run: false,
                strict: true,
                min_free_mb: 0,
            },
        );
        let data = DataDir::open(&migrate).unwrap();
        // The host disk may be invisible in sandboxes, so use a fixed probe here.
        let orchestrator_config = OrchestratorConfig::new(
            data.store.clone(),
            data.settings.clone(),
            data.blobs.clone(),
            migrate.target_version(),
        )
        .with_space_probe(Arc::new(FixedSpaceProbe(u64::MAX)))
        .with_journal(data.journal().unwrap())
        .with_migration(migrate.migration_config());
        let orchestrator = MigrationOrchestrator::new(orchestrator_config);

        let result = run_with_progress(orchestrator, |mut o| o.run()).await.unwrap();
        (data, result)
    }

    #[tokio::test]
    async fn test_seed_then_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let (data, result) = seed_and_migrate(dir.path(), CURRENT_VERSION).await;

        assert!(result.is_completed(), "{:?}", result.state);
        assert!(report(&result).is_ok());
        assert_eq!(
            data.settings.last_migration_version().unwrap().as_deref(),
            Some(CURRENT_VERSION)
        );

        let photo = data.store.get("photo", "challenge-1-photo").unwrap().unwrap();
        assert_eq!(photo.get_str("path"), Some("photos/challenge-1.jpg"));
        assert!(dir.path().join("photos/challenge-1.jpg").exists());
        assert_eq!(data.store.count("analytics"), 2);
    }

    #[tokio::test]
    async fn test_migrate_before_rename_keeps_photos() {
        let dir = tempfile::tempdir().unwrap();
        let (data, result) = seed_and_migrate(dir.path(), "1.2.0").await;

        assert!(result.is_completed(), "{:?}", result.state);
        assert_eq!(result.orphans_removed, 0);
        for c in 1..=2 {
            let photo = data
                .store
                .get("photo", &format!("challenge-{}-photo", c))
                .unwrap()
                .unwrap();
            assert!(photo.has("file"));
            assert!(dir.path().join(format!("photos/challenge-{}.jpg", c)).exists());
        }
    }

    #[test]
    fn test_data_dir_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let result = DataDir::open(&config(&file, Command::Status));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_format_micros() {
        assert_eq!(format_micros(0), "1970-01-01 00:00:00");
        assert_eq!(format_micros(1_700_000_000_000_000), "2023-11-14 22:13:20");
    }
}
