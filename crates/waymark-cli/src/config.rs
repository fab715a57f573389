//! CLI configuration.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use waymark_core::migration::{MigrationConfig, RelationRule, ResourceRule, CURRENT_VERSION};

/// Default free-space floor in megabytes.
pub const DEFAULT_MIN_FREE_MB: u64 = 16;

/// Default number of backups kept by `backups prune`.
pub const DEFAULT_KEEP_BACKUPS: usize = 3;

/// Default data directory: the platform data dir, or `./data`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("waymark"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Output format for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables.
    Table,
    /// JSON.
    Json,
}

/// What to do.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Migrate the store to the target version.
    Migrate {
        /// Version to migrate to.
        #[arg(long, default_value = CURRENT_VERSION)]
        target: String,

        /// Show the plan without changing anything.
        #[arg(long)]
        dry_run: bool,

        /// Fail on dangling references instead of warning.
        #[arg(long)]
        strict: bool,

        /// Free space required before backing up, in megabytes.
        #[arg(long, default_value_t = DEFAULT_MIN_FREE_MB)]
        min_free_mb: u64,
    },

    /// Show the version marker, pending steps and recent runs.
    Status,

    /// Restore the most recent backup after a failed or interrupted run.
    Recover,

    /// Reverse applied steps down to a version.
    Rollback {
        /// Version to roll back to.
        #[arg(long = "to")]
        to: String,
    },

    /// Manage backups.
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Write demo records in the pre-migration shape.
    Seed {
        /// Number of challenges to create.
        #[arg(long, default_value_t = 3)]
        challenges: usize,
    },
}

/// Backup maintenance.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum BackupAction {
    /// List backups, newest first.
    List,

    /// Delete all but the newest backups.
    Prune {
        /// Backups to keep.
        #[arg(long, default_value_t = DEFAULT_KEEP_BACKUPS)]
        keep: usize,
    },
}

/// Resolved CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Listing format.
    pub format: OutputFormat,
    /// Subcommand.
    pub command: Command,
}

impl CliConfig {
    /// Create a configuration over a data directory.
    pub fn new(data_dir: impl Into<PathBuf>, command: Command) -> Self {
        Self {
            data_dir: data_dir.into(),
            format: OutputFormat::Table,
            command,
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Record store database.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Settings database holding the marker and run journal.
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings")
    }

    /// Backup blob directory.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Photo file directory.
    pub fn photos_dir(&self) -> PathBuf {
        self.data_dir.join("photos")
    }

    /// Migration policy for this data directory.
    pub fn migration_config(&self) -> MigrationConfig {
        let base = app_rules(MigrationConfig::default(), &self.photos_dir());
        match &self.command {
            Command::Migrate {
                dry_run,
                strict,
                min_free_mb,
                ..
            } => base
                .with_dry_run(*dry_run)
                .with_strict_relationships(*strict)
                .with_min_free_bytes(min_free_mb * 1024 * 1024),
            _ => base,
        }
    }

    /// Version the orchestrator targets.
    pub fn target_version(&self) -> &str {
        match &self.command {
            Command::Migrate { target, .. } => target,
            _ => CURRENT_VERSION,
        }
    }
}

/// Relationship and resource rules of the challenge app.
fn app_rules(config: MigrationConfig, photos_dir: &Path) -> MigrationConfig {
    config
        .with_relation(RelationRule::new("task", "challenge_id", "challenge"))
        .with_relation(RelationRule::new("photo", "challenge_id", "challenge"))
        .with_resources(ResourceRule::new("photo", "path", photos_dir).with_field("file"))
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "waymark")]
#[command(version, about = "Versioned data migrations with backup and restore", long_about = None)]
pub struct Args {
    /// Data directory.
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Output format for listings.
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Convert command-line arguments to CLI configuration.
    pub fn into_config(self) -> CliConfig {
        let data_dir = self.data_dir.unwrap_or_else(default_data_dir);
        CliConfig::new(data_dir, self.command).with_format(self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliConfig {
        Args::try_parse_from(args).unwrap().into_config()
    }

    #[test]
    fn test_migrate_defaults() {
        let config = parse(&["waymark", "-d", "/tmp/wm", "migrate"]);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/wm"));
        assert_eq!(config.target_version(), CURRENT_VERSION);
        assert_eq!(config.store_path(), PathBuf::from("/tmp/wm/store"));
        assert_eq!(config.backups_dir(), PathBuf::from("/tmp/wm/backups"));

        let migration = config.migration_config();
        assert!(!migration.dry_run);
        assert!(!migration.strict_relationships);
        assert_eq!(migration.min_free_bytes, DEFAULT_MIN_FREE_MB * 1024 * 1024);
        assert_eq!(migration.relations.len(), 2);
        let resources = migration.resources.unwrap();
        assert_eq!(resources.dir, PathBuf::from("/tmp/wm/photos"));
        assert_eq!(resources.fields, vec!["path", "file"]);
    }

    #[test]
    fn test_migrate_flags() {
        let config = parse(&[
            "waymark", "-d", "/tmp/wm", "migrate", "--target", "1.2.0", "--dry-run", "--strict",
            "--min-free-mb", "1",
        ]);
        assert_eq!(config.target_version(), "1.2.0");

        let migration = config.migration_config();
        assert!(migration.dry_run);
        assert!(migration.strict_relationships);
        assert_eq!(migration.min_free_bytes, 1024 * 1024);
    }

    #[test]
    fn test_subcommands() {
        assert_eq!(
            parse(&["waymark", "rollback", "--to", "1.1.0"]).command,
            Command::Rollback {
                to: "1.1.0".to_string()
            }
        );
        assert_eq!(
            parse(&["waymark", "backups", "prune"]).command,
            Command::Backups {
                action: BackupAction::Prune {
                    keep: DEFAULT_KEEP_BACKUPS
                }
            }
        );
        let config = parse(&["waymark", "--format", "json", "backups", "list"]);
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn test_rollback_requires_version() {
        assert!(Args::try_parse_from(["waymark", "rollback"]).is_err());
    }
}
