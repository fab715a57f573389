//! Pre-flight and post-migration checks.

use super::error::MigrationError;
use super::step::reference_id;
use crate::error::Error;
use crate::storage::RecordStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Reports free space where backups are written.
pub trait SpaceProbe: Send + Sync {
    /// Available bytes.
    fn available_bytes(&self) -> Result<u64, Error>;
}

/// Probe backed by the disk holding a path.
pub struct DiskSpaceProbe {
    path: PathBuf,
}

impl DiskSpaceProbe {
    /// Probe the disk containing `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpaceProbe for DiskSpaceProbe {
    fn available_bytes(&self) -> Result<u64, Error> {
        let path = self.path.canonicalize()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // The disk with the longest mount point containing the path.
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| Error::InvalidData(format!("no disk found for {}", path.display())))
    }
}

/// Probe reporting a fixed amount of space.
pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self) -> Result<u64, Error> {
        Ok(self.0)
    }
}

/// A reference from one record kind to another.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationRule {
    /// Referencing kind.
    pub kind: String,
    /// Field holding the referenced id.
    pub field: String,
    /// Referenced kind.
    pub target_kind: String,
}

impl RelationRule {
    /// Create a relation rule.
    pub fn new(
        kind: impl Into<String>,
        field: impl Into<String>,
        target_kind: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            field: field.into(),
            target_kind: target_kind.into(),
        }
    }
}

/// Files in a directory owned by records of one kind.
///
/// A record may name its file under any of `fields`, so a rule can cover
/// both the shape before and after a rename step.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRule {
    /// Owning kind.
    pub kind: String,
    /// Fields holding the file name (or a path ending in it).
    pub fields: Vec<String>,
    /// Directory holding the files.
    pub dir: PathBuf,
}

impl ResourceRule {
    /// Create a resource rule with one reference field.
    pub fn new(kind: impl Into<String>, field: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            kind: kind.into(),
            fields: vec![field.into()],
            dir: dir.into(),
        }
    }

    /// Also accept references held in `field`.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }
}

/// Fail unless there is room for a backup of the store.
///
/// Required space is `max(min_free_bytes, size_on_disk * headroom_factor)`.
pub fn check_headroom(
    store: &dyn RecordStore,
    probe: &dyn SpaceProbe,
    min_free_bytes: u64,
    headroom_factor: f64,
) -> Result<(), MigrationError> {
    let size = store.size_on_disk().map_err(|e| MigrationError::InsufficientStorage {
        reason: format!("cannot determine store size: {}", e),
    })?;
    let available = probe
        .available_bytes()
        .map_err(|e| MigrationError::InsufficientStorage {
            reason: format!("cannot determine free space: {}", e),
        })?;

    let required = ((size as f64) * headroom_factor).ceil() as u64;
    let required = required.max(min_free_bytes);
    if available < required {
        return Err(MigrationError::InsufficientStorage {
            reason: format!("{} bytes available, {} required", available, required),
        });
    }
    Ok(())
}

/// Check that up to `sample` records per kind decode and are well-formed.
pub fn spot_check(store: &dyn RecordStore, sample: usize) -> Result<usize, MigrationError> {
    let kinds = store
        .kinds()
        .map_err(|e| MigrationError::data_corruption(format!("listing kinds: {}", e)))?;

    let mut checked = 0;
    for kind in kinds {
        let records = store
            .fetch_all(&kind)
            .map_err(|e| MigrationError::data_corruption(format!("reading {}: {}", kind, e)))?;
        for record in records.iter().take(sample) {
            if record.id.is_empty() {
                return Err(MigrationError::data_corruption(format!(
                    "{} record with empty id",
                    kind
                )));
            }
            if record.kind != kind {
                return Err(MigrationError::data_corruption(format!(
                    "record {} stored under {} claims kind {}",
                    record.id, kind, record.kind
                )));
            }
            checked += 1;
        }
    }
    Ok(checked)
}

/// Full integrity scan: every record of every kind.
pub fn integrity_scan(store: &dyn RecordStore) -> Result<usize, MigrationError> {
    spot_check(store, usize::MAX)
}

/// Describe every reference that points at a missing record.
pub fn dangling_references(
    store: &dyn RecordStore,
    rules: &[RelationRule],
) -> Result<Vec<String>, Error> {
    let mut findings = Vec::new();
    for rule in rules {
        let targets: HashSet<String> = store
            .fetch_all(&rule.target_kind)?
            .into_iter()
            .map(|r| r.id)
            .collect();

        for record in store.fetch_all(&rule.kind)? {
            let Some(target) = record.get(&rule.field).and_then(reference_id) else {
                continue;
            };
            if !targets.contains(&target) {
                findings.push(format!(
                    "{}/{} references missing {}/{} via {}",
                    rule.kind, record.id, rule.target_kind, target, rule.field
                ));
            }
        }
    }
    Ok(findings)
}

/// Result of an orphan cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Files deleted.
    pub removed: Vec<PathBuf>,
    /// Files that could not be deleted.
    pub failures: Vec<String>,
    /// Why the pass deleted nothing, when it was skipped.
    pub skipped: Option<String>,
}

/// Delete files in the rule's directory that no record references.
///
/// If any record of the rule's kind holds none of the reference fields its
/// file cannot be identified, so the pass is skipped and nothing is deleted.
pub fn cleanup_orphans(store: &dyn RecordStore, rule: &ResourceRule) -> Result<CleanupReport, Error> {
    let mut report = CleanupReport::default();
    if !rule.dir.is_dir() {
        return Ok(report);
    }

    let mut referenced = HashSet::new();
    for record in store.fetch_all(&rule.kind)? {
        let names: Vec<String> = rule
            .fields
            .iter()
            .filter_map(|field| record.get_str(field))
            .filter_map(file_name)
            .collect();
        if names.is_empty() {
            report.skipped = Some(format!(
                "{}/{} has no {} reference; orphan cleanup skipped",
                rule.kind,
                record.id,
                rule.fields.join("/")
            ));
            return Ok(report);
        }
        referenced.extend(names);
    }

    for entry in std::fs::read_dir(&rule.dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if referenced.contains(name) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed orphaned resource");
                report.removed.push(path);
            }
            Err(e) => report
                .failures
                .push(format!("removing {}: {}", path.display(), e)),
        }
    }
    Ok(report)
}

fn file_name(value: &str) -> Option<String> {
    Path::new(value)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}
