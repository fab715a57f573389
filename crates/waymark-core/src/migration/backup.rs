//! Full-store backup and restore.
//!
//! A backup is one blob per attempted target version, named
//! `backup_<version>.blob`. The blob is gzip-compressed JSON: a header
//! (format, label, creation time, record count, SHA-256 of the record payload)
//! followed by every record in the store. Restore is total: the live store is
//! cleared and rewritten from the blob after the checksum has been verified.

use super::error::MigrationError;
use super::version::Version;
use crate::error::Error;
use crate::storage::{Record, RecordStore};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Blob format version written by this release.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

const BLOB_PREFIX: &str = "backup_";
const BLOB_SUFFIX: &str = ".blob";
const PROBE_NAME: &str = ".write_probe";

/// A blob in a [`BlobStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct BlobEntry {
    /// Blob name.
    pub name: String,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

/// Filesystem-like storage for backup blobs.
pub trait BlobStore: Send + Sync {
    /// Write a blob atomically, replacing any blob of the same name.
    fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, Error>;

    /// Read a blob.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, Error>;

    /// List all blobs.
    fn list(&self) -> Result<Vec<BlobEntry>, Error>;

    /// Delete a blob. Deleting a missing blob is not an error.
    fn remove(&self, name: &str) -> Result<(), Error>;

    /// Where a blob of this name lives.
    fn location(&self, name: &str) -> PathBuf;

    /// Check that blobs can be written here.
    fn probe_writable(&self) -> Result<(), Error> {
        self.write(PROBE_NAME, b"probe")?;
        self.remove(PROBE_NAME)
    }
}

/// Blob store over a local directory.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Open a blob directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The backing directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BlobStore for FsBlobStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, Error> {
        let path = self.location(name);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(path)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        match std::fs::read(self.location(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<BlobEntry>, Error> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            entries.push(BlobEntry {
                name,
                modified: DateTime::<Utc>::from(metadata.modified()?),
                size: metadata.len(),
            });
        }
        Ok(entries)
    }

    fn remove(&self, name: &str) -> Result<(), Error> {
        match std::fs::remove_file(self.location(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Description of a written backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Version the backup was taken for (the run's target).
    pub version: Version,
    /// The label the blob name was derived from.
    pub label: String,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// Blob name within the blob store.
    pub blob_name: String,
    /// Full location of the blob.
    pub blob_location: PathBuf,
    /// Number of records captured.
    pub record_count: usize,
    /// Hex SHA-256 of the record payload.
    pub checksum: String,
}

/// Which backup to restore.
#[derive(Debug, Clone, Copy)]
pub enum RestoreSource<'a> {
    /// A specific backup.
    Manifest(&'a BackupManifest),
    /// The latest blob in the store.
    MostRecent,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupHeader {
    format_version: u32,
    label: String,
    created_at: DateTime<Utc>,
    record_count: usize,
    checksum: String,
    #[serde(default)]
    version: Option<Version>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupBlob {
    header: BackupHeader,
    records: Vec<Record>,
}

/// Creates and restores full-store backups.
#[derive(Clone)]
pub struct BackupManager {
    blobs: Arc<dyn BlobStore>,
}

impl BackupManager {
    /// Create a manager over a blob store.
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// The blob name a label maps to.
    pub fn blob_name(label: &str) -> String {
        let sanitized: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}{}", BLOB_PREFIX, sanitized, BLOB_SUFFIX)
    }

    /// Check that a backup could be written.
    pub fn probe(&self) -> Result<(), Error> {
        self.blobs.probe_writable()
    }

    /// Serialize the whole store into the blob for `label`.
    pub fn create_backup(
        &self,
        store: &dyn RecordStore,
        label: &str,
    ) -> Result<BackupManifest, MigrationError> {
        self.create_labelled_backup(store, label, Version::parse(label))
    }

    /// Like [`create_backup`](Self::create_backup), for a label that is not
    /// itself a version.
    pub fn create_labelled_backup(
        &self,
        store: &dyn RecordStore,
        label: &str,
        version: Version,
    ) -> Result<BackupManifest, MigrationError> {
        let records = store
            .fetch_everything()
            .map_err(|e| MigrationError::backup_failed(format!("reading store: {}", e)))?;

        let checksum = payload_checksum(&records).map_err(MigrationError::backup_failed)?;
        let created_at = Utc::now();
        let blob = BackupBlob {
            header: BackupHeader {
                format_version: BACKUP_FORMAT_VERSION,
                label: label.to_string(),
                created_at,
                record_count: records.len(),
                checksum: checksum.clone(),
                version: Some(version),
            },
            records,
        };

        let bytes = encode_blob(&blob).map_err(MigrationError::backup_failed)?;
        let blob_name = Self::blob_name(label);
        let blob_location = self
            .blobs
            .write(&blob_name, &bytes)
            .map_err(|e| MigrationError::backup_failed(format!("writing {}: {}", blob_name, e)))?;

        tracing::info!(
            label,
            records = blob.header.record_count,
            location = %blob_location.display(),
            "backup created"
        );

        Ok(BackupManifest {
            version,
            label: label.to_string(),
            created_at,
            blob_name,
            blob_location,
            record_count: blob.header.record_count,
            checksum,
        })
    }

    /// Replace the live store with a backup's contents.
    pub fn restore_backup(
        &self,
        store: &dyn RecordStore,
        source: RestoreSource<'_>,
    ) -> Result<BackupManifest, MigrationError> {
        let blob_name = match source {
            RestoreSource::Manifest(manifest) => manifest.blob_name.clone(),
            RestoreSource::MostRecent => self
                .most_recent()
                .map_err(|e| MigrationError::rollback_failed(format!("listing backups: {}", e)))?
                .map(|entry| entry.name)
                .ok_or_else(|| MigrationError::rollback_failed("no backup exists"))?,
        };

        let bytes = self
            .blobs
            .read(&blob_name)
            .map_err(|e| MigrationError::rollback_failed(format!("reading {}: {}", blob_name, e)))?
            .ok_or_else(|| MigrationError::rollback_failed(format!("backup {} is missing", blob_name)))?;

        let blob = decode_blob(&bytes).map_err(MigrationError::rollback_failed)?;
        verify_blob(&blob).map_err(MigrationError::rollback_failed)?;
        let manifest = self.manifest_for(&blob_name, &blob.header);

        store
            .clear()
            .map_err(|e| MigrationError::rollback_failed(format!("clearing store: {}", e)))?;
        for record in &blob.records {
            store.insert(record).map_err(|e| {
                MigrationError::rollback_failed(format!(
                    "writing {}/{}: {}",
                    record.kind, record.id, e
                ))
            })?;
        }
        store
            .save()
            .map_err(|e| MigrationError::rollback_failed(format!("flushing store: {}", e)))?;

        tracing::info!(
            blob = %blob_name,
            records = manifest.record_count,
            "store restored from backup"
        );
        Ok(manifest)
    }

    /// The latest backup blob, by modification time then name.
    pub fn most_recent(&self) -> Result<Option<BlobEntry>, Error> {
        Ok(self.backup_entries()?.into_iter().last())
    }

    /// Manifests of all readable backups, newest first.
    pub fn list(&self) -> Result<Vec<BackupManifest>, Error> {
        let mut manifests = Vec::new();
        for entry in self.backup_entries()?.into_iter().rev() {
            let Some(bytes) = self.blobs.read(&entry.name)? else {
                continue;
            };
            match decode_blob(&bytes) {
                Ok(blob) => manifests.push(self.manifest_for(&entry.name, &blob.header)),
                Err(e) => tracing::warn!(blob = %entry.name, error = %e, "skipping unreadable backup"),
            }
        }
        Ok(manifests)
    }

    /// Delete all but the newest `keep` backups. Returns the deleted blob names.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>, Error> {
        let entries = self.backup_entries()?;
        let excess = entries.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for entry in entries.into_iter().take(excess) {
            self.blobs.remove(&entry.name)?;
            tracing::info!(blob = %entry.name, "pruned backup");
            removed.push(entry.name);
        }
        Ok(removed)
    }

    /// Backup blobs, oldest first.
    fn backup_entries(&self) -> Result<Vec<BlobEntry>, Error> {
        let mut entries: Vec<BlobEntry> = self
            .blobs
            .list()?
            .into_iter()
            .filter(|e| e.name.starts_with(BLOB_PREFIX) && e.name.ends_with(BLOB_SUFFIX))
            .collect();
        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    fn manifest_for(&self, blob_name: &str, header: &BackupHeader) -> BackupManifest {
        BackupManifest {
            version: header
                .version
                .unwrap_or_else(|| Version::parse(&header.label)),
            label: header.label.clone(),
            created_at: header.created_at,
            blob_name: blob_name.to_string(),
            blob_location: self.blobs.location(blob_name),
            record_count: header.record_count,
            checksum: header.checksum.clone(),
        }
    }
}

fn payload_checksum(records: &[Record]) -> Result<String, String> {
    let payload = serde_json::to_vec(records).map_err(|e| format!("serializing records: {}", e))?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

fn encode_blob(blob: &BackupBlob) -> Result<Vec<u8>, String> {
    let json = serde_json::to_vec(blob).map_err(|e| format!("serializing backup: {}", e))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| format!("compressing backup: {}", e))?;
    encoder
        .finish()
        .map_err(|e| format!("compressing backup: {}", e))
}

fn decode_blob(bytes: &[u8]) -> Result<BackupBlob, String> {
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(|e| format!("decompressing backup: {}", e))?;
    serde_json::from_slice(&json).map_err(|e| format!("parsing backup: {}", e))
}

fn verify_blob(blob: &BackupBlob) -> Result<(), String> {
    if blob.header.format_version > BACKUP_FORMAT_VERSION {
        return Err(format!(
            "backup format {} is newer than supported format {}",
            blob.header.format_version, BACKUP_FORMAT_VERSION
        ));
    }
    if blob.header.record_count != blob.records.len() {
        return Err(format!(
            "backup declares {} records but contains {}",
            blob.header.record_count,
            blob.records.len()
        ));
    }
    let checksum = payload_checksum(&blob.records)?;
    if checksum != blob.header.checksum {
        return Err("backup checksum mismatch".to_string());
    }
    Ok(())
}
