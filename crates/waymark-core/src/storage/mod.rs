//! Storage layer for Waymark.
//!
//! The migration engine only needs CRUD-style access to the host's records:
//! fetch-all-of-kind, get, insert, delete and save. [`RecordStore`] is that
//! boundary; [`StorageEngine`] is the sled-backed implementation.

mod config;
mod engine;
mod record;

pub mod key;

pub use config::StorageConfig;
pub use engine::StorageEngine;
pub use record::Record;

use crate::error::Error;

/// CRUD access to a persisted record store.
///
/// Implementations must be usable from a freshly opened handle; callers hold
/// no cursors or transactions across calls.
pub trait RecordStore: Send + Sync {
    /// Fetch every record of a kind.
    fn fetch_all(&self, kind: &str) -> Result<Vec<Record>, Error>;

    /// Fetch a single record.
    fn get(&self, kind: &str, id: &str) -> Result<Option<Record>, Error>;

    /// Insert or replace a record.
    fn insert(&self, record: &Record) -> Result<(), Error>;

    /// Delete a record. Returns whether it existed.
    fn delete(&self, kind: &str, id: &str) -> Result<bool, Error>;

    /// All kinds that have ever held a record.
    fn kinds(&self) -> Result<Vec<String>, Error>;

    /// Remove every record.
    fn clear(&self) -> Result<(), Error>;

    /// Flush pending writes to durable storage.
    fn save(&self) -> Result<(), Error>;

    /// Approximate size on disk in bytes.
    fn size_on_disk(&self) -> Result<u64, Error>;

    /// Fetch every record of every kind, ordered by kind then id.
    fn fetch_everything(&self) -> Result<Vec<Record>, Error> {
        let mut kinds = self.kinds()?;
        kinds.sort();
        let mut records = Vec::new();
        for kind in kinds {
            let mut batch = self.fetch_all(&kind)?;
            batch.sort_by(|a, b| a.id.cmp(&b.id));
            records.extend(batch);
        }
        Ok(records)
    }
}
