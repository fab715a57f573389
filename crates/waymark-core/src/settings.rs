//! Settings store holding the persisted version marker.
//!
//! Lives in its own sled database so the marker survives independently of
//! the main record store, including while the store is mid-migration or being
//! restored from a backup.

use crate::error::Error;
use crate::storage::StorageConfig;
use sled::{Db, Tree};

/// Tree name for settings.
const SETTINGS_TREE: &str = "settings";

/// Key of the last successfully applied migration version.
pub const LAST_MIGRATION_VERSION_KEY: &str = "last_migration_version";

/// Access to the persisted "last migration version" marker.
pub trait VersionRecord: Send + Sync {
    /// The last applied version, if any run has ever completed.
    fn last_migration_version(&self) -> Result<Option<String>, Error>;

    /// Persist the last applied version.
    fn set_last_migration_version(&self, version: &str) -> Result<(), Error>;
}

/// sled-backed key-value settings store.
pub struct SettingsStore {
    db: Db,
    tree: Tree,
}

impl SettingsStore {
    /// Open or create the settings store.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let tree = db.open_tree(SETTINGS_TREE)?;
        Ok(Self { db, tree })
    }

    /// Get a string setting.
    pub fn get_string(&self, key: &str) -> Result<Option<String>, Error> {
        match self.tree.get(key)? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| Error::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Set a string setting and flush it.
    pub fn set_string(&self, key: &str, value: &str) -> Result<(), Error> {
        self.tree.insert(key, value.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    /// Remove a setting.
    pub fn remove(&self, key: &str) -> Result<(), Error> {
        self.tree.remove(key)?;
        Ok(())
    }

    /// Get the underlying sled database (for opening the run journal).
    pub fn db(&self) -> &Db {
        &self.db
    }
}

impl VersionRecord for SettingsStore {
    fn last_migration_version(&self) -> Result<Option<String>, Error> {
        self.get_string(LAST_MIGRATION_VERSION_KEY)
    }

    fn set_last_migration_version(&self, version: &str) -> Result<(), Error> {
        self.set_string(LAST_MIGRATION_VERSION_KEY, version)
    }
}
