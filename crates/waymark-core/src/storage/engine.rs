//! Storage engine implementation.

use super::{Record, RecordStore, StorageConfig};
use crate::error::Error;
use sled::{Db, Tree};

/// Tree name for record data.
const DATA_TREE: &str = "data";

/// Tree name for the kind index.
const KIND_INDEX_TREE: &str = "index:kind";

/// The record store wrapping sled.
pub struct StorageEngine {
    /// The underlying sled database.
    db: Db,

    /// Tree for records (kind + id -> record).
    data_tree: Tree,

    /// Tree for known kinds (kind -> empty).
    kind_index_tree: Tree,
}

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let data_tree = db.open_tree(DATA_TREE)?;
        let kind_index_tree = db.open_tree(KIND_INDEX_TREE)?;

        Ok(Self {
            db,
            data_tree,
            kind_index_tree,
        })
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Number of records of a kind.
    pub fn count(&self, kind: &str) -> usize {
        self.data_tree.scan_prefix(kind_prefix(kind)).count()
    }

    /// Get the underlying sled database.
    pub fn db(&self) -> &Db {
        &self.db
    }
}

impl RecordStore for StorageEngine {
    fn fetch_all(&self, kind: &str) -> Result<Vec<Record>, Error> {
        let mut records = Vec::new();
        for result in self.data_tree.scan_prefix(kind_prefix(kind)) {
            let (_, value) = result?;
            records.push(Record::from_bytes(&value)?);
        }
        Ok(records)
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Record>, Error> {
        match self.data_tree.get(record_key(kind, id))? {
            Some(bytes) => Ok(Some(Record::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert(&self, record: &Record) -> Result<(), Error> {
        if record.kind.is_empty() || record.kind.contains('\0') {
            return Err(Error::InvalidData(format!(
                "invalid record kind {:?}",
                record.kind
            )));
        }
        let value = record.to_bytes()?;
        self.data_tree
            .insert(record_key(&record.kind, &record.id), value)?;
        self.kind_index_tree
            .insert(record.kind.as_bytes(), &[])?;
        Ok(())
    }

    fn delete(&self, kind: &str, id: &str) -> Result<bool, Error> {
        Ok(self.data_tree.remove(record_key(kind, id))?.is_some())
    }

    fn kinds(&self) -> Result<Vec<String>, Error> {
        let mut kinds = Vec::new();
        for result in self.kind_index_tree.iter() {
            let (key, _) = result?;
            let kind = String::from_utf8(key.to_vec()).map_err(|_| Error::InvalidKey)?;
            kinds.push(kind);
        }
        Ok(kinds)
    }

    fn clear(&self) -> Result<(), Error> {
        self.data_tree.clear()?;
        self.kind_index_tree.clear()?;
        Ok(())
    }

    fn save(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    fn size_on_disk(&self) -> Result<u64, Error> {
        Ok(self.db.size_on_disk()?)
    }
}

/// Key layout: `kind \0 id`.
fn record_key(kind: &str, id: &str) -> Vec<u8> {
    let mut key = kind_prefix(kind);
    key.extend_from_slice(id.as_bytes());
    key
}

fn kind_prefix(kind: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(kind.len() + 1);
    prefix.extend_from_slice(kind.as_bytes());
    prefix.push(0); // Null separator
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> StorageEngine {
        StorageEngine::open(StorageConfig::temporary()).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let engine = test_engine();
        let record = Record::new("task", "t1").with_field("title", "Stretch");

        engine.insert(&record).unwrap();

        let retrieved = engine.get("task", "t1").unwrap().unwrap();
        assert_eq!(retrieved, record);
        assert!(engine.get("task", "missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_overwrites() {
        let engine = test_engine();
        engine
            .insert(&Record::new("task", "t1").with_field("title", "old"))
            .unwrap();
        engine
            .insert(&Record::new("task", "t1").with_field("title", "new"))
            .unwrap();

        assert_eq!(engine.count("task"), 1);
        let record = engine.get("task", "t1").unwrap().unwrap();
        assert_eq!(record.get_str("title"), Some("new"));
    }

    #[test]
    fn test_fetch_all_is_scoped_to_kind() {
        let engine = test_engine();
        engine.insert(&Record::new("task", "t1")).unwrap();
        engine.insert(&Record::new("task", "t2")).unwrap();
        engine.insert(&Record::new("tasks", "t3")).unwrap();
        engine.insert(&Record::new("challenge", "c1")).unwrap();

        assert_eq!(engine.fetch_all("task").unwrap().len(), 2);
        assert_eq!(engine.fetch_all("tasks").unwrap().len(), 1);
        assert_eq!(engine.fetch_all("photo").unwrap().len(), 0);

        let mut kinds = engine.kinds().unwrap();
        kinds.sort();
        assert_eq!(kinds, vec!["challenge", "task", "tasks"]);
    }

    #[test]
    fn test_delete_and_clear() {
        let engine = test_engine();
        engine.insert(&Record::new("task", "t1")).unwrap();
        engine.insert(&Record::new("task", "t2")).unwrap();

        assert!(engine.delete("task", "t1").unwrap());
        assert!(!engine.delete("task", "t1").unwrap());
        assert_eq!(engine.count("task"), 1);

        engine.clear().unwrap();
        assert_eq!(engine.count("task"), 0);
        assert!(engine.kinds().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_invalid_kind() {
        let engine = test_engine();
        assert!(matches!(
            engine.insert(&Record::new("", "x")),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path());

        {
            let engine = StorageEngine::open(config.clone()).unwrap();
            engine
                .insert(&Record::new("photo", "p1").with_field("path", "p1.jpg"))
                .unwrap();
            engine.save().unwrap();
        }

        {
            let engine = StorageEngine::open(config).unwrap();
            let record = engine.get("photo", "p1").unwrap().unwrap();
            assert_eq!(record.get_str("path"), Some("p1.jpg"));
        }
    }
}
