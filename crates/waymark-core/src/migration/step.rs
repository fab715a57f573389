//! Migration steps.
//!
//! A step is an immutable descriptor: the version it upgrades the store to, a
//! human-readable description, whether it can be undone, and a
//! [`StepAction`] saying what it does. The set of actions is closed so adding
//! a new kind of transformation is checked exhaustively at every match.
//!
//! All actions are idempotent: executing a step against already-migrated data
//! leaves it unchanged.

use super::error::StepError;
use super::version::Version;
use crate::storage::{Record, RecordStore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// An equality test on a record field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMatch {
    /// Field name.
    pub field: String,
    /// Required value.
    pub value: Value,
}

impl FieldMatch {
    /// Create a field match.
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    fn matches(&self, record: &Record) -> bool {
        record.get(&self.field) == Some(&self.value)
    }
}

/// What a step does to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Populate a missing field with a default value.
    ///
    /// Rollback is lossy: it removes the field wherever it equals the
    /// default, including records that held that value before the step ran.
    DefaultField {
        /// Record kind.
        kind: String,
        /// Field to populate.
        field: String,
        /// Value for records missing the field.
        default: Value,
    },

    /// Move a field to a new name.
    ///
    /// A record already holding a different value under the new name fails
    /// the step before anything is written. When both names hold the same
    /// value the old one is dropped.
    RenameField {
        /// Record kind.
        kind: String,
        /// Old field name.
        from: String,
        /// New field name.
        to: String,
    },

    /// Store a normalized copy (trimmed, single-spaced, lowercase) of a text field.
    DeriveNormalized {
        /// Record kind.
        kind: String,
        /// Text field to read.
        source: String,
        /// Field receiving the normalized value.
        target: String,
    },

    /// Store on each parent the number of children referencing it.
    BackfillCount {
        /// Parent record kind.
        kind: String,
        /// Field receiving the count.
        field: String,
        /// Child record kind.
        child_kind: String,
        /// Child field holding the parent id.
        foreign_key: String,
        /// Only count children matching this, if set.
        filter: Option<FieldMatch>,
    },

    /// Rebuild one derived summary record per source record.
    ///
    /// Summaries are opaque (child count and a digest of child ids). Existing
    /// summaries are overwritten and stale ones removed, so this action has
    /// no inverse.
    ComputeAnalytics {
        /// Source record kind.
        source_kind: String,
        /// Child record kind.
        child_kind: String,
        /// Child field holding the source id.
        foreign_key: String,
        /// Kind the summaries are written as.
        output_kind: String,
    },
}

impl StepAction {
    /// Whether this action has an inverse.
    pub fn is_reversible(&self) -> bool {
        !matches!(self, StepAction::ComputeAnalytics { .. })
    }
}

/// One versioned unit of transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStep {
    target_version: Version,
    description: String,
    reversible: bool,
    action: StepAction,
}

impl MigrationStep {
    /// Create a step. Reversibility follows from the action.
    pub fn new(target_version: &str, description: impl Into<String>, action: StepAction) -> Self {
        Self {
            target_version: Version::parse(target_version),
            description: description.into(),
            reversible: action.is_reversible(),
            action,
        }
    }

    /// Mark the step as one-way even though its action has an inverse.
    pub fn irreversible(mut self) -> Self {
        self.reversible = false;
        self
    }

    /// Version the store is at after this step.
    pub fn target_version(&self) -> Version {
        self.target_version
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether [`rollback`](Self::rollback) is supported.
    pub fn is_reversible(&self) -> bool {
        self.reversible
    }

    /// The transformation.
    pub fn action(&self) -> &StepAction {
        &self.action
    }

    /// Apply the transformation. Returns the number of records written or removed.
    pub fn execute(&self, store: &dyn RecordStore) -> Result<usize, StepError> {
        match &self.action {
            StepAction::DefaultField {
                kind,
                field,
                default,
            } => {
                let mut changed = 0;
                for mut record in store.fetch_all(kind)? {
                    if !record.has(field) {
                        record.set(field.as_str(), default.clone());
                        store.insert(&record)?;
                        changed += 1;
                    }
                }
                Ok(changed)
            }

            StepAction::RenameField { kind, from, to } => {
                let records: Vec<Record> = store
                    .fetch_all(kind)?
                    .into_iter()
                    .filter(|r| r.has(from))
                    .collect();
                if let Some(conflict) = records
                    .iter()
                    .find(|r| r.has(to) && r.get(to) != r.get(from))
                {
                    return Err(StepError::InvalidRecord {
                        kind: kind.clone(),
                        id: conflict.id.clone(),
                        reason: format!("both '{}' and '{}' are set and differ", from, to),
                    });
                }

                let changed = records.len();
                for mut record in records {
                    if let Some(value) = record.remove(from) {
                        record.set(to.as_str(), value);
                        store.insert(&record)?;
                    }
                }
                Ok(changed)
            }

            StepAction::DeriveNormalized {
                kind,
                source,
                target,
            } => {
                let mut changed = 0;
                for mut record in store.fetch_all(kind)? {
                    let Some(normalized) = record.get_str(source).map(normalize_text) else {
                        continue;
                    };
                    if record.get_str(target) != Some(normalized.as_str()) {
                        record.set(target.as_str(), normalized);
                        store.insert(&record)?;
                        changed += 1;
                    }
                }
                Ok(changed)
            }

            StepAction::BackfillCount {
                kind,
                field,
                child_kind,
                foreign_key,
                filter,
            } => {
                let counts = child_counts(store, child_kind, foreign_key, filter.as_ref())?;
                let mut changed = 0;
                for mut record in store.fetch_all(kind)? {
                    let count = Value::from(counts.get(&record.id).copied().unwrap_or(0));
                    if record.get(field) != Some(&count) {
                        record.set(field.as_str(), count);
                        store.insert(&record)?;
                        changed += 1;
                    }
                }
                Ok(changed)
            }

            StepAction::ComputeAnalytics {
                source_kind,
                child_kind,
                foreign_key,
                output_kind,
            } => {
                let children = child_ids(store, child_kind, foreign_key)?;
                let sources = store.fetch_all(source_kind)?;
                let mut changed = 0;

                for source in &sources {
                    let summary = analytics_summary(output_kind, source, children.get(&source.id));
                    if store.get(output_kind, &source.id)?.as_ref() != Some(&summary) {
                        store.insert(&summary)?;
                        changed += 1;
                    }
                }

                for stale in store.fetch_all(output_kind)? {
                    if !sources.iter().any(|s| s.id == stale.id) {
                        store.delete(output_kind, &stale.id)?;
                        changed += 1;
                    }
                }
                Ok(changed)
            }
        }
    }

    /// Check, read-only, that [`execute`](Self::execute) achieved its goal.
    pub fn validate(&self, store: &dyn RecordStore) -> Result<bool, StepError> {
        match &self.action {
            StepAction::DefaultField { kind, field, .. } => {
                Ok(store.fetch_all(kind)?.iter().all(|r| r.has(field)))
            }

            StepAction::RenameField { kind, from, .. } => Ok(store
                .fetch_all(kind)?
                .iter()
                .all(|r| !r.fields.contains_key(from))),

            StepAction::DeriveNormalized {
                kind,
                source,
                target,
            } => Ok(store.fetch_all(kind)?.iter().all(|r| match r.get_str(source) {
                Some(text) => r.get_str(target) == Some(normalize_text(text).as_str()),
                None => true,
            })),

            StepAction::BackfillCount {
                kind,
                field,
                child_kind,
                foreign_key,
                filter,
            } => {
                let counts = child_counts(store, child_kind, foreign_key, filter.as_ref())?;
                Ok(store.fetch_all(kind)?.iter().all(|r| {
                    let expected = counts.get(&r.id).copied().unwrap_or(0);
                    r.get(field).and_then(Value::as_u64) == Some(expected)
                }))
            }

            StepAction::ComputeAnalytics {
                source_kind,
                child_kind,
                foreign_key,
                output_kind,
            } => {
                let children = child_ids(store, child_kind, foreign_key)?;
                for source in store.fetch_all(source_kind)? {
                    let expected = children.get(&source.id).map_or(0, Vec::len) as u64;
                    let actual = store
                        .get(output_kind, &source.id)?
                        .and_then(|s| s.get("child_count").and_then(Value::as_u64));
                    if actual != Some(expected) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Undo the transformation, best effort.
    ///
    /// Fails with [`StepError::NotReversible`] for one-way steps without
    /// touching the store.
    pub fn rollback(&self, store: &dyn RecordStore) -> Result<usize, StepError> {
        if !self.reversible {
            return Err(StepError::NotReversible {
                step: self.description.clone(),
            });
        }

        match &self.action {
            StepAction::DefaultField {
                kind,
                field,
                default,
            } => remove_field_where(store, kind, field, |v| v == default),

            StepAction::RenameField { kind, from, to } => {
                let mut changed = 0;
                for mut record in store.fetch_all(kind)? {
                    if let Some(value) = record.remove(to) {
                        record.set(from.as_str(), value);
                        store.insert(&record)?;
                        changed += 1;
                    }
                }
                Ok(changed)
            }

            StepAction::DeriveNormalized { kind, target, .. } => {
                remove_field_where(store, kind, target, |_| true)
            }

            StepAction::BackfillCount { kind, field, .. } => {
                remove_field_where(store, kind, field, |_| true)
            }

            StepAction::ComputeAnalytics { .. } => Err(StepError::NotReversible {
                step: self.description.clone(),
            }),
        }
    }
}

/// Trim, collapse internal whitespace, and lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Render a reference value as an id. Strings and numbers are accepted.
pub(crate) fn reference_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn child_counts(
    store: &dyn RecordStore,
    child_kind: &str,
    foreign_key: &str,
    filter: Option<&FieldMatch>,
) -> Result<HashMap<String, u64>, StepError> {
    let mut counts = HashMap::new();
    for child in store.fetch_all(child_kind)? {
        if filter.is_some_and(|f| !f.matches(&child)) {
            continue;
        }
        if let Some(parent) = child.get(foreign_key).and_then(reference_id) {
            *counts.entry(parent).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

fn child_ids(
    store: &dyn RecordStore,
    child_kind: &str,
    foreign_key: &str,
) -> Result<HashMap<String, Vec<String>>, StepError> {
    let mut ids: HashMap<String, Vec<String>> = HashMap::new();
    for child in store.fetch_all(child_kind)? {
        if let Some(parent) = child.get(foreign_key).and_then(reference_id) {
            ids.entry(parent).or_default().push(child.id);
        }
    }
    for list in ids.values_mut() {
        list.sort();
    }
    Ok(ids)
}

fn analytics_summary(output_kind: &str, source: &Record, children: Option<&Vec<String>>) -> Record {
    let children = children.map(Vec::as_slice).unwrap_or(&[]);
    let mut hasher = Sha256::new();
    hasher.update(source.id.as_bytes());
    for id in children {
        hasher.update([0u8]);
        hasher.update(id.as_bytes());
    }

    Record::new(output_kind, source.id.clone())
        .with_field("child_count", children.len() as u64)
        .with_field("digest", hex::encode(hasher.finalize()))
}

fn remove_field_where(
    store: &dyn RecordStore,
    kind: &str,
    field: &str,
    predicate: impl Fn(&Value) -> bool,
) -> Result<usize, StepError> {
    let mut changed = 0;
    for mut record in store.fetch_all(kind)? {
        if record.fields.get(field).is_some_and(&predicate) {
            record.remove(field);
            store.insert(&record)?;
            changed += 1;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageConfig, StorageEngine};
    use serde_json::json;

    fn test_store() -> StorageEngine {
        StorageEngine::open(StorageConfig::temporary()).unwrap()
    }

    fn seed_challenges(store: &StorageEngine) {
        store
            .insert(&Record::new("challenge", "c1").with_field("title", "  Daily   PUSHUPS "))
            .unwrap();
        store
            .insert(
                &Record::new("challenge", "c2")
                    .with_field("title", "Read")
                    .with_field("streak_count", 7),
            )
            .unwrap();
        for (id, challenge, done) in [("t1", "c1", true), ("t2", "c1", false), ("t3", "c2", true)] {
            store
                .insert(
                    &Record::new("task", id)
                        .with_field("challenge_id", challenge)
                        .with_field("completed", done),
                )
                .unwrap();
        }
    }

    fn default_streak() -> MigrationStep {
        MigrationStep::new(
            "1.1.0",
            "Default challenge streaks",
            StepAction::DefaultField {
                kind: "challenge".into(),
                field: "streak_count".into(),
                default: json!(0),
            },
        )
    }

    #[test]
    fn test_default_field_is_idempotent() {
        let store = test_store();
        seed_challenges(&store);
        let step = default_streak();

        assert!(!step.validate(&store).unwrap());
        assert_eq!(step.execute(&store).unwrap(), 1);
        assert!(step.validate(&store).unwrap());
        assert_eq!(step.execute(&store).unwrap(), 0);

        let c2 = store.get("challenge", "c2").unwrap().unwrap();
        assert_eq!(c2.get("streak_count"), Some(&json!(7)));
    }

    #[test]
    fn test_default_field_rollback_only_removes_defaults() {
        let store = test_store();
        seed_challenges(&store);
        let step = default_streak();
        step.execute(&store).unwrap();

        assert_eq!(step.rollback(&store).unwrap(), 1);
        assert!(!store.get("challenge", "c1").unwrap().unwrap().has("streak_count"));
        assert!(store.get("challenge", "c2").unwrap().unwrap().has("streak_count"));
    }

    #[test]
    fn test_rename_field_roundtrip() {
        let store = test_store();
        store
            .insert(&Record::new("photo", "p1").with_field("file", "a.jpg"))
            .unwrap();
        let step = MigrationStep::new(
            "1.1.0",
            "Rename photo file to path",
            StepAction::RenameField {
                kind: "photo".into(),
                from: "file".into(),
                to: "path".into(),
            },
        );

        step.execute(&store).unwrap();
        assert!(step.validate(&store).unwrap());
        assert_eq!(step.execute(&store).unwrap(), 0);
        let photo = store.get("photo", "p1").unwrap().unwrap();
        assert_eq!(photo.get_str("path"), Some("a.jpg"));

        step.rollback(&store).unwrap();
        let photo = store.get("photo", "p1").unwrap().unwrap();
        assert_eq!(photo.get_str("file"), Some("a.jpg"));
        assert!(!photo.has("path"));
    }

    #[test]
    fn test_rename_field_refuses_conflicting_target() {
        let store = test_store();
        store
            .insert(
                &Record::new("photo", "p1")
                    .with_field("file", "a.jpg")
                    .with_field("path", "a.jpg"),
            )
            .unwrap();
        store
            .insert(
                &Record::new("photo", "p2")
                    .with_field("file", "old.jpg")
                    .with_field("path", "new.jpg"),
            )
            .unwrap();
        let step = MigrationStep::new(
            "1.1.0",
            "Rename photo file to path",
            StepAction::RenameField {
                kind: "photo".into(),
                from: "file".into(),
                to: "path".into(),
            },
        );

        let err = step.execute(&store).unwrap_err();
        assert!(matches!(err, StepError::InvalidRecord { ref id, .. } if id == "p2"));

        // Nothing was written, so both values survive.
        let p1 = store.get("photo", "p1").unwrap().unwrap();
        assert_eq!(p1.get_str("file"), Some("a.jpg"));
        let p2 = store.get("photo", "p2").unwrap().unwrap();
        assert_eq!(p2.get_str("file"), Some("old.jpg"));
        assert_eq!(p2.get_str("path"), Some("new.jpg"));

        store.delete("photo", "p2").unwrap();
        assert_eq!(step.execute(&store).unwrap(), 1);
        let p1 = store.get("photo", "p1").unwrap().unwrap();
        assert!(!p1.has("file"));
        assert_eq!(p1.get_str("path"), Some("a.jpg"));
    }

    #[test]
    fn test_default_field_rollback_drops_preexisting_defaults() {
        let store = test_store();
        store
            .insert(&Record::new("challenge", "c1").with_field("streak_count", 0))
            .unwrap();
        store.insert(&Record::new("challenge", "c2")).unwrap();
        let step = default_streak();

        assert_eq!(step.execute(&store).unwrap(), 1);
        assert_eq!(step.rollback(&store).unwrap(), 2);
        for id in ["c1", "c2"] {
            assert!(!store.get("challenge", id).unwrap().unwrap().has("streak_count"));
        }
    }

    #[test]
    fn test_derive_normalized() {
        let store = test_store();
        seed_challenges(&store);
        let step = MigrationStep::new(
            "1.2.0",
            "Normalize challenge titles",
            StepAction::DeriveNormalized {
                kind: "challenge".into(),
                source: "title".into(),
                target: "title_key".into(),
            },
        );

        assert_eq!(step.execute(&store).unwrap(), 2);
        assert!(step.validate(&store).unwrap());
        let c1 = store.get("challenge", "c1").unwrap().unwrap();
        assert_eq!(c1.get_str("title_key"), Some("daily pushups"));
        assert_eq!(step.execute(&store).unwrap(), 0);
    }

    #[test]
    fn test_backfill_count_with_filter() {
        let store = test_store();
        seed_challenges(&store);
        let step = MigrationStep::new(
            "1.3.0",
            "Backfill completed task counts",
            StepAction::BackfillCount {
                kind: "challenge".into(),
                field: "completed_tasks".into(),
                child_kind: "task".into(),
                foreign_key: "challenge_id".into(),
                filter: Some(FieldMatch::new("completed", true)),
            },
        );

        step.execute(&store).unwrap();
        assert!(step.validate(&store).unwrap());
        let c1 = store.get("challenge", "c1").unwrap().unwrap();
        assert_eq!(c1.get("completed_tasks"), Some(&json!(1)));

        // A new completed task invalidates the aggregate until re-executed.
        store
            .insert(
                &Record::new("task", "t4")
                    .with_field("challenge_id", "c1")
                    .with_field("completed", true),
            )
            .unwrap();
        assert!(!step.validate(&store).unwrap());
        step.execute(&store).unwrap();
        assert!(step.validate(&store).unwrap());
    }

    #[test]
    fn test_compute_analytics_is_one_way() {
        let store = test_store();
        seed_challenges(&store);
        store
            .insert(&Record::new("analytics", "gone").with_field("child_count", 9))
            .unwrap();
        let step = MigrationStep::new(
            "1.4.0",
            "Compute challenge analytics",
            StepAction::ComputeAnalytics {
                source_kind: "challenge".into(),
                child_kind: "task".into(),
                foreign_key: "challenge_id".into(),
                output_kind: "analytics".into(),
            },
        );
        assert!(!step.is_reversible());

        step.execute(&store).unwrap();
        assert!(step.validate(&store).unwrap());
        assert!(store.get("analytics", "gone").unwrap().is_none());
        let summary = store.get("analytics", "c1").unwrap().unwrap();
        assert_eq!(summary.get("child_count"), Some(&json!(2)));
        assert_eq!(step.execute(&store).unwrap(), 0);

        let before = store.fetch_everything().unwrap();
        assert!(matches!(
            step.rollback(&store),
            Err(StepError::NotReversible { .. })
        ));
        assert_eq!(store.fetch_everything().unwrap(), before);
    }

    #[test]
    fn test_irreversible_override() {
        let store = test_store();
        let step = default_streak().irreversible();
        assert!(!step.is_reversible());
        assert!(matches!(
            step.rollback(&store),
            Err(StepError::NotReversible { .. })
        ));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Hello\t  World "), "hello world");
        assert_eq!(normalize_text(""), "");
    }
}
