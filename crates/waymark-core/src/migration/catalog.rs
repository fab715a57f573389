//! The ordered step catalog and step selection.

use super::step::{FieldMatch, MigrationStep, StepAction};
use super::version::{is_greater, Version};
use serde_json::json;

/// Version of the data shape this release expects.
pub const CURRENT_VERSION: &str = "1.4.0";

/// A fixed, ordered list of migration steps.
#[derive(Debug, Clone, Default)]
pub struct StepCatalog {
    steps: Vec<MigrationStep>,
}

impl StepCatalog {
    /// Create a catalog from steps in declaration order.
    pub fn new(steps: Vec<MigrationStep>) -> Self {
        Self { steps }
    }

    /// All steps in declaration order.
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps that take a store from `from` to `to`, in ascending version order.
    ///
    /// A step applies when its version is greater than `from` and not greater
    /// than `to`. Steps sharing a version keep their declaration order.
    pub fn applicable(&self, from: &str, to: &str) -> Vec<&MigrationStep> {
        let mut selected: Vec<&MigrationStep> = self
            .steps
            .iter()
            .filter(|step| {
                let version = step.target_version().to_string();
                is_greater(&version, from) && !is_greater(&version, to)
            })
            .collect();
        selected.sort_by_key(|step| step.target_version());
        selected
    }

    /// Steps already applied at `at` that lie above `floor`, newest first.
    pub fn applied_above(&self, floor: &str, at: &str) -> Vec<&MigrationStep> {
        let mut selected = self.applicable(floor, at);
        selected.reverse();
        selected
    }

    /// The highest version any step targets.
    pub fn latest_version(&self) -> Option<Version> {
        self.steps.iter().map(MigrationStep::target_version).max()
    }
}

/// The catalog shipped with this release.
///
/// Challenges gain a streak counter, a normalized title key and a completed
/// task count; the last step rebuilds per-challenge analytics.
pub fn default_catalog() -> StepCatalog {
    StepCatalog::new(vec![
        MigrationStep::new(
            "1.1.0",
            "Default missing challenge streak counters",
            StepAction::DefaultField {
                kind: "challenge".into(),
                field: "streak_count".into(),
                default: json!(0),
            },
        ),
        MigrationStep::new(
            "1.2.0",
            "Normalize task title keys",
            StepAction::DeriveNormalized {
                kind: "task".into(),
                source: "title".into(),
                target: "title_key".into(),
            },
        ),
        MigrationStep::new(
            "1.2.5",
            "Rename photo file to path",
            StepAction::RenameField {
                kind: "photo".into(),
                from: "file".into(),
                to: "path".into(),
            },
        ),
        MigrationStep::new(
            "1.3.0",
            "Backfill completed task counts",
            StepAction::BackfillCount {
                kind: "challenge".into(),
                field: "completed_tasks".into(),
                child_kind: "task".into(),
                foreign_key: "challenge_id".into(),
                filter: Some(FieldMatch::new("completed", true)),
            },
        ),
        MigrationStep::new(
            "1.4.0",
            "Compute challenge analytics",
            StepAction::ComputeAnalytics {
                source_kind: "challenge".into(),
                child_kind: "task".into(),
                foreign_key: "challenge_id".into(),
                output_kind: "analytics".into(),
            },
        ),
    ])
}
