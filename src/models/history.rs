//! Change-log entries recorded on every mutating archive operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Upload,
    Update,
    Delete,
    Restore,
}

/// A single field that changed, with its value before and after.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

impl FieldChange {
    pub fn new(field: impl Into<String>, old_value: impl Into<Value>, new_value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            old_value: old_value.into(),
            new_value: new_value.into(),
        }
    }
}

/// One append-only record in an archive's change log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    pub actor_id: String,
    pub changes: Vec<FieldChange>,
}

impl HistoryEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        action: HistoryAction,
        actor_id: impl Into<String>,
        changes: Vec<FieldChange>,
    ) -> Self {
        Self {
            timestamp,
            action,
            actor_id: actor_id.into(),
            changes,
        }
    }
}
