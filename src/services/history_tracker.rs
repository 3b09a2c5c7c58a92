//! Field-level change history.
//!
//! Entries are built here and appended by the lifecycle engine as part of the
//! same conditional write that changes the record, so history can never drift
//! from state. Reads are a newest-first projection of the stored log.

use crate::clock::Clock;
use crate::models::{
    archive::{Archive, ArchiveFields, LifecycleState},
    history::{FieldChange, HistoryAction, HistoryEntry},
};
use crate::services::{
    archive_error::{ArchiveError, ArchiveResult, StoreContext},
    metadata_index::MetadataIndex,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{collections::BTreeSet, sync::Arc};
use uuid::Uuid;

#[derive(Clone)]
pub struct HistoryTracker {
    index: Arc<dyn MetadataIndex>,
    clock: Arc<dyn Clock>,
}

impl HistoryTracker {
    pub fn new(index: Arc<dyn MetadataIndex>, clock: Arc<dyn Clock>) -> Self {
        Self { index, clock }
    }

    /// The change log of `id`, newest entry first.
    ///
    /// Soft- and temp-deleted archives keep a readable history; an expired
    /// temp-delete reports `Expired` and a missing record `NotFound`.
    pub async fn history(&self, id: Uuid) -> ArchiveResult<Vec<HistoryEntry>> {
        let archive = self
            .index
            .get(id)
            .await
            .context("load archive history", id)?
            .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?;

        if archive.is_expired(self.clock.now()) {
            return Err(ArchiveError::Expired(id));
        }
        Ok(Self::newest_first(&archive))
    }

    pub fn newest_first(archive: &Archive) -> Vec<HistoryEntry> {
        archive.change_log.iter().rev().cloned().collect()
    }

    /// Compare the versioned fields of `previous` against `next`.
    ///
    /// `name` is part of the identity key and never appears here. Tags are
    /// compared as sets; reordering alone is not a change.
    pub fn diff(previous: &Archive, next: &ArchiveFields) -> Vec<FieldChange> {
        let mut changes = Vec::new();

        if previous.category != next.category {
            changes.push(FieldChange::new(
                "category",
                previous.category.clone(),
                next.category.clone(),
            ));
        }
        if previous.archive_type != next.archive_type {
            changes.push(FieldChange::new(
                "type",
                previous.archive_type.clone(),
                next.archive_type.clone(),
            ));
        }
        if previous.description != next.description {
            changes.push(FieldChange::new(
                "description",
                previous.description.clone(),
                next.description.clone(),
            ));
        }

        let old_tags: BTreeSet<&str> = previous.tags.iter().map(String::as_str).collect();
        let new_tags: BTreeSet<&str> = next.tags.iter().map(String::as_str).collect();
        if old_tags != new_tags {
            changes.push(FieldChange::new(
                "tags",
                previous.tags.clone(),
                next.tags.clone(),
            ));
        }

        changes
    }

    pub fn upload_entry(now: DateTime<Utc>, actor_id: &str) -> HistoryEntry {
        HistoryEntry::new(now, HistoryAction::Upload, actor_id, Vec::new())
    }

    pub fn update_entry(
        now: DateTime<Utc>,
        actor_id: &str,
        previous: &Archive,
        next: &ArchiveFields,
    ) -> HistoryEntry {
        HistoryEntry::new(
            now,
            HistoryAction::Update,
            actor_id,
            Self::diff(previous, next),
        )
    }

    pub fn delete_entry(
        now: DateTime<Utc>,
        actor_id: &str,
        from: LifecycleState,
        to: LifecycleState,
        expires_at: Option<DateTime<Utc>>,
    ) -> HistoryEntry {
        let mut changes = vec![FieldChange::new(
            "status",
            from.status_label(),
            to.status_label(),
        )];
        if let Some(expires_at) = expires_at {
            changes.push(FieldChange::new(
                "expires_at",
                serde_json::Value::Null,
                json!(expires_at),
            ));
        }
        HistoryEntry::new(now, HistoryAction::Delete, actor_id, changes)
    }

    pub fn restore_entry(now: DateTime<Utc>, actor_id: &str, from: LifecycleState) -> HistoryEntry {
        HistoryEntry::new(
            now,
            HistoryAction::Restore,
            actor_id,
            vec![FieldChange::new(
                "status",
                from.status_label(),
                LifecycleState::Active.status_label(),
            )],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn head(tags: &[&str]) -> Archive {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Archive {
            id: Uuid::new_v4(),
            owner_id: "owner-1".into(),
            name: "report.pdf".into(),
            version: 1,
            category: "finance".into(),
            archive_type: "pdf".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: "q4 numbers".into(),
            content_type: None,
            size_bytes: 1,
            etag: String::new(),
            blob_ref: String::new(),
            state: LifecycleState::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            expires_at: None,
            change_log: vec![HistoryTracker::upload_entry(now, "owner-1")],
        }
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let previous = head(&["q4"]);
        let mut next = previous.fields();
        next.tags = vec!["q4".into(), "draft".into()];

        let changes = HistoryTracker::diff(&previous, &next);
        assert_eq!(
            changes,
            vec![FieldChange::new("tags", vec!["q4"], vec!["q4", "draft"])]
        );
    }

    #[test]
    fn diff_treats_tags_as_a_set() {
        let previous = head(&["q4", "draft"]);
        let mut next = previous.fields();
        next.tags = vec!["draft".into(), "q4".into()];
        assert!(HistoryTracker::diff(&previous, &next).is_empty());
    }

    #[test]
    fn diff_covers_category_type_and_description() {
        let previous = head(&["q4"]);
        let next = ArchiveFields {
            category: "legal".into(),
            archive_type: "contract".into(),
            tags: vec!["q4".into()],
            description: String::new(),
            content_type: None,
        };
        let fields: Vec<String> = HistoryTracker::diff(&previous, &next)
            .into_iter()
            .map(|c| c.field)
            .collect();
        assert_eq!(fields, vec!["category", "type", "description"]);
    }

    #[test]
    fn history_is_exposed_newest_first() {
        let mut archive = head(&["q4"]);
        let later = archive.created_at + chrono::Duration::minutes(1);
        archive.change_log.push(HistoryTracker::delete_entry(
            later,
            "owner-1",
            LifecycleState::Active,
            LifecycleState::SoftDeleted,
            None,
        ));

        let entries = HistoryTracker::newest_first(&archive);
        assert_eq!(entries[0].action, HistoryAction::Delete);
        assert_eq!(entries[1].action, HistoryAction::Upload);
        assert_eq!(archive.change_log[0].action, HistoryAction::Upload);
    }

    #[test]
    fn restore_entry_records_the_status_change() {
        let now = Utc::now();
        let entry = HistoryTracker::restore_entry(now, "admin", LifecycleState::SoftDeleted);
        assert_eq!(entry.action, HistoryAction::Restore);
        assert_eq!(
            entry.changes,
            vec![FieldChange::new("status", "deleted", "active")]
        );
    }
}
