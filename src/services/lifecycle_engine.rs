//! src/services/lifecycle_engine.rs
//!
//! The archive state machine: upload and version bump,
//! soft/temp/hard delete, restore, and single-archive reads.
//!
//! Ordering rules:
//! - New content is written to a fresh blob (tracked as a staged upload)
//!   before the metadata commit. The old blob is only removed after the
//!   commit lands.
//! - Every metadata write is conditional. Version bumps compare-and-swap on
//!   the head's `(version, state)` and change-log length; first versions
//!   rely on the identity key being unique. Losers get `Conflict` and must
//!   resolve the head again.

use crate::clock::Clock;
use crate::models::{
    archive::{Archive, ArchiveFields, IdentityKey, LifecycleState},
    staged_upload::StagedUpload,
};
use crate::services::{
    archive_error::{ArchiveError, ArchiveResult, StoreContext, StoreError},
    blob_store::{BlobMetadata, BlobStore, StoredBlob},
    history_tracker::HistoryTracker,
    metadata_index::{ExpectedRevision, MetadataIndex},
    version_resolver::{Resolution, VersionResolver},
};
use bytes::Bytes;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts for a state transition whose conditional write keeps missing.
const TRANSITION_ATTEMPTS: usize = 3;
/// Attempts for the metadata half of a hard delete once the blob is gone.
const HARD_DELETE_METADATA_ATTEMPTS: usize = 3;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    Soft,
    Temp,
    Hard,
}

impl DeleteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteMode::Soft => "soft",
            DeleteMode::Temp => "temp",
            DeleteMode::Hard => "hard",
        }
    }
}

impl FromStr for DeleteMode {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "soft" => Ok(DeleteMode::Soft),
            "temp" | "temporary" => Ok(DeleteMode::Temp),
            "hard" | "permanent" => Ok(DeleteMode::Hard),
            other => Err(ArchiveError::InvalidInput(format!(
                "unknown delete mode `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// How long a temp-deleted archive survives before reclamation.
    pub temp_delete_ttl: Duration,
    /// Whether a temp-deleted, not yet expired archive may be restored.
    pub allow_restore_from_temp: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            temp_delete_ttl: Duration::hours(24),
            allow_restore_from_temp: true,
        }
    }
}

pub struct LifecycleEngine {
    index: Arc<dyn MetadataIndex>,
    blobs: Arc<dyn BlobStore>,
    resolver: VersionResolver,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
}

impl LifecycleEngine {
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            resolver: VersionResolver::new(index.clone()),
            index,
            blobs,
            clock,
            policy,
        }
    }

    /// Millisecond precision, matching what the index persists.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    async fn load(&self, id: Uuid) -> ArchiveResult<Archive> {
        self.index
            .get(id)
            .await
            .context("load archive", id)?
            .ok_or_else(|| ArchiveError::NotFound(id.to_string()))
    }

    // ---------------------------------------------------------------------
    // Upload
    // ---------------------------------------------------------------------

    /// Store `content` as the next version of `key`.
    ///
    /// Creates version 1 when nothing holds the key, otherwise bumps the
    /// active head. A soft- or pending temp-deleted record blocks the key
    /// (`AlreadyDeleted`); an expired temp-delete is reclaimed first.
    pub async fn upload(
        &self,
        key: &IdentityKey,
        content: Bytes,
        fields: ArchiveFields,
        actor_id: &str,
    ) -> ArchiveResult<Archive> {
        let head = match self.resolver.resolve(key).await? {
            Resolution::Fresh => None,
            Resolution::Head(head) => Some(head),
            Resolution::Blocked(record) if record.is_expired(self.now()) => {
                self.reclaim_if_expired(&record).await?;
                None
            }
            Resolution::Blocked(record) => {
                return Err(ArchiveError::AlreadyDeleted(record.id.to_string()));
            }
        };

        let id = head.as_ref().map(|h| h.id).unwrap_or_else(Uuid::new_v4);
        let version = head.as_ref().map(|h| h.version + 1).unwrap_or(1);
        let (blob, staged_upload) = self.stage(key, id, version, content, &fields).await?;

        let now = self.now();
        let committed = match &head {
            None => {
                let archive = Archive {
                    id,
                    owner_id: key.owner_id.clone(),
                    name: key.name.clone(),
                    version: 1,
                    category: fields.category,
                    archive_type: fields.archive_type,
                    tags: fields.tags,
                    description: fields.description,
                    content_type: fields.content_type,
                    size_bytes: blob.size_bytes,
                    etag: blob.etag,
                    blob_ref: blob.blob_ref,
                    state: LifecycleState::Active,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                    expires_at: None,
                    change_log: vec![HistoryTracker::upload_entry(now, actor_id)],
                };
                self.commit_first(archive).await
            }
            Some(head) => {
                let mut change_log = head.change_log.clone();
                change_log.push(HistoryTracker::update_entry(now, actor_id, head, &fields));
                let archive = Archive {
                    id: head.id,
                    owner_id: head.owner_id.clone(),
                    name: head.name.clone(),
                    version,
                    category: fields.category,
                    archive_type: fields.archive_type,
                    tags: fields.tags,
                    description: fields.description,
                    content_type: fields.content_type,
                    size_bytes: blob.size_bytes,
                    etag: blob.etag,
                    blob_ref: blob.blob_ref,
                    state: LifecycleState::Active,
                    created_at: head.created_at,
                    updated_at: now,
                    deleted_at: None,
                    expires_at: None,
                    change_log,
                };
                self.commit_bump(archive, head).await
            }
        };

        match committed {
            Ok(archive) => {
                self.finish_staged(&staged_upload).await;
                if let Some(head) = &head {
                    if let Err(err) = self.blobs.delete(&head.blob_ref).await {
                        warn!(
                            archive_id = %archive.id,
                            blob_ref = %head.blob_ref,
                            "failed to delete superseded blob: {}",
                            err
                        );
                    }
                }
                info!(
                    archive_id = %archive.id,
                    version = archive.version,
                    owner_id = %archive.owner_id,
                    "archive version committed"
                );
                Ok(archive)
            }
            Err(err) => {
                self.discard_staged(&staged_upload).await;
                Err(err)
            }
        }
    }

    /// Retry `upload` on `Conflict`, re-resolving the head each time.
    pub async fn upload_with_retry(
        &self,
        key: &IdentityKey,
        content: Bytes,
        fields: ArchiveFields,
        actor_id: &str,
        max_attempts: usize,
    ) -> ArchiveResult<Archive> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .upload(key, content.clone(), fields.clone(), actor_id)
                .await
            {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    debug!(key = %key, attempt, "upload lost a version race, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Write the blob and record it as staged until the metadata commit.
    async fn stage(
        &self,
        key: &IdentityKey,
        id: Uuid,
        version: i64,
        content: Bytes,
        fields: &ArchiveFields,
    ) -> ArchiveResult<(StoredBlob, StagedUpload)> {
        let mut metadata = BlobMetadata::new();
        metadata.insert("archive_id".into(), id.to_string());
        metadata.insert("version".into(), version.to_string());
        metadata.insert("owner_id".into(), key.owner_id.clone());
        metadata.insert("category".into(), fields.category.clone());
        if let Some(content_type) = &fields.content_type {
            metadata.insert("content_type".into(), content_type.clone());
        }

        let blob = self
            .blobs
            .put(&key.name, content, metadata)
            .await
            .context("write blob", key)?;

        let staged = StagedUpload {
            id: Uuid::new_v4(),
            blob_ref: blob.blob_ref.clone(),
            owner_id: key.owner_id.clone(),
            name: key.name.clone(),
            initiated_at: self.now(),
        };
        if let Err(err) = self.index.insert_staged(&staged).await {
            if let Err(cleanup) = self.blobs.delete(&blob.blob_ref).await {
                warn!(blob_ref = %blob.blob_ref, "failed to remove unstaged blob: {}", cleanup);
            }
            return Err(ArchiveError::infra("stage upload", key, err));
        }

        Ok((blob, staged))
    }

    async fn commit_first(&self, archive: Archive) -> ArchiveResult<Archive> {
        let inserted = self
            .index
            .insert(&archive)
            .await
            .context("insert archive", archive.id)?;
        if !inserted {
            return Err(ArchiveError::Conflict {
                id: archive.id,
                expected_version: 0,
            });
        }
        Ok(archive)
    }

    async fn commit_bump(&self, archive: Archive, head: &Archive) -> ArchiveResult<Archive> {
        let swapped = self
            .index
            .compare_and_swap(&archive, ExpectedRevision::of(head))
            .await
            .context("commit version", archive.id)?;
        if !swapped {
            return Err(ArchiveError::Conflict {
                id: head.id,
                expected_version: head.version,
            });
        }
        Ok(archive)
    }

    /// The commit landed; the staging row is no longer needed.
    async fn finish_staged(&self, staged: &StagedUpload) {
        if let Err(err) = self.index.delete_staged(staged.id).await {
            warn!(staged_id = %staged.id, "failed to clear staging row: {}", err);
        }
    }

    /// The commit failed; drop the blob and its staging row.
    async fn discard_staged(&self, staged: &StagedUpload) {
        if let Err(err) = self.blobs.delete(&staged.blob_ref).await {
            warn!(blob_ref = %staged.blob_ref, "failed to discard staged blob: {}", err);
            return;
        }
        self.finish_staged(staged).await;
    }

    /// Remove an abandoned staging row and, unless a live archive points at
    /// it, its blob. Returns the number of blobs deleted.
    pub async fn reclaim_staged(&self, staged: &StagedUpload) -> ArchiveResult<usize> {
        let referenced = self
            .index
            .is_blob_referenced(&staged.blob_ref)
            .await
            .context("check blob reference", &staged.blob_ref)?;

        let mut deleted = 0;
        if !referenced {
            self.blobs
                .delete(&staged.blob_ref)
                .await
                .context("delete staged blob", &staged.blob_ref)?;
            deleted = 1;
        }
        self.index
            .delete_staged(staged.id)
            .await
            .context("delete staging row", staged.id)?;
        Ok(deleted)
    }

    // ---------------------------------------------------------------------
    // Delete / restore
    // ---------------------------------------------------------------------

    pub async fn delete(&self, id: Uuid, mode: DeleteMode, actor_id: &str) -> ArchiveResult<()> {
        let mut last_seen = 0;
        for _ in 0..TRANSITION_ATTEMPTS {
            let record = self.load(id).await?;
            last_seen = record.version;
            let now = self.now();
            let next = match (mode, record.state) {
                (DeleteMode::Hard, _) => return self.hard_delete(record).await,
                (DeleteMode::Soft, LifecycleState::Active) => {
                    let mut next = record.clone();
                    next.state = LifecycleState::SoftDeleted;
                    next.deleted_at = Some(now);
                    next.expires_at = None;
                    next.updated_at = now;
                    next.change_log.push(HistoryTracker::delete_entry(
                        now,
                        actor_id,
                        record.state,
                        LifecycleState::SoftDeleted,
                        None,
                    ));
                    next
                }
                (DeleteMode::Soft, LifecycleState::SoftDeleted)
                | (DeleteMode::Temp, LifecycleState::TempDeleted) => {
                    return Err(ArchiveError::AlreadyDeleted(id.to_string()));
                }
                (DeleteMode::Soft, LifecycleState::TempDeleted) => {
                    return Err(ArchiveError::DeleteNotAllowed {
                        id,
                        mode: mode.as_str(),
                        state: record.state.as_str(),
                    });
                }
                (DeleteMode::Temp, LifecycleState::Active | LifecycleState::SoftDeleted) => {
                    let expires_at = now + self.policy.temp_delete_ttl;
                    let mut next = record.clone();
                    next.state = LifecycleState::TempDeleted;
                    next.deleted_at = None;
                    next.expires_at = Some(expires_at);
                    next.updated_at = now;
                    next.change_log.push(HistoryTracker::delete_entry(
                        now,
                        actor_id,
                        record.state,
                        LifecycleState::TempDeleted,
                        Some(expires_at),
                    ));
                    next
                }
            };

            if self.transition(&next, &record).await? {
                info!(archive_id = %id, mode = mode.as_str(), "archive deleted");
                return Ok(());
            }
            debug!(archive_id = %id, "delete lost a race, re-reading");
        }

        Err(ArchiveError::Conflict {
            id,
            expected_version: last_seen,
        })
    }

    /// Remove blob then metadata. Irreversible.
    async fn hard_delete(&self, record: Archive) -> ArchiveResult<()> {
        self.blobs
            .delete(&record.blob_ref)
            .await
            .context("delete blob", record.id)?;

        let mut last_err: Option<StoreError> = None;
        for attempt in 1..=HARD_DELETE_METADATA_ATTEMPTS {
            match self.index.delete(record.id, ExpectedRevision::of(&record)).await {
                Ok(true) => {
                    info!(archive_id = %record.id, "archive permanently deleted");
                    return Ok(());
                }
                Ok(false) => {
                    return match self.index.get(record.id).await {
                        Ok(None) => Err(ArchiveError::NotFound(record.id.to_string())),
                        _ => Err(ArchiveError::Conflict {
                            id: record.id,
                            expected_version: record.version,
                        }),
                    };
                }
                Err(err) => {
                    warn!(
                        archive_id = %record.id,
                        attempt,
                        "metadata delete failed after blob removal: {}",
                        err
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(ArchiveError::infra(
            "delete archive metadata",
            record.id,
            last_err.unwrap_or_else(|| StoreError::Malformed("no attempt made".into())),
        ))
    }

    pub async fn restore(&self, id: Uuid, actor_id: &str) -> ArchiveResult<()> {
        let mut last_seen = 0;
        for _ in 0..TRANSITION_ATTEMPTS {
            let record = self.load(id).await?;
            last_seen = record.version;
            let now = self.now();
            match record.state {
                LifecycleState::Active => return Err(ArchiveError::NotDeleted(id)),
                LifecycleState::TempDeleted if record.is_expired(now) => {
                    return Err(ArchiveError::Expired(id));
                }
                LifecycleState::TempDeleted if !self.policy.allow_restore_from_temp => {
                    return Err(ArchiveError::RestoreNotAllowed(id));
                }
                LifecycleState::SoftDeleted | LifecycleState::TempDeleted => {}
            }

            let mut next = record.clone();
            next.state = LifecycleState::Active;
            next.deleted_at = None;
            next.expires_at = None;
            next.updated_at = now;
            next.change_log
                .push(HistoryTracker::restore_entry(now, actor_id, record.state));

            if self.transition(&next, &record).await? {
                info!(archive_id = %id, "archive restored");
                return Ok(());
            }
            debug!(archive_id = %id, "restore lost a race, re-reading");
        }

        Err(ArchiveError::Conflict {
            id,
            expected_version: last_seen,
        })
    }

    async fn transition(&self, next: &Archive, current: &Archive) -> ArchiveResult<bool> {
        self.index
            .compare_and_swap(next, ExpectedRevision::of(current))
            .await
            .context("update archive state", current.id)
    }

    /// Permanently remove `record` if it is still an expired temp-delete.
    ///
    /// The conditional metadata delete claims the record, so one restored in
    /// the meantime is left alone. The blob goes second and a failure there
    /// only leaves an orphan.
    pub async fn reclaim_if_expired(&self, record: &Archive) -> ArchiveResult<bool> {
        let claimed = self
            .index
            .delete_if_expired(record.id, self.now())
            .await
            .context("reclaim expired archive", record.id)?;
        if !claimed {
            return Ok(false);
        }

        if let Err(err) = self.blobs.delete(&record.blob_ref).await {
            warn!(
                archive_id = %record.id,
                blob_ref = %record.blob_ref,
                "expired archive removed but blob delete failed: {}",
                err
            );
        }
        info!(archive_id = %record.id, "expired archive reclaimed");
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Fetch an active archive with its content.
    pub async fn get(&self, id: Uuid) -> ArchiveResult<(Archive, Bytes)> {
        let record = self.load(id).await?;
        match record.state {
            LifecycleState::Active => {}
            LifecycleState::TempDeleted if record.is_expired(self.now()) => {
                return Err(ArchiveError::Expired(id));
            }
            LifecycleState::SoftDeleted | LifecycleState::TempDeleted => {
                return Err(ArchiveError::NotFound(id.to_string()));
            }
        }

        let (content, _) = self
            .blobs
            .get(&record.blob_ref)
            .await
            .context("read blob", id)?;
        Ok((record, content))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::blob_store::MemoryBlobStore;
    use crate::services::metadata_index::{SqliteMetadataIndex, test_support::memory_index};
    use chrono::TimeZone;

    pub struct Harness {
        pub engine: Arc<LifecycleEngine>,
        pub index: Arc<SqliteMetadataIndex>,
        pub blobs: Arc<MemoryBlobStore>,
        pub clock: Arc<ManualClock>,
    }

    pub async fn harness() -> Harness {
        let index = Arc::new(memory_index().await);
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap(),
        ));
        let engine = Arc::new(LifecycleEngine::new(
            index.clone(),
            blobs.clone(),
            clock.clone(),
            LifecyclePolicy::default(),
        ));
        Harness {
            engine,
            index,
            blobs,
            clock,
        }
    }

    pub fn fields(category: &str, tags: &[&str]) -> ArchiveFields {
        ArchiveFields {
            category: category.into(),
            archive_type: "pdf".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: String::new(),
            content_type: Some("application/pdf".into()),
        }
    }

    pub fn report_key() -> IdentityKey {
        IdentityKey::new("owner-1", "report.pdf")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{fields, harness, report_key};
    use super::*;
    use crate::models::history::{FieldChange, HistoryAction};
    use crate::services::archive_error::ErrorKind;
    use std::collections::BTreeSet;

    fn actions(archive: &Archive) -> Vec<HistoryAction> {
        archive.change_log.iter().map(|e| e.action).collect()
    }

    #[tokio::test]
    async fn first_upload_creates_version_one() {
        let h = harness().await;
        let archive = h
            .engine
            .upload(
                &report_key(),
                Bytes::from_static(b"v1"),
                fields("finance", &["q4"]),
                "owner-1",
            )
            .await
            .unwrap();

        assert_eq!(archive.version, 1);
        assert_eq!(archive.state, LifecycleState::Active);
        assert_eq!(archive.created_at, archive.updated_at);
        assert_eq!(actions(&archive), vec![HistoryAction::Upload]);
        assert!(h.blobs.contains(&archive.blob_ref));
        assert!(
            h.index
                .find_abandoned_staged(h.clock.now() + Duration::days(1), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn reupload_bumps_version_and_keeps_identity() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        h.clock.advance(Duration::minutes(5));
        let v2 = h
            .engine
            .upload(
                &report_key(),
                Bytes::from_static(b"v2"),
                fields("finance", &["q4", "draft"]),
                "editor-7",
            )
            .await
            .unwrap();

        assert_eq!(v2.id, v1.id);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.created_at, v1.created_at);
        assert!(v2.updated_at > v1.updated_at);
        assert_eq!(
            actions(&v2),
            vec![HistoryAction::Upload, HistoryAction::Update]
        );
        let update = &v2.change_log[1];
        assert_eq!(update.actor_id, "editor-7");
        assert_eq!(
            update.changes,
            vec![FieldChange::new("tags", vec!["q4"], vec!["q4", "draft"])]
        );

        assert!(!h.blobs.contains(&v1.blob_ref), "superseded blob removed");
        let (_, content) = h.engine.get(v1.id).await.unwrap();
        assert_eq!(&content[..], b"v2");
    }

    #[tokio::test]
    async fn blob_failure_leaves_metadata_untouched() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        h.blobs.fail_puts(true);
        let err = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v2"), fields("legal", &["q1"]), "owner-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);

        let stored = h.index.get(v1.id).await.unwrap().unwrap();
        assert_eq!(stored, v1);
    }

    #[tokio::test]
    async fn old_blob_delete_failure_is_not_fatal() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        h.blobs.fail_deletes(true);
        let v2 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v2"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert!(h.blobs.contains(&v1.blob_ref), "orphan left behind");
    }

    #[tokio::test]
    async fn bump_against_a_stale_head_is_a_conflict() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        let mut v2 = v1.clone();
        v2.version = 2;
        assert!(
            h.index
                .compare_and_swap(&v2, ExpectedRevision::of(&v1))
                .await
                .unwrap()
        );

        let mut racing = v1.clone();
        racing.version = 2;
        racing.category = "legal".into();
        let err = h.engine.commit_bump(racing, &v1).await.unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Conflict { id, expected_version: 1 } if id == v1.id
        ));
        assert_eq!(h.index.get(v1.id).await.unwrap().unwrap().category, "finance");
    }

    #[tokio::test]
    async fn bump_from_a_head_read_before_delete_and_restore_is_a_conflict() {
        let h = harness().await;
        let stale = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        h.engine.delete(stale.id, DeleteMode::Soft, "owner-1").await.unwrap();
        h.engine.restore(stale.id, "owner-1").await.unwrap();
        let current = h.index.get(stale.id).await.unwrap().unwrap();
        assert_eq!((current.version, current.state), (stale.version, stale.state));
        assert_eq!(current.change_log.len(), 3);

        let mut racing = stale.clone();
        racing.version = 2;
        racing.change_log.push(HistoryTracker::update_entry(
            h.clock.now(),
            "owner-2",
            &stale,
            &fields("legal", &["q4"]),
        ));
        let err = h.engine.commit_bump(racing, &stale).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let stored = h.index.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(
            actions(&stored),
            vec![HistoryAction::Upload, HistoryAction::Delete, HistoryAction::Restore]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_produce_gapless_versions() {
        let h = harness().await;
        const UPLOADS: usize = 8;

        let tasks = (0..UPLOADS).map(|i| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                loop {
                    let result = engine
                        .upload(
                            &report_key(),
                            Bytes::from(format!("content-{}", i)),
                            fields("finance", &["q4"]),
                            "owner-1",
                        )
                        .await;
                    match result {
                        Err(err) if err.is_retryable() => continue,
                        other => return other.map(|a| a.version),
                    }
                }
            })
        });

        let versions: Vec<i64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let distinct: BTreeSet<i64> = versions.iter().copied().collect();
        assert_eq!(distinct.len(), UPLOADS, "no version handed out twice");
        assert_eq!(distinct, (1..=UPLOADS as i64).collect::<BTreeSet<_>>());

        let head = h.index.find_by_identity(&report_key()).await.unwrap().unwrap();
        assert_eq!(head.version, UPLOADS as i64);
        assert_eq!(head.change_log.len(), UPLOADS);
        assert_eq!(h.blobs.len(), 1, "only the head's blob survives");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounded_retry_surfaces_conflicts_without_duplicates() {
        let h = harness().await;
        h.engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        let tasks = (0..6).map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .upload_with_retry(
                        &report_key(),
                        Bytes::from_static(b"next"),
                        fields("finance", &["q4"]),
                        "owner-1",
                        1,
                    )
                    .await
            })
        });

        let mut versions = Vec::new();
        for joined in futures::future::join_all(tasks).await {
            match joined.unwrap() {
                Ok(archive) => versions.push(archive.version),
                Err(err) => assert_eq!(err.kind(), ErrorKind::Conflict),
            }
        }
        versions.sort();
        let expected: Vec<i64> = (2..2 + versions.len() as i64).collect();
        assert_eq!(versions, expected);
    }

    #[tokio::test]
    async fn soft_delete_then_restore_round_trip() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        h.engine.delete(v1.id, DeleteMode::Soft, "owner-1").await.unwrap();
        let stored = h.index.get(v1.id).await.unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::SoftDeleted);
        assert_eq!(stored.deleted_at, Some(h.clock.now()));
        assert_eq!(h.engine.get(v1.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(h.blobs.contains(&v1.blob_ref), "soft delete keeps the blob");

        let again = h.engine.delete(v1.id, DeleteMode::Soft, "owner-1").await;
        assert_eq!(again.unwrap_err().kind(), ErrorKind::AlreadyDeleted);

        h.engine.restore(v1.id, "admin").await.unwrap();
        let restored = h.index.get(v1.id).await.unwrap().unwrap();
        assert_eq!(restored.state, LifecycleState::Active);
        assert_eq!(restored.deleted_at, None);
        assert_eq!(
            actions(&restored),
            vec![
                HistoryAction::Upload,
                HistoryAction::Delete,
                HistoryAction::Restore
            ]
        );
        assert_eq!(
            restored.change_log[2].changes,
            vec![FieldChange::new("status", "deleted", "active")]
        );

        let not_deleted = h.engine.restore(v1.id, "admin").await;
        assert_eq!(not_deleted.unwrap_err().kind(), ErrorKind::NotDeleted);
    }

    #[tokio::test]
    async fn temp_delete_sets_expiry_and_can_be_restored_before_it() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        h.engine.delete(v1.id, DeleteMode::Temp, "owner-1").await.unwrap();
        let stored = h.index.get(v1.id).await.unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::TempDeleted);
        assert_eq!(stored.expires_at, Some(h.clock.now() + Duration::hours(24)));
        assert_eq!(stored.change_log.len(), 2);

        assert_eq!(
            h.engine
                .delete(v1.id, DeleteMode::Temp, "owner-1")
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::AlreadyDeleted
        );
        assert_eq!(
            h.engine
                .delete(v1.id, DeleteMode::Soft, "owner-1")
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::DeleteNotAllowed
        );

        h.clock.advance(Duration::hours(23));
        h.engine.restore(v1.id, "owner-1").await.unwrap();
        let restored = h.index.get(v1.id).await.unwrap().unwrap();
        assert_eq!(restored.expires_at, None);
        assert_eq!(
            restored.change_log.last().unwrap().changes,
            vec![FieldChange::new("status", "temp_deleted", "active")]
        );
    }

    #[tokio::test]
    async fn expired_temp_delete_reads_as_expired() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        h.engine.delete(v1.id, DeleteMode::Temp, "owner-1").await.unwrap();
        h.clock.advance(Duration::hours(25));

        assert_eq!(h.engine.get(v1.id).await.unwrap_err().kind(), ErrorKind::Expired);
        assert_eq!(
            h.engine.restore(v1.id, "owner-1").await.unwrap_err().kind(),
            ErrorKind::Expired
        );
    }

    #[tokio::test]
    async fn restore_from_temp_can_be_disabled() {
        let h = harness().await;
        let engine = LifecycleEngine::new(
            h.index.clone(),
            h.blobs.clone(),
            h.clock.clone(),
            LifecyclePolicy {
                allow_restore_from_temp: false,
                ..LifecyclePolicy::default()
            },
        );
        let v1 = engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        engine.delete(v1.id, DeleteMode::Temp, "owner-1").await.unwrap();

        assert_eq!(
            engine.restore(v1.id, "owner-1").await.unwrap_err().kind(),
            ErrorKind::RestoreNotAllowed
        );
    }

    #[tokio::test]
    async fn hard_delete_is_irreversible() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        h.engine.delete(v1.id, DeleteMode::Hard, "owner-1").await.unwrap();
        assert!(!h.blobs.contains(&v1.blob_ref));
        assert!(h.index.get(v1.id).await.unwrap().is_none());

        for err in [
            h.engine.get(v1.id).await.map(|_| ()).unwrap_err(),
            h.engine.restore(v1.id, "owner-1").await.unwrap_err(),
            h.engine.delete(v1.id, DeleteMode::Hard, "owner-1").await.unwrap_err(),
            HistoryTracker::new(h.index.clone(), h.clock.clone())
                .history(v1.id)
                .await
                .unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }

        let fresh = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"new"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        assert_eq!(fresh.version, 1);
        assert_ne!(fresh.id, v1.id);
    }

    #[tokio::test]
    async fn hard_delete_keeps_metadata_when_blob_delete_fails() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();

        h.blobs.fail_deletes(true);
        let err = h.engine.delete(v1.id, DeleteMode::Hard, "owner-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(h.index.get(v1.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deleted_records_block_new_uploads_until_restored() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        h.engine.delete(v1.id, DeleteMode::Soft, "owner-1").await.unwrap();
        let blobs_before = h.blobs.len();

        let blocked = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v2"), fields("finance", &["q4"]), "owner-1")
            .await;
        assert_eq!(blocked.unwrap_err().kind(), ErrorKind::AlreadyDeleted);
        assert_eq!(h.blobs.len(), blobs_before, "nothing written for a blocked key");

        h.engine.restore(v1.id, "owner-1").await.unwrap();
        let v2 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v2"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.change_log.len(), 4);
    }

    #[tokio::test]
    async fn expired_temp_delete_is_reclaimed_by_a_new_upload() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        h.engine.delete(v1.id, DeleteMode::Temp, "owner-1").await.unwrap();
        h.clock.advance(Duration::hours(25));

        let fresh = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"new"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        assert_eq!(fresh.version, 1);
        assert_ne!(fresh.id, v1.id);
        assert!(!h.blobs.contains(&v1.blob_ref));
    }

    #[tokio::test]
    async fn reclaim_skips_records_restored_in_the_meantime() {
        let h = harness().await;
        let v1 = h
            .engine
            .upload(&report_key(), Bytes::from_static(b"v1"), fields("finance", &["q4"]), "owner-1")
            .await
            .unwrap();
        h.engine.delete(v1.id, DeleteMode::Temp, "owner-1").await.unwrap();
        let snapshot = h.index.get(v1.id).await.unwrap().unwrap();
        h.engine.restore(v1.id, "owner-1").await.unwrap();
        h.clock.advance(Duration::hours(25));

        assert!(!h.engine.reclaim_if_expired(&snapshot).await.unwrap());
        assert!(h.blobs.contains(&v1.blob_ref));
        assert!(h.engine.get(v1.id).await.is_ok());
    }

    #[test]
    fn delete_mode_parses_aliases() {
        assert_eq!("soft".parse::<DeleteMode>().unwrap(), DeleteMode::Soft);
        assert_eq!("temporary".parse::<DeleteMode>().unwrap(), DeleteMode::Temp);
        assert_eq!("PERMANENT".parse::<DeleteMode>().unwrap(), DeleteMode::Hard);
        assert_eq!(
            "shred".parse::<DeleteMode>().unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
