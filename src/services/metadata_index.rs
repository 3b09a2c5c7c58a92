//! src/services/metadata_index.rs
//!
//! The metadata index is the single source of truth for archive lifecycle
//! state. Every write that can race is conditional: first versions are
//! guarded by the `(owner_id, name)` uniqueness constraint and later writes
//! by a compare-and-swap on `(id, version, state)` plus the change-log
//! length. The log only grows, so its length acts as a write counter and a
//! delete followed by a restore still invalidates an older read.
//!
//! [`SqliteMetadataIndex`] stores timestamps as Unix milliseconds and the tag
//! set and change log as JSON text, decoding each row into a typed
//! [`Archive`] so malformed data surfaces as an error rather than a panic.

use crate::models::{
    archive::{Archive, IdentityKey, LifecycleState},
    history::HistoryEntry,
    staged_upload::StagedUpload,
};
use crate::services::archive_error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The stored revision a conditional write expects to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedRevision {
    pub version: i64,
    pub state: LifecycleState,
    /// Number of change-log entries the stored record holds.
    pub log_entries: i64,
}

impl ExpectedRevision {
    pub fn of(archive: &Archive) -> Self {
        Self {
            version: archive.version,
            state: archive.state,
            log_entries: archive.change_log.len() as i64,
        }
    }
}

/// Filters for the active view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveFilter {
    All,
    Category(String),
    /// Every listed tag must be present.
    Tags(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Coerce `page` to at least 1 and clamp `page_size` to `[1, 100]`.
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.page_size as i64
    }
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Point lookup in any persisted state.
    async fn get(&self, id: Uuid) -> StoreResult<Option<Archive>>;

    /// The record currently holding `key`, in any persisted state.
    async fn find_by_identity(&self, key: &IdentityKey) -> StoreResult<Option<Archive>>;

    /// Insert a first version. Returns `false` if the identity key is taken.
    async fn insert(&self, archive: &Archive) -> StoreResult<bool>;

    /// Replace the record iff it still matches `expected`.
    async fn compare_and_swap(
        &self,
        archive: &Archive,
        expected: ExpectedRevision,
    ) -> StoreResult<bool>;

    /// Remove the record iff it still matches `expected`.
    async fn delete(&self, id: Uuid, expected: ExpectedRevision) -> StoreResult<bool>;

    /// Remove the record iff it is still temp-deleted with an expiry at or before `now`.
    async fn delete_if_expired(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Records for the given ids in any persisted state, unordered.
    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Archive>>;

    /// Active records matching `filter`, newest update first, plus the total match count.
    async fn query_active(
        &self,
        filter: &ArchiveFilter,
        page: PageRequest,
    ) -> StoreResult<(Vec<Archive>, i64)>;

    /// Temp-deleted records whose expiry is at or before `now`.
    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Archive>>;

    async fn is_blob_referenced(&self, blob_ref: &str) -> StoreResult<bool>;

    async fn insert_staged(&self, staged: &StagedUpload) -> StoreResult<()>;

    async fn delete_staged(&self, id: Uuid) -> StoreResult<bool>;

    /// Staged uploads initiated before `cutoff`.
    async fn find_abandoned_staged(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<StagedUpload>>;

    async fn health_check(&self) -> StoreResult<()>;
}

const ARCHIVE_COLUMNS: &str = "id, owner_id, name, version, category, archive_type, tags, \
     description, content_type, size_bytes, etag, blob_ref, state, created_at, updated_at, \
     deleted_at, expires_at, change_log";

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(FromRow, Debug)]
struct ArchiveRow {
    id: String,
    owner_id: String,
    name: String,
    version: i64,
    category: String,
    archive_type: String,
    tags: String,
    description: String,
    content_type: Option<String>,
    size_bytes: i64,
    etag: String,
    blob_ref: String,
    state: String,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
    expires_at: Option<i64>,
    change_log: String,
}

#[derive(FromRow, Debug)]
struct StagedUploadRow {
    id: String,
    blob_ref: String,
    owner_id: String,
    name: String,
    initiated_at: i64,
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Malformed(format!("timestamp {} out of range", ms)))
}

fn parse_id(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| StoreError::Malformed(format!("id `{}`: {}", raw, err)))
}

impl TryFrom<ArchiveRow> for Archive {
    type Error = StoreError;

    fn try_from(row: ArchiveRow) -> StoreResult<Self> {
        let tags: Vec<String> = serde_json::from_str(&row.tags)?;
        let change_log: Vec<HistoryEntry> = serde_json::from_str(&row.change_log)?;
        let state = row
            .state
            .parse::<LifecycleState>()
            .map_err(StoreError::Malformed)?;

        Ok(Archive {
            id: parse_id(&row.id)?,
            owner_id: row.owner_id,
            name: row.name,
            version: row.version,
            category: row.category,
            archive_type: row.archive_type,
            tags,
            description: row.description,
            content_type: row.content_type,
            size_bytes: row.size_bytes,
            etag: row.etag,
            blob_ref: row.blob_ref,
            state,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            deleted_at: row.deleted_at.map(from_millis).transpose()?,
            expires_at: row.expires_at.map(from_millis).transpose()?,
            change_log,
        })
    }
}

impl TryFrom<StagedUploadRow> for StagedUpload {
    type Error = StoreError;

    fn try_from(row: StagedUploadRow) -> StoreResult<Self> {
        Ok(StagedUpload {
            id: parse_id(&row.id)?,
            blob_ref: row.blob_ref,
            owner_id: row.owner_id,
            name: row.name,
            initiated_at: from_millis(row.initiated_at)?,
        })
    }
}

fn decode_all(rows: Vec<ArchiveRow>) -> StoreResult<Vec<Archive>> {
    rows.into_iter().map(Archive::try_from).collect()
}

/// SQLite-backed metadata index.
#[derive(Clone)]
pub struct SqliteMetadataIndex {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema statement by statement. Safe to re-run.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    fn push_active_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ArchiveFilter) {
        builder.push(" WHERE state = ");
        builder.push_bind(LifecycleState::Active.as_str());

        match filter {
            ArchiveFilter::All => {}
            ArchiveFilter::Category(category) => {
                builder.push(" AND category = ");
                builder.push_bind(category.clone());
            }
            ArchiveFilter::Tags(tags) => {
                builder.push(
                    " AND (SELECT COUNT(DISTINCT j.value) FROM json_each(archives.tags) AS j \
                     WHERE j.value IN (",
                );
                let mut separated = builder.separated(", ");
                for tag in tags {
                    separated.push_bind(tag.clone());
                }
                separated.push_unseparated(")) = ");
                builder.push_bind(tags.len() as i64);
            }
        }
    }
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn get(&self, id: Uuid) -> StoreResult<Option<Archive>> {
        let row = sqlx::query_as::<_, ArchiveRow>(&format!(
            "SELECT {} FROM archives WHERE id = ?",
            ARCHIVE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&*self.db)
        .await?;

        row.map(Archive::try_from).transpose()
    }

    async fn find_by_identity(&self, key: &IdentityKey) -> StoreResult<Option<Archive>> {
        let row = sqlx::query_as::<_, ArchiveRow>(&format!(
            "SELECT {} FROM archives WHERE owner_id = ? AND name = ?",
            ARCHIVE_COLUMNS
        ))
        .bind(&key.owner_id)
        .bind(&key.name)
        .fetch_optional(&*self.db)
        .await?;

        row.map(Archive::try_from).transpose()
    }

    async fn insert(&self, archive: &Archive) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO archives ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_id, name) DO NOTHING",
            ARCHIVE_COLUMNS
        ))
        .bind(archive.id.to_string())
        .bind(&archive.owner_id)
        .bind(&archive.name)
        .bind(archive.version)
        .bind(&archive.category)
        .bind(&archive.archive_type)
        .bind(serde_json::to_string(&archive.tags)?)
        .bind(&archive.description)
        .bind(archive.content_type.clone())
        .bind(archive.size_bytes)
        .bind(&archive.etag)
        .bind(&archive.blob_ref)
        .bind(archive.state.as_str())
        .bind(to_millis(archive.created_at))
        .bind(to_millis(archive.updated_at))
        .bind(archive.deleted_at.map(to_millis))
        .bind(archive.expires_at.map(to_millis))
        .bind(serde_json::to_string(&archive.change_log)?)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(
        &self,
        archive: &Archive,
        expected: ExpectedRevision,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE archives SET
                version = ?, category = ?, archive_type = ?, tags = ?, description = ?,
                content_type = ?, size_bytes = ?, etag = ?, blob_ref = ?, state = ?,
                updated_at = ?, deleted_at = ?, expires_at = ?, change_log = ?
             WHERE id = ? AND version = ? AND state = ? AND json_array_length(change_log) = ?",
        )
        .bind(archive.version)
        .bind(&archive.category)
        .bind(&archive.archive_type)
        .bind(serde_json::to_string(&archive.tags)?)
        .bind(&archive.description)
        .bind(archive.content_type.clone())
        .bind(archive.size_bytes)
        .bind(&archive.etag)
        .bind(&archive.blob_ref)
        .bind(archive.state.as_str())
        .bind(to_millis(archive.updated_at))
        .bind(archive.deleted_at.map(to_millis))
        .bind(archive.expires_at.map(to_millis))
        .bind(serde_json::to_string(&archive.change_log)?)
        .bind(archive.id.to_string())
        .bind(expected.version)
        .bind(expected.state.as_str())
        .bind(expected.log_entries)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid, expected: ExpectedRevision) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM archives
             WHERE id = ? AND version = ? AND state = ? AND json_array_length(change_log) = ?",
        )
        .bind(id.to_string())
        .bind(expected.version)
        .bind(expected.state.as_str())
        .bind(expected.log_entries)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_expired(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM archives
             WHERE id = ? AND state = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(id.to_string())
        .bind(LifecycleState::TempDeleted.as_str())
        .bind(to_millis(now))
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Archive>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM archives WHERE id IN (",
            ARCHIVE_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        let rows: Vec<ArchiveRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        decode_all(rows)
    }

    async fn query_active(
        &self,
        filter: &ArchiveFilter,
        page: PageRequest,
    ) -> StoreResult<(Vec<Archive>, i64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM archives");
        Self::push_active_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&*self.db).await?;

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM archives", ARCHIVE_COLUMNS));
        Self::push_active_filter(&mut builder, filter);
        builder.push(" ORDER BY updated_at DESC, id ASC LIMIT ");
        builder.push_bind(page.page_size as i64);
        builder.push(" OFFSET ");
        builder.push_bind(page.offset());

        let rows: Vec<ArchiveRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok((decode_all(rows)?, total))
    }

    async fn find_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Archive>> {
        let rows = sqlx::query_as::<_, ArchiveRow>(&format!(
            "SELECT {} FROM archives
             WHERE state = ? AND expires_at IS NOT NULL AND expires_at <= ?
             ORDER BY expires_at ASC LIMIT ?",
            ARCHIVE_COLUMNS
        ))
        .bind(LifecycleState::TempDeleted.as_str())
        .bind(to_millis(now))
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        decode_all(rows)
    }

    async fn is_blob_referenced(&self, blob_ref: &str) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archives WHERE blob_ref = ?")
            .bind(blob_ref)
            .fetch_one(&*self.db)
            .await?;
        Ok(count > 0)
    }

    async fn insert_staged(&self, staged: &StagedUpload) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO staged_uploads (id, blob_ref, owner_id, name, initiated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(staged.id.to_string())
        .bind(&staged.blob_ref)
        .bind(&staged.owner_id)
        .bind(&staged.name)
        .bind(to_millis(staged.initiated_at))
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_staged(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM staged_uploads WHERE id = ?")
            .bind(id.to_string())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_abandoned_staged(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<StagedUpload>> {
        let rows = sqlx::query_as::<_, StagedUploadRow>(
            "SELECT id, blob_ref, owner_id, name, initiated_at FROM staged_uploads
             WHERE initiated_at < ? ORDER BY initiated_at ASC LIMIT ?",
        )
        .bind(to_millis(cutoff))
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter().map(StagedUpload::try_from).collect()
    }

    async fn health_check(&self) -> StoreResult<()> {
        let value: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if value != 1 {
            return Err(StoreError::Malformed(format!(
                "unexpected health check result: {}",
                value
            )));
        }
        Ok(())
    }
}
