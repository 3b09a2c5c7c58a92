//! Represents an archive: a named, owned, versioned document whose bytes live
//! in the blob store.

use crate::models::history::HistoryEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Persisted lifecycle states. A hard-deleted archive has no record at all.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    SoftDeleted,
    TempDeleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::SoftDeleted => "soft_deleted",
            LifecycleState::TempDeleted => "temp_deleted",
        }
    }

    /// Status label recorded in history entries.
    pub fn status_label(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::SoftDeleted => "deleted",
            LifecycleState::TempDeleted => "temp_deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(LifecycleState::Active),
            "soft_deleted" => Ok(LifecycleState::SoftDeleted),
            "temp_deleted" => Ok(LifecycleState::TempDeleted),
            other => Err(format!("unknown lifecycle state `{}`", other)),
        }
    }
}

/// The logical key grouping every version of "the same" document.
///
/// Only the owner and the name take part in matching; category, type and
/// tags are ordinary versioned fields.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub owner_id: String,
    pub name: String,
}

impl IdentityKey {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.name)
    }
}

/// Caller-supplied, versioned fields of an upload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveFields {
    pub category: String,
    #[serde(rename = "type")]
    pub archive_type: String,
    pub tags: Vec<String>,
    pub description: String,
    pub content_type: Option<String>,
}

/// The full archive record as held by the metadata index.
///
/// `id` is assigned at version 1 and never changes; `blob_ref` always points
/// at the bytes of the current version.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Archive {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub version: i64,
    pub category: String,
    #[serde(rename = "type")]
    pub archive_type: String,
    pub tags: Vec<String>,
    pub description: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub etag: String,
    pub blob_ref: String,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Oldest entry first.
    pub change_log: Vec<HistoryEntry>,
}

impl Archive {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.owner_id.clone(), self.name.clone())
    }

    pub fn fields(&self) -> ArchiveFields {
        ArchiveFields {
            category: self.category.clone(),
            archive_type: self.archive_type.clone(),
            tags: self.tags.clone(),
            description: self.description.clone(),
            content_type: self.content_type.clone(),
        }
    }

    /// True once a temp-deleted archive has outlived its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == LifecycleState::TempDeleted
            && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn summary(&self) -> ArchiveSummary {
        ArchiveSummary {
            id: self.id,
            name: self.name.clone(),
            size_bytes: self.size_bytes,
            size_mb: format_size_mb(self.size_bytes),
            category: self.category.clone(),
            archive_type: self.archive_type.clone(),
            tags: self.tags.clone(),
            description: self.description.clone(),
            owner_id: self.owner_id.clone(),
            version: self.version,
            content_type: self.content_type.clone(),
            etag: self.etag.clone(),
            state: self.state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            expires_at: self.expires_at,
        }
    }
}

/// Outward view of an archive, without blob internals or history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ArchiveSummary {
    pub id: Uuid,
    pub name: String,
    pub size_bytes: i64,
    pub size_mb: String,
    pub category: String,
    #[serde(rename = "type")]
    pub archive_type: String,
    pub tags: Vec<String>,
    pub description: String,
    pub owner_id: String,
    pub version: i64,
    pub content_type: Option<String>,
    pub etag: String,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Render a byte count as megabytes with two decimals, e.g. `"1.50 MB"`.
pub fn format_size_mb(size_bytes: i64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    format!("{:.2} MB", size_bytes as f64 / MB)
}
