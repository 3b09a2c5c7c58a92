//! Represents a blob written ahead of its metadata commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A staging session for one upload.
///
/// The row exists from the moment the blob is written until the metadata
/// commit either lands or loses its race. Rows that outlive the staging
/// threshold were abandoned and are reclaimed in the background.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StagedUpload {
    /// Staging session id.
    pub id: Uuid,

    /// Blob written for this upload.
    pub blob_ref: String,

    /// Owner of the pending archive.
    pub owner_id: String,

    /// Name of the pending archive.
    pub name: String,

    /// Timestamp when the blob was staged.
    pub initiated_at: DateTime<Utc>,
}
