//! Finds the current head for an identity key.

use crate::models::archive::{Archive, IdentityKey, LifecycleState};
use crate::services::{
    archive_error::{ArchiveResult, StoreContext},
    metadata_index::MetadataIndex,
};
use std::sync::Arc;

/// What an upload under a given identity key will build on.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Nothing holds the key; the upload starts a new chain at version 1.
    Fresh,
    /// The active head the upload bumps.
    Head(Archive),
    /// A soft- or temp-deleted record still holds the key.
    Blocked(Archive),
}

#[derive(Clone)]
pub struct VersionResolver {
    index: Arc<dyn MetadataIndex>,
}

impl VersionResolver {
    pub fn new(index: Arc<dyn MetadataIndex>) -> Self {
        Self { index }
    }

    /// Classify the record holding `key`, matching on exact equality.
    pub async fn resolve(&self, key: &IdentityKey) -> ArchiveResult<Resolution> {
        let record = self
            .index
            .find_by_identity(key)
            .await
            .context("resolve head", key)?;

        Ok(match record {
            None => Resolution::Fresh,
            Some(archive) if archive.state == LifecycleState::Active => Resolution::Head(archive),
            Some(archive) => Resolution::Blocked(archive),
        })
    }

    /// The active head for `key`, excluding every deleted state.
    pub async fn resolve_head(&self, key: &IdentityKey) -> ArchiveResult<Option<Archive>> {
        Ok(match self.resolve(key).await? {
            Resolution::Head(archive) => Some(archive),
            Resolution::Fresh | Resolution::Blocked(_) => None,
        })
    }
}
