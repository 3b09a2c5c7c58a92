//! Upload validation applied before anything reaches the engine.

use crate::models::archive::{ArchiveFields, IdentityKey};
use crate::services::archive_error::{ArchiveError, ArchiveResult};

const MAX_NAME_LEN: usize = 255;

/// Limits enforced on every upload.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_tags: usize,
    pub max_upload_bytes: usize,
    /// Empty means any content type is accepted.
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_tags: 5,
            max_upload_bytes: 3 * 1024 * 1024,
            allowed_content_types: vec!["application/pdf".into()],
        }
    }
}

/// Trim, drop empties, and de-duplicate while keeping first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !normalized.iter().any(|seen| seen == tag) {
            normalized.push(tag.to_string());
        }
    }
    normalized
}

/// Reject names that are empty, too long, or path-like.
pub fn ensure_name_safe(name: &str) -> ArchiveResult<()> {
    if name.trim().is_empty() {
        return Err(ArchiveError::InvalidInput("name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ArchiveError::InvalidInput(format!(
            "name must be at most {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(ArchiveError::InvalidInput(
            "name must not contain path separators".into(),
        ));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ArchiveError::InvalidInput(
            "name must not contain control characters".into(),
        ));
    }
    Ok(())
}

impl UploadPolicy {
    /// Validate an upload and return its fields with tags normalized.
    pub fn validate(
        &self,
        key: &IdentityKey,
        fields: ArchiveFields,
        content_len: usize,
    ) -> ArchiveResult<ArchiveFields> {
        if key.owner_id.trim().is_empty() {
            return Err(ArchiveError::InvalidInput("owner id is required".into()));
        }
        ensure_name_safe(&key.name)?;

        if content_len == 0 {
            return Err(ArchiveError::InvalidInput("content is empty".into()));
        }
        if content_len > self.max_upload_bytes {
            return Err(ArchiveError::InvalidInput(format!(
                "content exceeds {} bytes",
                self.max_upload_bytes
            )));
        }

        if !self.allowed_content_types.is_empty() {
            let allowed = fields
                .content_type
                .as_deref()
                .map(|ct| {
                    self.allowed_content_types
                        .iter()
                        .any(|candidate| candidate.eq_ignore_ascii_case(ct))
                })
                .unwrap_or(false);
            if !allowed {
                return Err(ArchiveError::InvalidInput(format!(
                    "content type {:?} is not allowed",
                    fields.content_type
                )));
            }
        }

        let category = fields.category.trim().to_string();
        if category.is_empty() {
            return Err(ArchiveError::InvalidCategoryOrTags(
                "category is required".into(),
            ));
        }
        let archive_type = fields.archive_type.trim().to_string();
        if archive_type.is_empty() {
            return Err(ArchiveError::InvalidInput("type is required".into()));
        }

        let tags = normalize_tags(&fields.tags);
        if tags.is_empty() {
            return Err(ArchiveError::InvalidCategoryOrTags(
                "at least one tag is required".into(),
            ));
        }
        if tags.len() > self.max_tags {
            return Err(ArchiveError::InvalidCategoryOrTags(format!(
                "at most {} tags are allowed",
                self.max_tags
            )));
        }

        Ok(ArchiveFields {
            category,
            archive_type,
            tags,
            description: fields.description.trim().to_string(),
            content_type: fields.content_type,
        })
    }
}
