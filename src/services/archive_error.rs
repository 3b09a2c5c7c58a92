//! Error taxonomy of the archive engine.
//!
//! Every failure maps to a stable [`ErrorKind`] so outer layers can translate
//! it without depending on store-specific error types.

use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by the backing stores themselves.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("blob `{0}` not found")]
    BlobNotFound(String),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(std::time::Duration),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive `{0}` not found")]
    NotFound(String),
    #[error("archive `{id}` was modified concurrently (expected version {expected_version})")]
    Conflict { id: Uuid, expected_version: i64 },
    #[error("archive `{0}` already deleted")]
    AlreadyDeleted(String),
    #[error("archive `{0}` is not deleted")]
    NotDeleted(Uuid),
    #[error("{mode} delete not allowed for archive `{id}` in state {state}")]
    DeleteNotAllowed {
        id: Uuid,
        mode: &'static str,
        state: &'static str,
    },
    #[error("restore not allowed for archive `{0}`")]
    RestoreNotAllowed(Uuid),
    #[error("invalid category or tags: {0}")]
    InvalidCategoryOrTags(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("archive `{0}` has expired")]
    Expired(Uuid),
    #[error("{operation} failed for `{target}`: {source}")]
    Infrastructure {
        operation: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },
}

/// Stable, store-independent classification of an [`ArchiveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AlreadyDeleted,
    NotDeleted,
    DeleteNotAllowed,
    RestoreNotAllowed,
    InvalidCategoryOrTags,
    InvalidInput,
    Expired,
    Infrastructure,
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::NotFound(_) => ErrorKind::NotFound,
            ArchiveError::Conflict { .. } => ErrorKind::Conflict,
            ArchiveError::AlreadyDeleted(_) => ErrorKind::AlreadyDeleted,
            ArchiveError::NotDeleted(_) => ErrorKind::NotDeleted,
            ArchiveError::DeleteNotAllowed { .. } => ErrorKind::DeleteNotAllowed,
            ArchiveError::RestoreNotAllowed(_) => ErrorKind::RestoreNotAllowed,
            ArchiveError::InvalidCategoryOrTags(_) => ErrorKind::InvalidCategoryOrTags,
            ArchiveError::InvalidInput(_) => ErrorKind::InvalidInput,
            ArchiveError::Expired(_) => ErrorKind::Expired,
            ArchiveError::Infrastructure { .. } => ErrorKind::Infrastructure,
        }
    }

    /// Only lost optimistic races are worth retrying with a fresh head.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn infra(operation: &'static str, target: impl ToString, source: StoreError) -> Self {
        ArchiveError::Infrastructure {
            operation,
            target: target.to_string(),
            source,
        }
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Attach operation context to a store result.
pub(crate) trait StoreContext<T> {
    fn context(self, operation: &'static str, target: impl ToString) -> ArchiveResult<T>;
}

impl<T> StoreContext<T> for StoreResult<T> {
    fn context(self, operation: &'static str, target: impl ToString) -> ArchiveResult<T> {
        self.map_err(|err| ArchiveError::infra(operation, target, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = ArchiveError::Conflict {
            id: Uuid::new_v4(),
            expected_version: 1,
        };
        assert!(conflict.is_retryable());
        assert!(!ArchiveError::NotFound("x".into()).is_retryable());
        assert!(
            !ArchiveError::infra("get", "x", StoreError::BlobNotFound("x".into())).is_retryable()
        );
    }

    #[test]
    fn infrastructure_errors_carry_operation_context() {
        let err: ArchiveResult<()> =
            Err(StoreError::Malformed("bad tags".into())).context("load archive", "abc");
        let err = err.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(
            err.to_string(),
            "load archive failed for `abc`: malformed record: bad tags"
        );
    }
}
