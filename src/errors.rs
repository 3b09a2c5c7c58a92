use crate::services::archive_error::{ArchiveError, ErrorKind, StoreError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Map engine failures onto HTTP statuses.
///
/// Infrastructure details are logged and replaced by a generic message so
/// store internals never reach the client.
impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::AlreadyDeleted | ErrorKind::NotDeleted => {
                StatusCode::CONFLICT
            }
            ErrorKind::Expired => StatusCode::GONE,
            ErrorKind::InvalidCategoryOrTags | ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::DeleteNotAllowed | ErrorKind::RestoreNotAllowed => StatusCode::FORBIDDEN,
            ErrorKind::Infrastructure => {
                tracing::error!("request failed: {}", err);
                return match &err {
                    ArchiveError::Infrastructure {
                        operation,
                        source: StoreError::DeadlineExceeded(_),
                        ..
                    } => AppError::new(
                        StatusCode::SERVICE_UNAVAILABLE,
                        format!("{} timed out", operation),
                    ),
                    _ => AppError::internal("internal storage error"),
                };
            }
        };
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn lifecycle_errors_map_to_client_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (ArchiveError::NotFound(id.to_string()), StatusCode::NOT_FOUND),
            (
                ArchiveError::Conflict {
                    id,
                    expected_version: 2,
                },
                StatusCode::CONFLICT,
            ),
            (ArchiveError::Expired(id), StatusCode::GONE),
            (ArchiveError::RestoreNotAllowed(id), StatusCode::FORBIDDEN),
            (
                ArchiveError::InvalidCategoryOrTags("no tags".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn infrastructure_details_stay_server_side() {
        let err = ArchiveError::infra(
            "read blob",
            "abc",
            StoreError::Malformed("secret path /var/data".into()),
        );
        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!app.message.contains("/var/data"));

        let slow = ArchiveError::infra(
            "upload",
            "deadline",
            StoreError::DeadlineExceeded(std::time::Duration::from_secs(1)),
        );
        assert_eq!(AppError::from(slow).status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
