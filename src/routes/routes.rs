//! Defines routes for archive operations.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `POST   /archives` (multipart upload, creates or bumps a version)
//!   - `GET    /archives` (active archives, paginated)
//!   - `GET    /archives/list?id=..` (lookup by ids)
//!   - `GET    /archives/category/{category}`
//!   - `GET    /archives/tags?tags=a,b`
//!
//! - **Archive endpoints**
//!   - `GET    /archives/{id}` (metadata), `GET /download/{id}` (content)
//!   - `DELETE /archives/{id}?type=soft|temp|hard`, `DELETE /archives/{id}/permanent`
//!   - `POST   /archives/{id}/restore`, `GET /archives/{id}/history`
//!
//! Static segments such as `/archives/list` take precedence over `/archives/{id}`.

use crate::{
    handlers::{
        archive_handlers::{
            archive_history, delete_archive, delete_archive_permanently, download_archive,
            get_archive, list_archives, list_by_category, list_by_ids, list_by_tags,
            restore_archive, upload_archive,
        },
        health_handlers::{healthz, readyz},
    },
    services::archive_service::ArchiveService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Multipart framing on top of the largest accepted file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router for all archive routes.
///
/// `max_upload_bytes` bounds request bodies so oversized uploads are refused
/// before they are buffered.
pub fn routes(max_upload_bytes: usize) -> Router<ArchiveService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Collection routes
        .route("/archives", post(upload_archive).get(list_archives))
        .route("/archives/list", get(list_by_ids))
        .route("/archives/tags", get(list_by_tags))
        .route("/archives/category/{category}", get(list_by_category))
        // Archive routes
        .route("/archives/{id}", get(get_archive).delete(delete_archive))
        .route("/archives/{id}/permanent", delete(delete_archive_permanently))
        .route("/archives/{id}/restore", post(restore_archive))
        .route("/archives/{id}/history", get(archive_history))
        .route("/download/{id}", get(download_archive))
        .layer(DefaultBodyLimit::max(
            max_upload_bytes.saturating_add(MULTIPART_OVERHEAD),
        ))
}
