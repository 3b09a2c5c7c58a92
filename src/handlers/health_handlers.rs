//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata index and blob store

use crate::services::archive_service::ArchiveService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;

/// `GET /healthz`
///
/// Liveness only. Never touches storage.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against the index and a write/read/delete probe against
/// the blob store. HTTP 200 when both pass, 503 otherwise.
pub async fn readyz(State(service): State<ArchiveService>) -> impl IntoResponse {
    let sqlite = CheckStatus::from_result(service.index_ready().await);
    let blobs = CheckStatus::from_result(service.blobs_ready().await);
    let overall_ok = sqlite.ok && blobs.ok;

    let mut checks = BTreeMap::new();
    checks.insert("sqlite", sqlite);
    checks.insert("blob_store", blobs);

    let body = ReadyResponse {
        status: (if overall_ok { "ok" } else { "error" }).to_string(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(err) => {
                tracing::warn!("readiness check failed: {}", err);
                Self {
                    ok: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
