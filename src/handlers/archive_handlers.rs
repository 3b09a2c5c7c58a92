//! HTTP handlers for archive operations.
//! Parses requests into engine calls on `ArchiveService` and shapes the
//! JSON envelopes clients expect.

use crate::{
    errors::AppError,
    models::archive::{ArchiveFields, ArchiveSummary, IdentityKey},
    services::{
        archive_service::{ArchiveContent, ArchiveService},
        lifecycle_engine::DeleteMode,
        query_service::ArchivePage,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, RawQuery, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Header carrying the caller's identity; also recorded as the history actor.
pub const OWNER_HEADER: &str = "x-owner-id";

const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    fn resolve(&self) -> (u32, u32) {
        (
            self.page.unwrap_or(1),
            self.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct TagsQuery {
    pub tags: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(rename = "type")]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_data: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct PagedResponse {
    pub data: Vec<ArchiveSummary>,
    pub pagination: Pagination,
}

impl From<ArchivePage> for PagedResponse {
    fn from(page: ArchivePage) -> Self {
        let total_pages = page.total_pages();
        Self {
            pagination: Pagination {
                page: page.page,
                limit: page.page_size,
                total_data: page.total,
                total_pages,
            },
            data: page.items,
        }
    }
}

fn owner_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| AppError::bad_request(format!("missing {} header", OWNER_HEADER)))
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::bad_request(format!("invalid archive id `{}`", raw)))
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// POST `/archives`: multipart upload of a new archive or a new version.
///
/// Fields: `file` (required; its filename is the archive name), `category`,
/// `type`, `tags` (comma separated or repeated) and `description`.
pub async fn upload_archive(
    State(service): State<ArchiveService>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let owner = owner_id(&headers)?;
    let mut fields = ArchiveFields::default();
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                fields.content_type = field.content_type().map(String::from);
                let content = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(format!("reading file: {}", err)))?;
                file = Some((file_name, content));
            }
            "category" | "type" | "tags" | "description" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("reading {}: {}", name, err)))?;
                match name.as_str() {
                    "category" => fields.category = value,
                    "type" => fields.archive_type = value,
                    "tags" => fields.tags.extend(split_list(&value)),
                    _ => fields.description = value,
                }
            }
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let (file_name, content) = file.ok_or_else(|| AppError::bad_request("file is required"))?;
    let summary = service
        .upload(IdentityKey::new(owner, file_name), content, fields)
        .await?;

    Ok((StatusCode::CREATED, Json(summary)))
}

/// GET `/archives`: active archives, newest first.
pub async fn list_archives(
    State(service): State<ArchiveService>,
    Query(q): Query<PageQuery>,
) -> Result<Json<PagedResponse>, AppError> {
    let (page, limit) = q.resolve();
    let page = service.list(page, limit).await?;
    Ok(Json(page.into()))
}

/// GET `/archives/list?id=..`: ids may repeat or be comma separated.
pub async fn list_by_ids(
    State(service): State<ArchiveService>,
    RawQuery(query): RawQuery,
) -> Result<impl IntoResponse, AppError> {
    let ids: Vec<String> = query
        .as_deref()
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "id")
        .flat_map(|(_, value)| {
            split_list(&value.replace("%2C", ",").replace("%2c", ",")).collect::<Vec<_>>()
        })
        .collect();

    if ids.is_empty() {
        return Err(AppError::bad_request("at least one id is required"));
    }

    let data = service.get_by_ids(&ids).await?;
    Ok(Json(json!({ "count": data.len(), "data": data })))
}

/// GET `/archives/category/{category}`
pub async fn list_by_category(
    State(service): State<ArchiveService>,
    Path(category): Path<String>,
    Query(q): Query<PageQuery>,
) -> Result<Json<PagedResponse>, AppError> {
    let (page, limit) = q.resolve();
    let page = service.get_by_category(&category, page, limit).await?;
    Ok(Json(page.into()))
}

/// GET `/archives/tags?tags=a,b`: archives carrying every listed tag.
pub async fn list_by_tags(
    State(service): State<ArchiveService>,
    Query(q): Query<TagsQuery>,
) -> Result<Json<PagedResponse>, AppError> {
    let tags: Vec<String> = q.tags.as_deref().map(split_list).into_iter().flatten().collect();
    let page = service
        .get_by_tags(
            &tags,
            q.page.unwrap_or(1),
            q.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(page.into()))
}

/// GET `/archives/{id}`: metadata only.
pub async fn get_archive(
    State(service): State<ArchiveService>,
    Path(id): Path<String>,
) -> Result<Json<ArchiveSummary>, AppError> {
    let summary = service.describe(parse_id(&id)?).await?;
    Ok(Json(summary))
}

/// GET `/download/{id}`: the current version's bytes.
pub async fn download_archive(
    State(service): State<ArchiveService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let archive = service.get(parse_id(&id)?).await?;
    let mut response = Response::new(Body::empty());
    set_archive_headers(response.headers_mut(), &archive);
    *response.body_mut() = Body::from(archive.content);
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// DELETE `/archives/{id}?type=soft|temp|hard`: soft unless told otherwise.
pub async fn delete_archive(
    State(service): State<ArchiveService>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(q): Query<DeleteQuery>,
) -> Result<impl IntoResponse, AppError> {
    let actor = owner_id(&headers)?;
    let mode = match q.mode.as_deref() {
        Some(raw) => raw.parse::<DeleteMode>()?,
        None => DeleteMode::Soft,
    };
    let id = parse_id(&id)?;
    service.delete(id, mode, &actor).await?;
    Ok(Json(json!({ "id": id, "type": mode.as_str(), "deleted": true })))
}

/// DELETE `/archives/{id}/permanent`: hard delete.
pub async fn delete_archive_permanently(
    State(service): State<ArchiveService>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let actor = owner_id(&headers)?;
    service
        .delete(parse_id(&id)?, DeleteMode::Hard, &actor)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/archives/{id}/restore`
pub async fn restore_archive(
    State(service): State<ArchiveService>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ArchiveSummary>, AppError> {
    let actor = owner_id(&headers)?;
    let id = parse_id(&id)?;
    service.restore(id, &actor).await?;
    Ok(Json(service.describe(id).await?))
}

/// GET `/archives/{id}/history`: newest entry first.
pub async fn archive_history(
    State(service): State<ArchiveService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let entries = service.history(parse_id(&id)?).await?;
    Ok(Json(json!({ "count": entries.len(), "data": entries })))
}

fn set_archive_headers(headers: &mut HeaderMap, archive: &ArchiveContent) {
    let meta = &archive.summary;
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(archive.content.len()));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(digest) = hex::decode(&meta.etag) {
        if let Ok(value) = HeaderValue::from_str(&general_purpose::STANDARD.encode(digest)) {
            headers.insert(HeaderName::from_static("content-md5"), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&meta.updated_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.name.replace('"', "").replace('\\', "")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_header_is_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(owner_id(&headers).unwrap_err().status, StatusCode::BAD_REQUEST);
        headers.insert(OWNER_HEADER, HeaderValue::from_static(" owner-1 "));
        assert_eq!(owner_id(&headers).unwrap(), "owner-1");
    }
}
