//! src/services/archive_service.rs
//!
//! The facade handed to the HTTP layer as axum state.
//! It validates input, applies per-request deadlines, and delegates to the
//! lifecycle engine, query service and history tracker.

use crate::clock::Clock;
use crate::models::{
    archive::{ArchiveFields, ArchiveSummary, IdentityKey},
    history::HistoryEntry,
};
use crate::services::{
    archive_error::{ArchiveError, ArchiveResult, StoreContext, StoreError},
    blob_store::BlobStore,
    expiry_reclaimer::{ExpiryReclaimer, ReclaimerConfig},
    history_tracker::HistoryTracker,
    lifecycle_engine::{DeleteMode, LifecycleEngine, LifecyclePolicy},
    metadata_index::MetadataIndex,
    query_service::{ArchivePage, QueryService},
    validation::UploadPolicy,
};
use bytes::Bytes;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::warn;
use uuid::Uuid;

/// Tunables for the service, usually derived from `AppConfig`.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub upload: UploadPolicy,
    pub lifecycle: LifecyclePolicy,
    pub reclaimer: ReclaimerConfig,
    pub request_timeout: Duration,
    pub upload_retry_attempts: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            upload: UploadPolicy::default(),
            lifecycle: LifecyclePolicy::default(),
            reclaimer: ReclaimerConfig::default(),
            request_timeout: Duration::from_secs(10),
            upload_retry_attempts: 3,
        }
    }
}

/// An archive together with its content, as served for download.
pub struct ArchiveContent {
    pub summary: ArchiveSummary,
    pub content: Bytes,
}

#[derive(Clone)]
pub struct ArchiveService {
    engine: Arc<LifecycleEngine>,
    queries: QueryService,
    history: HistoryTracker,
    index: Arc<dyn MetadataIndex>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<ServiceSettings>,
}

impl ArchiveService {
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        let engine = Arc::new(LifecycleEngine::new(
            index.clone(),
            blobs.clone(),
            clock.clone(),
            settings.lifecycle.clone(),
        ));
        Self {
            engine,
            queries: QueryService::new(index.clone()),
            history: HistoryTracker::new(index.clone(), clock.clone()),
            index,
            blobs,
            clock,
            settings: Arc::new(settings),
        }
    }

    /// A reclaimer sharing this service's engine and stores.
    pub fn reclaimer(&self) -> ExpiryReclaimer {
        ExpiryReclaimer::new(
            self.engine.clone(),
            self.index.clone(),
            self.clock.clone(),
            self.settings.reclaimer.clone(),
        )
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    async fn within_deadline<T, F>(&self, operation: &'static str, fut: F) -> ArchiveResult<T>
    where
        F: Future<Output = ArchiveResult<T>>,
    {
        let limit = self.settings.request_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?limit, "operation exceeded its deadline");
                Err(ArchiveError::infra(
                    operation,
                    "deadline",
                    StoreError::DeadlineExceeded(limit),
                ))
            }
        }
    }

    /// Validate and store a new version; contended uploads are retried.
    pub async fn upload(
        &self,
        key: IdentityKey,
        content: Bytes,
        fields: ArchiveFields,
    ) -> ArchiveResult<ArchiveSummary> {
        let fields = self
            .settings
            .upload
            .validate(&key, fields, content.len())?;
        let attempts = self.settings.upload_retry_attempts;
        self.within_deadline("upload", async {
            let archive = self
                .engine
                .upload_with_retry(&key, content, fields, &key.owner_id, attempts)
                .await?;
            Ok(archive.summary())
        })
        .await
    }

    pub async fn delete(&self, id: Uuid, mode: DeleteMode, actor_id: &str) -> ArchiveResult<()> {
        self.within_deadline("delete", self.engine.delete(id, mode, actor_id))
            .await
    }

    pub async fn restore(&self, id: Uuid, actor_id: &str) -> ArchiveResult<()> {
        self.within_deadline("restore", self.engine.restore(id, actor_id))
            .await
    }

    /// Metadata of an active archive.
    pub async fn describe(&self, id: Uuid) -> ArchiveResult<ArchiveSummary> {
        self.within_deadline("describe", async {
            let record = self
                .index
                .get(id)
                .await
                .context("load archive", id)?
                .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?;
            if record.is_expired(self.clock.now()) {
                return Err(ArchiveError::Expired(id));
            }
            if !record.is_active() {
                return Err(ArchiveError::NotFound(id.to_string()));
            }
            Ok(record.summary())
        })
        .await
    }

    /// Metadata and content of an active archive.
    pub async fn get(&self, id: Uuid) -> ArchiveResult<ArchiveContent> {
        self.within_deadline("get", async {
            let (record, content) = self.engine.get(id).await?;
            Ok(ArchiveContent {
                summary: record.summary(),
                content,
            })
        })
        .await
    }

    pub async fn list(&self, page: u32, page_size: u32) -> ArchiveResult<ArchivePage> {
        self.within_deadline("list", self.queries.list(page, page_size))
            .await
    }

    pub async fn get_by_ids(&self, ids: &[String]) -> ArchiveResult<Vec<ArchiveSummary>> {
        self.within_deadline("get by ids", self.queries.get_by_ids(ids))
            .await
    }

    pub async fn get_by_category(
        &self,
        category: &str,
        page: u32,
        page_size: u32,
    ) -> ArchiveResult<ArchivePage> {
        self.within_deadline(
            "get by category",
            self.queries.get_by_category(category, page, page_size),
        )
        .await
    }

    pub async fn get_by_tags(
        &self,
        tags: &[String],
        page: u32,
        page_size: u32,
    ) -> ArchiveResult<ArchivePage> {
        self.within_deadline("get by tags", self.queries.get_by_tags(tags, page, page_size))
            .await
    }

    pub async fn history(&self, id: Uuid) -> ArchiveResult<Vec<HistoryEntry>> {
        self.within_deadline("history", self.history.history(id))
            .await
    }

    /// Readiness of the metadata index.
    pub async fn index_ready(&self) -> ArchiveResult<()> {
        self.within_deadline("index readiness", async {
            self.index
                .health_check()
                .await
                .context("metadata health check", "index")
        })
        .await
    }

    /// Readiness of the blob store (write/read/delete probe).
    pub async fn blobs_ready(&self) -> ArchiveResult<()> {
        self.within_deadline("blob readiness", async {
            self.blobs.probe().await.context("blob store probe", "blobs")
        })
        .await
    }
}
