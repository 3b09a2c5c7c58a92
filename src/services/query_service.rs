//! Read-only views over active archives.

use crate::models::archive::{Archive, ArchiveSummary};
use crate::services::{
    archive_error::{ArchiveError, ArchiveResult, StoreContext},
    metadata_index::{ArchiveFilter, MetadataIndex, PageRequest},
    validation::normalize_tags,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArchivePage {
    pub items: Vec<ArchiveSummary>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl ArchivePage {
    pub fn total_pages(&self) -> i64 {
        let size = self.page_size.max(1) as i64;
        (self.total + size - 1) / size
    }
}

#[derive(Clone)]
pub struct QueryService {
    index: Arc<dyn MetadataIndex>,
}

impl QueryService {
    pub fn new(index: Arc<dyn MetadataIndex>) -> Self {
        Self { index }
    }

    async fn page(&self, filter: ArchiveFilter, page: PageRequest) -> ArchiveResult<ArchivePage> {
        let (items, total) = self
            .index
            .query_active(&filter, page)
            .await
            .context("query archives", format!("{:?}", filter))?;

        debug!(?filter, total, page = page.page, "archive query");
        Ok(ArchivePage {
            items: items.iter().map(Archive::summary).collect(),
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    /// Every active archive, most recently updated first.
    pub async fn list(&self, page: u32, page_size: u32) -> ArchiveResult<ArchivePage> {
        self.page(ArchiveFilter::All, PageRequest::new(page, page_size))
            .await
    }

    /// Active archives for the requested ids, in request order.
    ///
    /// Malformed, unknown, and non-active ids are skipped. `NotFound` only
    /// when nothing matched.
    pub async fn get_by_ids(&self, ids: &[String]) -> ArchiveResult<Vec<ArchiveSummary>> {
        let mut wanted: Vec<Uuid> = Vec::with_capacity(ids.len());
        for raw in ids {
            match Uuid::parse_str(raw.trim()) {
                Ok(id) if !wanted.contains(&id) => wanted.push(id),
                Ok(_) => {}
                Err(_) => debug!(id = %raw, "skipping malformed archive id"),
            }
        }

        let found = self
            .index
            .find_by_ids(&wanted)
            .await
            .context("load archives", format!("{} ids", wanted.len()))?;
        let mut by_id: HashMap<Uuid, Archive> = found
            .into_iter()
            .filter(Archive::is_active)
            .map(|a| (a.id, a))
            .collect();

        let summaries: Vec<ArchiveSummary> = wanted
            .iter()
            .filter_map(|id| by_id.remove(id))
            .map(|a| a.summary())
            .collect();

        if summaries.is_empty() {
            return Err(ArchiveError::NotFound(ids.join(",")));
        }
        Ok(summaries)
    }

    pub async fn get_by_category(
        &self,
        category: &str,
        page: u32,
        page_size: u32,
    ) -> ArchiveResult<ArchivePage> {
        let category = category.trim();
        if category.is_empty() {
            return Err(ArchiveError::InvalidCategoryOrTags(
                "category is required".into(),
            ));
        }
        self.page(
            ArchiveFilter::Category(category.to_string()),
            PageRequest::new(page, page_size),
        )
        .await
    }

    /// Active archives carrying every tag in `tags`.
    pub async fn get_by_tags(
        &self,
        tags: &[String],
        page: u32,
        page_size: u32,
    ) -> ArchiveResult<ArchivePage> {
        let tags = normalize_tags(tags);
        if tags.is_empty() {
            return Err(ArchiveError::InvalidCategoryOrTags(
                "at least one tag is required".into(),
            ));
        }
        self.page(ArchiveFilter::Tags(tags), PageRequest::new(page, page_size))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::archive_error::ErrorKind;
    use crate::services::lifecycle_engine::{
        DeleteMode,
        test_support::{fields, harness},
    };
    use crate::models::archive::IdentityKey;
    use bytes::Bytes;
    use chrono::Duration;

    async fn seeded() -> (crate::services::lifecycle_engine::test_support::Harness, Vec<Uuid>) {
        let h = harness().await;
        let mut ids = Vec::new();
        for (name, category, tags) in [
            ("a.pdf", "finance", vec!["q4", "draft"]),
            ("b.pdf", "finance", vec!["q4"]),
            ("c.pdf", "legal", vec!["draft"]),
        ] {
            h.clock.advance(Duration::minutes(1));
            let archive = h
                .engine
                .upload(
                    &IdentityKey::new("owner-1", name),
                    Bytes::from_static(b"%PDF"),
                    fields(category, &tags),
                    "owner-1",
                )
                .await
                .unwrap();
            ids.push(archive.id);
        }
        (h, ids)
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let (h, _) = seeded().await;
        let queries = QueryService::new(h.index.clone());

        let page = queries.list(1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages(), 2);
        assert_eq!(
            page.items.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["c.pdf", "b.pdf"]
        );

        let clamped = queries.list(0, 1000).await.unwrap();
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.page_size, PageRequest::MAX_PAGE_SIZE);
        assert_eq!(clamped.items.len(), 3);
    }

    #[tokio::test]
    async fn deleted_archives_drop_out_of_every_view() {
        let (h, ids) = seeded().await;
        let queries = QueryService::new(h.index.clone());
        h.engine.delete(ids[1], DeleteMode::Soft, "owner-1").await.unwrap();
        h.engine.delete(ids[2], DeleteMode::Temp, "owner-1").await.unwrap();

        assert_eq!(queries.list(1, 10).await.unwrap().total, 1);
        let finance = queries.get_by_category("finance", 1, 10).await.unwrap();
        assert_eq!(finance.items.len(), 1);
        assert_eq!(finance.items[0].id, ids[0]);
        let drafts = queries.get_by_tags(&["draft".into()], 1, 10).await.unwrap();
        assert_eq!(drafts.items.len(), 1);
    }

    #[tokio::test]
    async fn tag_filter_requires_every_tag() {
        let (h, ids) = seeded().await;
        let queries = QueryService::new(h.index.clone());

        let both = queries
            .get_by_tags(&["draft".into(), " q4".into()], 1, 10)
            .await
            .unwrap();
        assert_eq!(both.items.len(), 1);
        assert_eq!(both.items[0].id, ids[0]);

        let blank = queries.get_by_tags(&[" ".into()], 1, 10).await;
        assert_eq!(blank.unwrap_err().kind(), ErrorKind::InvalidCategoryOrTags);
        let no_category = queries.get_by_category("  ", 1, 10).await;
        assert_eq!(no_category.unwrap_err().kind(), ErrorKind::InvalidCategoryOrTags);
    }

    #[tokio::test]
    async fn get_by_ids_keeps_request_order_and_skips_misses() {
        let (h, ids) = seeded().await;
        let queries = QueryService::new(h.index.clone());
        h.engine.delete(ids[0], DeleteMode::Soft, "owner-1").await.unwrap();

        let request = vec![
            ids[2].to_string(),
            "not-a-uuid".to_string(),
            ids[0].to_string(),
            Uuid::new_v4().to_string(),
            ids[1].to_string(),
            ids[2].to_string(),
        ];
        let found = queries.get_by_ids(&request).await.unwrap();
        assert_eq!(
            found.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![ids[2], ids[1]]
        );

        let miss = queries.get_by_ids(&[Uuid::new_v4().to_string()]).await;
        assert_eq!(miss.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            queries.get_by_ids(&[]).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
