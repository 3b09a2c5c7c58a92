//! src/services/blob_store.rs
//!
//! Blob storage for archive payloads. The engine only sees the [`BlobStore`]
//! trait: opaque references, whole-object put/get/delete, and a small
//! metadata dictionary per blob. [`FsBlobStore`] keeps payloads on local disk
//! sharded beneath `base_path/{shard}/{shard}/{blob_ref}` with a JSON sidecar
//! holding the metadata.

use crate::services::archive_error::{StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Free-form metadata attached to a blob at write time.
pub type BlobMetadata = BTreeMap<String, String>;

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub blob_ref: String,
    pub size_bytes: i64,
    /// Lowercase hex MD5 of the content.
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `content` under a fresh reference. Never overwrites.
    async fn put(&self, name: &str, content: Bytes, metadata: BlobMetadata)
    -> StoreResult<StoredBlob>;

    /// Fetch content and metadata. Missing blobs yield `StoreError::BlobNotFound`.
    async fn get(&self, blob_ref: &str) -> StoreResult<(Bytes, BlobMetadata)>;

    /// Remove a blob. Removing a missing blob succeeds.
    async fn delete(&self, blob_ref: &str) -> StoreResult<()>;

    /// Cheap write/read/delete round trip used by readiness checks.
    async fn probe(&self) -> StoreResult<()>;
}

/// Compute the etag recorded for a payload.
pub fn content_etag(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

/// Local-disk blob store.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    base_path: PathBuf,
}

const META_SUFFIX: &str = ".meta.json";

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// References are generated here, so anything that is not a plain UUID
    /// string is rejected before it can reach the filesystem.
    fn ensure_ref_safe(blob_ref: &str) -> StoreResult<()> {
        if Uuid::parse_str(blob_ref).is_err() {
            return Err(StoreError::BlobNotFound(blob_ref.to_string()));
        }
        Ok(())
    }

    /// Two-level shard identifiers: the first two bytes of MD5(blob_ref) as hex.
    fn shards(blob_ref: &str) -> (String, String) {
        let digest = md5::compute(blob_ref);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, blob_ref: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(blob_ref);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(blob_ref);
        path
    }

    fn meta_path(blob_path: &Path) -> PathBuf {
        let mut name = blob_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(META_SUFFIX);
        blob_path.with_file_name(name)
    }

    /// Write bytes to a temp file, fsync, then rename into place.
    async fn write_durably(parent: &Path, target: &Path, content: &[u8]) -> io::Result<()> {
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(content).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, target).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn remove_if_present(path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(_) => {
                debug!("removed blob file {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Recursively remove empty shard directories up to the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        name: &str,
        content: Bytes,
        mut metadata: BlobMetadata,
    ) -> StoreResult<StoredBlob> {
        let blob_ref = Uuid::new_v4().to_string();
        let path = self.blob_path(&blob_ref);
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let etag = content_etag(&content);
        metadata.insert("name".into(), name.to_string());
        metadata.insert("etag".into(), etag.clone());
        let sidecar = serde_json::to_vec(&metadata)?;

        Self::write_durably(&parent, &Self::meta_path(&path), &sidecar).await?;
        if let Err(err) = Self::write_durably(&parent, &path, &content).await {
            let _ = Self::remove_if_present(&Self::meta_path(&path)).await;
            return Err(StoreError::Io(err));
        }

        Ok(StoredBlob {
            blob_ref,
            size_bytes: content.len() as i64,
            etag,
        })
    }

    async fn get(&self, blob_ref: &str) -> StoreResult<(Bytes, BlobMetadata)> {
        Self::ensure_ref_safe(blob_ref)?;
        let path = self.blob_path(blob_ref);
        let content = fs::read(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::BlobNotFound(blob_ref.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;

        let metadata = match fs::read(Self::meta_path(&path)).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BlobMetadata::new(),
            Err(err) => return Err(StoreError::Io(err)),
        };

        Ok((Bytes::from(content), metadata))
    }

    async fn delete(&self, blob_ref: &str) -> StoreResult<()> {
        Self::ensure_ref_safe(blob_ref)?;
        let path = self.blob_path(blob_ref);
        Self::remove_if_present(&path).await?;
        Self::remove_if_present(&Self::meta_path(&path)).await?;

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn probe(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "file content mismatch",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub use memory::MemoryBlobStore;
