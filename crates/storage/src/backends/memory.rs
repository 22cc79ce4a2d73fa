//! In-memory storage backend for tests and local development.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, CompletedPart, ListPage, MultipartUpload, ObjectMeta, ObjectStore, PutOptions,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    meta: ObjectMeta,
}

struct MultipartSession {
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    multiparts: HashMap<String, MultipartSession>,
    sequence: u64,
}

/// In-memory object store.
///
/// Complete enough for the registry engine: custom metadata, multipart
/// uploads with resumable handles, and cursor-paged listing. Expiration
/// hints are recorded nowhere and never acted on; memory contents live as
/// long as the process.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryBackend {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn meta_for(data: &Bytes, opts: &PutOptions) -> ObjectMeta {
    ObjectMeta {
        size: data.len() as u64,
        sha256: opts.sha256.clone(),
        content_type: opts.content_type.clone(),
        custom: opts.custom.clone(),
        last_modified: Some(time::OffsetDateTime::now_utc()),
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    #[instrument(skip(self), fields(backend = "memory"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.inner.read().await.objects.contains_key(key))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner
            .read()
            .await
            .objects
            .get(key)
            .map(|obj| obj.meta.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get(&self, key: &str) -> StorageResult<(ByteStream, ObjectMeta)> {
        let obj = self
            .inner
            .read()
            .await
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        let stream = futures::stream::once(async move { Ok(obj.data) });
        Ok((Box::pin(stream), obj.meta))
    }

    #[instrument(skip(self, data, opts), fields(backend = "memory", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        let meta = meta_for(&data, &opts);
        self.inner
            .write()
            .await
            .objects
            .insert(key.to_string(), StoredObject { data, meta });
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner
            .write()
            .await
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, opts), fields(backend = "memory"))]
    async fn copy(&self, from: &str, to: &str, opts: PutOptions) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let mut obj = inner
            .objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        if opts.replaces_metadata() {
            obj.meta = meta_for(&obj.data, &opts);
        }
        inner.objects.insert(to.to_string(), obj);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn list(
        &self,
        prefix: Option<&str>,
        cursor: Option<&str>,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<ListPage> {
        let inner = self.inner.read().await;
        let resume_after = cursor.or(start_after);

        let mut keys = Vec::new();
        let mut more = false;
        for key in inner.objects.keys() {
            if let Some(prefix) = prefix
                && !key.starts_with(prefix)
            {
                continue;
            }
            if let Some(after) = resume_after
                && key.as_str() <= after
            {
                continue;
            }
            if keys.len() == limit {
                more = true;
                break;
            }
            keys.push(key.clone());
        }

        let next_cursor = if more { keys.last().cloned() } else { None };
        Ok(ListPage { keys, next_cursor })
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        let mut inner = self.inner.write().await;
        inner.sequence += 1;
        let upload_id = format!("mem-upload-{}", inner.sequence);
        inner.multiparts.insert(
            upload_id.clone(),
            MultipartSession {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn resume_multipart(
        &self,
        key: &str,
        store_upload_id: &str,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        let inner = self.inner.read().await;
        let session = inner
            .multiparts
            .get(store_upload_id)
            .ok_or_else(|| StorageError::UploadNotFound(store_upload_id.to_string()))?;
        if session.key != key {
            return Err(StorageError::InvalidKey(format!(
                "upload {store_upload_id} targets {}, not {key}",
                session.key
            )));
        }
        Ok(Box::new(MemoryMultipartUpload {
            store: self.inner.clone(),
            upload_id: store_upload_id.to_string(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryMultipartUpload {
    store: Arc<RwLock<Inner>>,
    upload_id: String,
}

#[async_trait]
impl MultipartUpload for MemoryMultipartUpload {
    async fn upload_part(&mut self, number: i32, data: Bytes) -> StorageResult<String> {
        if number < 1 {
            return Err(StorageError::InvalidAssembly(format!(
                "part number must be positive, got {number}"
            )));
        }
        let mut inner = self.store.write().await;
        inner.sequence += 1;
        let etag = format!("mem-etag-{}", inner.sequence);
        let session = inner
            .multiparts
            .get_mut(&self.upload_id)
            .ok_or_else(|| StorageError::UploadNotFound(self.upload_id.clone()))?;
        session.parts.insert(number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete(self: Box<Self>, parts: &[CompletedPart]) -> StorageResult<()> {
        let mut inner = self.store.write().await;
        let session = inner
            .multiparts
            .get(&self.upload_id)
            .ok_or_else(|| StorageError::UploadNotFound(self.upload_id.clone()))?;

        // Validate before consuming the session: a rejected assembly leaves
        // the upload resumable, as the real store does.
        let mut assembled = BytesMut::new();
        for part in parts {
            let (etag, data) = session.parts.get(&part.number).ok_or_else(|| {
                StorageError::InvalidAssembly(format!("part {} was never uploaded", part.number))
            })?;
            if etag != &part.etag {
                return Err(StorageError::InvalidAssembly(format!(
                    "part {} etag mismatch",
                    part.number
                )));
            }
            assembled.extend_from_slice(data);
        }

        let key = session.key.clone();
        inner.multiparts.remove(&self.upload_id);

        // As on S3, completion carries no metadata of its own; callers stamp
        // metadata when they re-materialize the assembled object via copy.
        let data = assembled.freeze();
        let meta = meta_for(&data, &PutOptions::default());
        inner.objects.insert(key, StoredObject { data, meta });
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let mut inner = self.store.write().await;
        inner
            .multiparts
            .remove(&self.upload_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::UploadNotFound(self.upload_id.clone()))
    }
}
