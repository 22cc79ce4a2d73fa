//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Default page size for listing operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Metadata about a stored object.
#[derive(Clone, Debug, Default)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// SHA-256 of the content as lowercase hex, when recorded at write time.
    pub sha256: Option<String>,
    /// Content type (if available).
    pub content_type: Option<String>,
    /// Custom key/value metadata persisted with the object.
    pub custom: BTreeMap<String, String>,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Options applied when writing an object.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Expected SHA-256 of the content as lowercase hex. Recorded with the
    /// object so later `head` calls can report it; backends that can verify
    /// the hint do so.
    pub sha256: Option<String>,
    /// Content type to persist.
    pub content_type: Option<String>,
    /// Custom key/value metadata to persist.
    pub custom: BTreeMap<String, String>,
    /// Expiration hint. Backends without native expiry ignore it; callers
    /// must not rely on the object disappearing.
    pub expires_in: Option<Duration>,
}

impl PutOptions {
    pub fn with_sha256(mut self, hex: impl Into<String>) -> Self {
        self.sha256 = Some(hex.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    pub fn with_expiry(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Whether any metadata field is set, meaning a copy replaces the
    /// destination's metadata instead of carrying the source's.
    pub fn replaces_metadata(&self) -> bool {
        self.sha256.is_some() || self.content_type.is_some() || !self.custom.is_empty()
    }
}

/// A single page of listing results.
#[derive(Clone, Debug)]
pub struct ListPage {
    /// Object keys in this page, in the backend's listing order.
    pub keys: Vec<String>,
    /// Opaque cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// A part accepted into a multipart upload, as echoed back at completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub number: i32,
    pub etag: String,
}

/// Object store abstraction consumed by the registry engine.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object as a byte stream plus its metadata.
    async fn get(&self, key: &str) -> StorageResult<(ByteStream, ObjectMeta)>;

    /// Get an object's full content. Only for objects known to be small.
    async fn get_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let (mut stream, meta) = self.get(key).await?;
        let mut buf = BytesMut::with_capacity(meta.size as usize);
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Put an object atomically, creating or replacing it.
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> StorageResult<()>;

    /// Delete an object. Returns `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Copy an object within the store.
    ///
    /// With no metadata fields set in `opts`, the destination carries the
    /// source's metadata. Setting any of digest, content type, or custom
    /// metadata replaces the destination's metadata wholesale, which is how
    /// callers stamp a digest onto an object assembled from parts.
    async fn copy(&self, from: &str, to: &str, opts: PutOptions) -> StorageResult<()>;

    /// List one page of keys.
    ///
    /// `cursor` resumes a previous listing; `start_after` starts past a key.
    async fn list(
        &self,
        prefix: Option<&str>,
        cursor: Option<&str>,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<ListPage>;

    /// Start a multipart upload targeting `key`, returning the store's
    /// upload token.
    async fn create_multipart(&self, key: &str) -> StorageResult<String>;

    /// Obtain a handle onto an existing multipart upload.
    async fn resume_multipart(
        &self,
        key: &str,
        store_upload_id: &str,
    ) -> StorageResult<Box<dyn MultipartUpload>>;

    /// Get the name of this storage backend, for logging.
    fn backend_name(&self) -> &'static str;
}

/// Handle onto one in-flight multipart upload.
///
/// Part numbers are caller-assigned; re-uploading a number replaces that
/// part. The upload stays resumable until `complete` or `abort`.
#[async_trait]
pub trait MultipartUpload: Send {
    /// Upload one part, returning the etag the store assigned.
    async fn upload_part(&mut self, number: i32, data: Bytes) -> StorageResult<String>;

    /// Assemble the named parts, in order, into the target object.
    async fn complete(self: Box<Self>, parts: &[CompletedPart]) -> StorageResult<()>;

    /// Abort the upload, discarding its parts.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
