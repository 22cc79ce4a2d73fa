//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, CompletedPart, ListPage, MultipartUpload, ObjectMeta, ObjectStore, PutOptions,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::MetadataDirective;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Metadata key under which the content digest hint is persisted.
const SHA256_META_KEY: &str = "content-sha256";

const DEFAULT_REGION: &str = "us-east-1";

/// Credential provider that builds the AWS default chain on the first
/// signed request instead of at backend construction.
///
/// Eager chain construction probes trust roots and the instance-metadata
/// endpoint, which fails hard on hosts that only ever talk to a local
/// unauthenticated store.
#[derive(Debug)]
struct DeferredCredentials {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl DeferredCredentials {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn resolve(&self) -> Result<aws_credential_types::Credentials, CredentialsError> {
        let chain = self
            .chain
            .get_or_init(|| async {
                aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                    .region(aws_config::Region::new(self.region.clone()))
                    .build()
                    .await
            })
            .await;
        chain.provide_credentials().await
    }
}

impl ProvideCredentials for DeferredCredentials {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.resolve())
    }
}

/// HTTP status of a service error, if the failure got that far.
fn http_status<E>(err: &SdkError<E>) -> Option<u16>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match err {
        SdkError::ServiceError(service_err) => Some(service_err.raw().status().as_u16()),
        _ => None,
    }
}

/// Whether a credential-resolution failure hides somewhere in the error
/// chain. The SDK wraps these in dispatch errors, so we walk the sources.
fn credentials_failure<E>(err: &SdkError<E>) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
{
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause.is::<CredentialsError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Translate an SDK failure. When `key` is given, a 404 becomes `NotFound`
/// for it; credential failures become config errors so the operator sees an
/// actionable message instead of a transport trace.
fn map_sdk_error<E>(err: SdkError<E>, key: Option<&str>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let Some(key) = key
        && http_status(&err) == Some(404)
    {
        return StorageError::NotFound(key.to_string());
    }
    if credentials_failure(&err) {
        return StorageError::Config(
            "unable to resolve AWS credentials; set access keys in the storage config or provide an ambient credential source"
                .to_string(),
        );
    }
    StorageError::S3(Box::new(err))
}

/// Give a bare `host:port` endpoint an explicit scheme.
fn normalize_endpoint(endpoint: &str) -> String {
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    /// Pre-rendered key prefix, either empty or ending in `/`.
    key_prefix: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`)
    ///   instead of virtual-hosted style (`bucket.endpoint/key`). Required
    ///   for MinIO and some S3-compatible services.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let region = region.unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .force_path_style(force_path_style);

        builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => {
                builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                    key_id,
                    secret,
                    None, // session token
                    None, // expiration
                    "stevedore-config",
                ))
            }
            (None, None) => builder.credentials_provider(DeferredCredentials::new(region)),
            _ => {
                return Err(StorageError::Config(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ));
            }
        };

        if let Some(endpoint) = endpoint {
            let endpoint = normalize_endpoint(&endpoint);
            // A plain-http endpoint (local MinIO) gets an http-only client,
            // keeping SDK setup independent of native trust roots.
            if endpoint.starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
            builder = builder.endpoint_url(endpoint);
        }

        let key_prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}/"))
            .unwrap_or_default();

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            key_prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn strip_prefix(&self, full_key: &str) -> String {
        full_key
            .strip_prefix(&self.key_prefix)
            .unwrap_or(full_key)
            .to_string()
    }

    fn meta_from_parts(
        size: u64,
        content_type: Option<&str>,
        metadata: Option<&HashMap<String, String>>,
        last_modified: Option<&aws_sdk_s3::primitives::DateTime>,
    ) -> ObjectMeta {
        let mut custom = std::collections::BTreeMap::new();
        let mut sha256 = None;
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                if key == SHA256_META_KEY {
                    sha256 = Some(value.clone());
                } else {
                    custom.insert(key.clone(), value.clone());
                }
            }
        }
        let last_modified = last_modified
            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());
        ObjectMeta {
            size,
            sha256,
            content_type: content_type.map(|s| s.to_string()),
            custom,
            last_modified,
        }
    }
}

fn expiry_timestamp(expires_in: std::time::Duration) -> aws_sdk_s3::primitives::DateTime {
    let expires_at =
        time::OffsetDateTime::now_utc().unix_timestamp() + expires_in.as_secs() as i64;
    aws_sdk_s3::primitives::DateTime::from_secs(expires_at)
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if http_status(&err) == Some(404) => Ok(false),
            Err(err) => Err(map_sdk_error(err, None)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Some(key)))?;

        Ok(Self::meta_from_parts(
            output.content_length().unwrap_or(0) as u64,
            output.content_type(),
            output.metadata(),
            output.last_modified(),
        ))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<(ByteStream, ObjectMeta)> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Some(key)))?;

        let meta = Self::meta_from_parts(
            output.content_length().unwrap_or(0) as u64,
            output.content_type(),
            output.metadata(),
            output.last_modified(),
        );

        // Adapt the SDK body to AsyncRead, then wrap with ReaderStream for
        // true streaming.
        let reader_stream = ReaderStream::new(output.body.into_async_read());

        use futures::StreamExt;
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok((Box::pin(stream), meta))
    }

    #[instrument(skip(self, data, opts), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(data.into());

        if let Some(content_type) = &opts.content_type {
            request = request.content_type(content_type);
        }
        if let Some(sha256) = &opts.sha256 {
            request = request.metadata(SHA256_META_KEY, sha256);
        }
        for (meta_key, value) in &opts.custom {
            request = request.metadata(meta_key, value);
        }
        if let Some(expires_in) = opts.expires_in {
            request = request.expires(expiry_timestamp(expires_in));
        }

        request.send().await.map_err(|e| map_sdk_error(e, None))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // delete_object succeeds on absent keys; probe first so callers can
        // tell deletion from a no-op.
        if self.exists(key).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, None))?;
            Ok(())
        } else {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    #[instrument(skip(self, opts), fields(backend = "s3"))]
    async fn copy(&self, from: &str, to: &str, opts: PutOptions) -> StorageResult<()> {
        // CopySource is bucket/key with the key percent-encoded; the bucket
        // name and separator stay as-is.
        let encoded_key =
            utf8_percent_encode(&self.full_key(from), NON_ALPHANUMERIC).to_string();

        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(self.full_key(to))
            .copy_source(format!("{}/{encoded_key}", self.bucket));

        if opts.replaces_metadata() {
            request = request.metadata_directive(MetadataDirective::Replace);
            if let Some(content_type) = &opts.content_type {
                request = request.content_type(content_type);
            }
            if let Some(sha256) = &opts.sha256 {
                request = request.metadata(SHA256_META_KEY, sha256);
            }
            for (meta_key, value) in &opts.custom {
                request = request.metadata(meta_key, value);
            }
        }
        if let Some(expires_in) = opts.expires_in {
            request = request.expires(expiry_timestamp(expires_in));
        }

        request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, Some(from)))?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(
        &self,
        prefix: Option<&str>,
        cursor: Option<&str>,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(limit.min(i32::MAX as usize) as i32);

        let full_prefix = self.full_key(prefix.unwrap_or_default());
        if !full_prefix.is_empty() {
            request = request.prefix(full_prefix);
        }
        if let Some(cursor) = cursor {
            request = request.continuation_token(cursor);
        }
        if let Some(start_after) = start_after {
            request = request.start_after(self.full_key(start_after));
        }

        let output = request.send().await.map_err(|err| {
            // S3 answers a bad continuation token with a 400.
            if cursor.is_some() && http_status(&err) == Some(400) {
                StorageError::InvalidCursor("continuation token rejected by S3".to_string())
            } else {
                map_sdk_error(err, None)
            }
        })?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|obj| obj.key())
            .map(|k| self.strip_prefix(k))
            .collect();

        let next_cursor = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(|s| s.to_string())
        } else {
            None
        };

        Ok(ListPage { keys, next_cursor })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, None))?;

        output
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn resume_multipart(
        &self,
        key: &str,
        store_upload_id: &str,
    ) -> StorageResult<Box<dyn MultipartUpload>> {
        Ok(Box::new(S3MultipartUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.full_key(key),
            upload_id: store_upload_id.to_string(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Handle onto one S3 multipart upload.
struct S3MultipartUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
}

impl S3MultipartUpload {
    /// A 404 on a multipart call means the upload itself is gone.
    fn map_error<E>(&self, err: SdkError<E>) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if http_status(&err) == Some(404) {
            return StorageError::UploadNotFound(self.upload_id.clone());
        }
        map_sdk_error(err, None)
    }
}

#[async_trait]
impl MultipartUpload for S3MultipartUpload {
    async fn upload_part(&mut self, number: i32, data: Bytes) -> StorageResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(output
            .e_tag()
            .unwrap_or_default()
            .trim_matches('"')
            .to_string())
    }

    async fn complete(self: Box<Self>, parts: &[CompletedPart]) -> StorageResult<()> {
        let completed_parts: Vec<aws_sdk_s3::types::CompletedPart> = parts
            .iter()
            .map(|part| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(part.number)
                    .build()
            })
            .collect();

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(())
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend_with_prefix(prefix: Option<&str>) -> S3Backend {
        let prefix = prefix.map(|p| p.to_string());
        let creds = ("unit-access", "unit-secret");
        S3Backend::new(
            "unit-bucket",
            Some("minio.test:9000".to_string()),
            None,
            prefix,
            Some(creds.0.to_string()),
            Some(creds.1.to_string()),
            true,
        )
        .await
        .expect("unit backend should construct")
    }

    #[tokio::test]
    async fn test_key_prefix_mapping() {
        let prefixed = backend_with_prefix(Some("registry")).await;
        assert_eq!(prefixed.full_key("lib/app/blobs/x"), "registry/lib/app/blobs/x");
        assert_eq!(prefixed.strip_prefix("registry/lib/app/blobs/x"), "lib/app/blobs/x");
        // Keys outside the prefix pass through untouched.
        assert_eq!(prefixed.strip_prefix("elsewhere/y"), "elsewhere/y");

        let bare = backend_with_prefix(None).await;
        assert_eq!(bare.full_key("lib/app/blobs/x"), "lib/app/blobs/x");
        assert_eq!(bare.strip_prefix("lib/app/blobs/x"), "lib/app/blobs/x");

        // Stray slashes around the configured prefix collapse away.
        let deep = backend_with_prefix(Some("/deep/prefix/")).await;
        assert_eq!(deep.full_key("x"), "deep/prefix/x");
    }

    #[tokio::test]
    async fn test_partial_credentials_are_a_config_error() {
        for (key_id, secret) in [
            (Some("unit-access".to_string()), None),
            (None, Some("unit-secret".to_string())),
        ] {
            let result =
                S3Backend::new("unit-bucket", None, None, None, key_id, secret, false).await;
            assert!(matches!(result, Err(StorageError::Config(_))));
        }
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("minio:9000"), "http://minio:9000");
        assert_eq!(normalize_endpoint("http://minio:9000"), "http://minio:9000");
        assert_eq!(
            normalize_endpoint("HTTPS://s3.example.com"),
            "HTTPS://s3.example.com"
        );
    }

    #[test]
    fn test_meta_from_parts_extracts_digest() {
        let mut metadata = HashMap::new();
        metadata.insert(SHA256_META_KEY.to_string(), "ab".repeat(32));
        metadata.insert("symlink-target-repo".to_string(), "lib/a".to_string());

        let meta = S3Backend::meta_from_parts(42, Some("application/json"), Some(&metadata), None);
        assert_eq!(meta.size, 42);
        assert_eq!(meta.sha256.as_deref(), Some("ab".repeat(32).as_str()));
        assert_eq!(
            meta.custom.get("symlink-target-repo").map(String::as_str),
            Some("lib/a")
        );
        assert_eq!(meta.content_type.as_deref(), Some("application/json"));
    }
}
