//! Manifest and layer engine: put/get/head manifests, layer reads through
//! symlink blobs, cross-repo mounts, and the repository catalog.

use crate::error::{EngineError, EngineResult};
use crate::stream::bytes_stream;
use crate::{
    FinishedUpload, LayerGet, LayerHead, ManifestGet, ManifestHead, PlacedManifest, Registry,
    RepositoryPage, blob_location, manifest_location,
};
use bytes::Bytes;
use stevedore_core::digest::Digest;
use stevedore_core::manifest::ImageManifest;
use stevedore_core::repository::{Reference, RepositoryName};
use stevedore_storage::traits::DEFAULT_PAGE_SIZE;
use stevedore_storage::{ObjectMeta, PutOptions, StorageError};
use tracing::{instrument, warn};

/// Custom-metadata key marking a blob as a symlink. The value is the source
/// repository name; the blob body is the full source key.
pub const SYMLINK_META_KEY: &str = "symlink-target-repo";

impl Registry {
    /// Store a manifest under `reference`, and under its digest when the
    /// reference is a tag.
    ///
    /// The write is bracketed by the garbage-collector interlock: an
    /// insertion marker is registered up front and re-checked right before
    /// the write commits, so a manifest never lands after a collection has
    /// judged its blobs unreachable.
    #[instrument(skip(self, body), fields(repo = %name, reference = %reference))]
    pub async fn put_manifest(
        &self,
        name: &RepositoryName,
        reference: &Reference,
        body: Bytes,
        content_type: &str,
        check_layers: bool,
    ) -> EngineResult<PlacedManifest> {
        let marker = self.mark_for_insertion(name).await?;
        let result = self
            .put_manifest_inner(name, reference, body, content_type, check_layers, &marker)
            .await;
        if let Err(e) = self.clean_insertion(&marker).await {
            warn!(marker = %marker, error = %e, "failed to clean insertion marker");
        }
        result
    }

    async fn put_manifest_inner(
        &self,
        name: &RepositoryName,
        reference: &Reference,
        body: Bytes,
        content_type: &str,
        check_layers: bool,
        marker: &str,
    ) -> EngineResult<PlacedManifest> {
        let digest = Digest::compute(&body);

        if let Reference::Digest(expected) = reference
            && *expected != digest
        {
            return Err(EngineError::Client(format!(
                "manifest body hashes to {digest}, not the requested reference"
            )));
        }

        let manifest =
            ImageManifest::parse(&body).map_err(|e| EngineError::Manifest(e.to_string()))?;

        if check_layers {
            for blob in manifest.referenced_blobs() {
                match self.store.head(&name.blob_key(&blob)).await {
                    Ok(_) => {}
                    Err(StorageError::NotFound(_)) => {
                        return Err(EngineError::BlobUnknown(blob.to_string()));
                    }
                    Err(e) => return Err(EngineError::storage("head-blob")(e)),
                }
            }
            for child in manifest.referenced_manifests() {
                let key = name.manifest_key(&Reference::Digest(*child));
                match self.store.head(&key).await {
                    Ok(_) => {}
                    Err(StorageError::NotFound(_)) => {
                        return Err(EngineError::ManifestUnknown(child.to_string()));
                    }
                    Err(e) => return Err(EngineError::storage("head-manifest")(e)),
                }
            }
        }

        // Commit barrier: a collection that started after our marker means
        // its reachability verdicts may not include this manifest.
        if !self.check_can_insert(name, marker).await? {
            return Err(EngineError::GcContention(name.to_string()));
        }

        let opts = PutOptions::default()
            .with_content_type(content_type)
            .with_sha256(digest.to_hex());
        let digest_key = name.manifest_key(&Reference::Digest(digest));
        let store = self.store.as_ref();

        match reference {
            Reference::Tag(_) => {
                let tag_key = name.manifest_key(reference);
                futures::try_join!(
                    store.put(&digest_key, body.clone(), opts.clone()),
                    store.put(&tag_key, body.clone(), opts.clone()),
                )
                .map_err(EngineError::storage("put-manifest"))?;
            }
            Reference::Digest(_) => {
                store
                    .put(&digest_key, body.clone(), opts)
                    .await
                    .map_err(EngineError::storage("put-manifest"))?;
            }
        }

        Ok(PlacedManifest {
            digest,
            location: manifest_location(name, &digest),
        })
    }

    /// Fetch a manifest by tag or digest.
    #[instrument(skip(self), fields(repo = %name, reference = %reference))]
    pub async fn get_manifest(
        &self,
        name: &RepositoryName,
        reference: &Reference,
    ) -> EngineResult<ManifestGet> {
        let key = name.manifest_key(reference);
        let (content, meta) = match self.store.get(&key).await {
            Ok(found) => found,
            Err(StorageError::NotFound(_)) => {
                return Err(EngineError::ManifestUnknown(reference.to_string()));
            }
            Err(e) => return Err(EngineError::storage("get-manifest")(e)),
        };

        // Older writes may predate the digest metadata; recover it from the
        // body when absent.
        let (content, digest) = match recorded_digest(&meta, reference) {
            Some(digest) => (content, digest),
            None => {
                let bytes = crate::stream::collect_exact(content, meta.size).await?;
                let digest = Digest::compute(&bytes);
                (bytes_stream(bytes), digest)
            }
        };

        Ok(ManifestGet {
            content,
            digest,
            size: meta.size,
            content_type: meta.content_type,
        })
    }

    /// Probe a manifest without fetching its content. Absence is a result,
    /// not an error.
    #[instrument(skip(self), fields(repo = %name, reference = %reference))]
    pub async fn manifest_exists(
        &self,
        name: &RepositoryName,
        reference: &Reference,
    ) -> EngineResult<Option<ManifestHead>> {
        let key = name.manifest_key(reference);
        let meta = match self.store.head(&key).await {
            Ok(meta) => meta,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(EngineError::storage("head-manifest")(e)),
        };

        let digest = match recorded_digest(&meta, reference) {
            Some(digest) => digest,
            None => {
                let bytes = self
                    .store
                    .get_bytes(&key)
                    .await
                    .map_err(EngineError::storage("get-manifest"))?;
                Digest::compute(&bytes)
            }
        };

        Ok(Some(ManifestHead {
            digest,
            size: meta.size,
            content_type: meta.content_type,
        }))
    }

    /// Fetch a layer, following at most one symlink.
    ///
    /// A symlink that resolves back to the key it was read from is a broken
    /// mount; it reports the blob as unknown rather than recursing.
    #[instrument(skip(self), fields(repo = %name, digest = %digest))]
    pub async fn get_layer(
        &self,
        name: &RepositoryName,
        digest: &Digest,
    ) -> EngineResult<LayerGet> {
        let key = name.blob_key(digest);
        let (content, meta) = match self.store.get(&key).await {
            Ok(found) => found,
            Err(StorageError::NotFound(_)) => {
                return Err(EngineError::BlobUnknown(digest.to_string()));
            }
            Err(e) => return Err(EngineError::storage("get-blob")(e)),
        };

        let Some(target) = symlink_target(&meta)? else {
            return Ok(LayerGet {
                content,
                digest: *digest,
                size: meta.size,
            });
        };

        if target == *name {
            return Err(EngineError::BlobUnknown(digest.to_string()));
        }

        let (content, meta) = match self.store.get(&target.blob_key(digest)).await {
            Ok(found) => found,
            Err(StorageError::NotFound(_)) => {
                return Err(EngineError::BlobUnknown(digest.to_string()));
            }
            Err(e) => return Err(EngineError::storage("get-blob")(e)),
        };
        // Mounts flatten transitively, so a second hop means the link chain
        // was corrupted out of band.
        if symlink_target(&meta)?.is_some() {
            return Err(EngineError::BlobUnknown(digest.to_string()));
        }

        Ok(LayerGet {
            content,
            digest: *digest,
            size: meta.size,
        })
    }

    /// Probe a layer without fetching it, resolving symlinks the same way
    /// `get_layer` does.
    #[instrument(skip(self), fields(repo = %name, digest = %digest))]
    pub async fn layer_exists(
        &self,
        name: &RepositoryName,
        digest: &Digest,
    ) -> EngineResult<Option<LayerHead>> {
        let meta = match self.store.head(&name.blob_key(digest)).await {
            Ok(meta) => meta,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(EngineError::storage("head-blob")(e)),
        };

        let Some(target) = symlink_target(&meta)? else {
            return Ok(Some(LayerHead {
                digest: *digest,
                size: meta.size,
            }));
        };

        if target == *name {
            return Ok(None);
        }

        let meta = match self.store.head(&target.blob_key(digest)).await {
            Ok(meta) => meta,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(EngineError::storage("head-blob")(e)),
        };
        if symlink_target(&meta)?.is_some() {
            return Ok(None);
        }

        Ok(Some(LayerHead {
            digest: *digest,
            size: meta.size,
        }))
    }

    /// Mount an existing blob into another repository without copying it.
    ///
    /// The destination object is a symlink blob: its body is the source key
    /// and its metadata names the source repository. Mounting a symlink
    /// re-resolves the original source, so links never chain.
    #[instrument(skip(self), fields(source = %source, digest = %digest, dest = %dest))]
    pub async fn mount_layer(
        &self,
        source: &RepositoryName,
        digest: &Digest,
        dest: &RepositoryName,
    ) -> EngineResult<FinishedUpload> {
        let meta = match self.store.head(&source.blob_key(digest)).await {
            Ok(meta) => meta,
            Err(StorageError::NotFound(_)) => {
                return Err(EngineError::NotFound(format!(
                    "blob {digest} in {source}"
                )));
            }
            Err(e) => return Err(EngineError::storage("head-blob")(e)),
        };

        let resolved = match symlink_target(&meta)? {
            Some(target) => target,
            None => source.clone(),
        };

        if resolved == *dest {
            return Err(EngineError::Client(
                "cannot mount a blob onto its own repository".to_string(),
            ));
        }

        let source_key = resolved.blob_key(digest);
        let opts = PutOptions::default().with_custom(SYMLINK_META_KEY, resolved.as_str());
        self.store
            .put(&dest.blob_key(digest), Bytes::from(source_key), opts)
            .await
            .map_err(EngineError::storage("put-symlink"))?;

        Ok(FinishedUpload {
            digest: *digest,
            location: blob_location(dest, digest),
        })
    }

    /// Enumerate repositories that hold at least one manifest.
    ///
    /// Names are derived from the key layout. The returned cursor is the
    /// last key examined; pagination resumes after it, which both backends
    /// support regardless of their native continuation tokens.
    #[instrument(skip(self))]
    pub async fn list_repositories(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> EngineResult<RepositoryPage> {
        let mut repositories = Vec::new();
        let mut after = cursor.map(|c| c.to_string());

        loop {
            let page = self
                .store
                .list(None, None, after.as_deref(), DEFAULT_PAGE_SIZE)
                .await
                .map_err(EngineError::storage("list"))?;

            for key in &page.keys {
                if let Some(idx) = key.find("/manifests/") {
                    let repo = &key[..idx];
                    if repositories.last().map(String::as_str) != Some(repo) {
                        repositories.push(repo.to_string());
                    }
                    if repositories.len() >= limit {
                        // `~` sorts after every legal reference byte, so the
                        // next page resumes past this repository's manifests.
                        return Ok(RepositoryPage {
                            repositories,
                            cursor: Some(format!("{repo}/manifests/~")),
                        });
                    }
                }
            }

            match (page.keys.last(), page.next_cursor) {
                (Some(last), Some(_)) => after = Some(last.clone()),
                _ => break,
            }
        }

        Ok(RepositoryPage {
            repositories,
            cursor: None,
        })
    }
}

/// Extract and validate the symlink target repository, if the object is a
/// symlink blob.
fn symlink_target(meta: &ObjectMeta) -> EngineResult<Option<RepositoryName>> {
    match meta.custom.get(SYMLINK_META_KEY) {
        None => Ok(None),
        Some(value) => RepositoryName::parse(value)
            .map(Some)
            .map_err(|e| EngineError::Internal(format!("corrupt symlink metadata: {e}"))),
    }
}

/// Digest recorded with a stored manifest, falling back to a digest
/// reference's own hash.
fn recorded_digest(meta: &ObjectMeta, reference: &Reference) -> Option<Digest> {
    if let Some(hex) = &meta.sha256
        && let Ok(digest) = Digest::from_hex(hex)
    {
        return Some(digest);
    }
    reference.as_digest().copied()
}
