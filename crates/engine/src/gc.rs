//! Garbage collection and the manifest-insertion interlock.
//!
//! Coordination is one-sided by construction: insertions register a marker
//! before doing any work and re-check it right before committing, while a
//! collection records its start epoch and aborts if any marker is newer.
//! When both contend, at least one backs off: a marker created after the
//! epoch fails the insertion's commit barrier, and a marker at or before
//! the epoch aborts the collection. No manifest commits after a conflicting
//! collection observed it as unreachable, and no blob is deleted while an
//! insertion that might reference it is in flight.

use crate::error::{EngineError, EngineResult};
use crate::Registry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use stevedore_core::manifest::ImageManifest;
use stevedore_core::repository::RepositoryName;
use stevedore_storage::traits::DEFAULT_PAGE_SIZE;
use stevedore_storage::{PutOptions, StorageError};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Backstop lifetime for insertion markers whose writer died.
const INSERTION_MARKER_TTL: Duration = Duration::from_secs(10 * 60);

/// Garbage collection mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcMode {
    /// Delete blobs no live manifest references.
    Unreferenced,
    /// Delete manifests no tag references, then their unreferenced blobs.
    Untagged,
}

#[derive(Serialize, Deserialize)]
struct InsertionMarker {
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

#[derive(Serialize, Deserialize)]
struct CollectionEpoch {
    #[serde(with = "time::serde::rfc3339")]
    started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    finished_at: Option<OffsetDateTime>,
}

/// The `_gc` prefix sits outside the repository-name grammar, like
/// `_scratch`, so marker keys never collide with repository keys.
fn insertion_prefix(name: &RepositoryName) -> String {
    format!("_gc/{name}/insertions/")
}

fn epoch_key(name: &RepositoryName) -> String {
    format!("_gc/{name}/epoch")
}

impl Registry {
    /// Register an insertion marker for a manifest write in progress.
    #[instrument(skip(self), fields(repo = %name))]
    pub async fn mark_for_insertion(&self, name: &RepositoryName) -> EngineResult<String> {
        let key = format!("{}{}", insertion_prefix(name), Uuid::new_v4());
        let marker = InsertionMarker {
            created_at: OffsetDateTime::now_utc(),
        };
        let body = serde_json::to_vec(&marker)
            .map_err(|e| EngineError::Internal(format!("marker encoding failed: {e}")))?;
        let opts = PutOptions::default()
            .with_content_type("application/json")
            .with_expiry(INSERTION_MARKER_TTL);
        self.store
            .put(&key, Bytes::from(body), opts)
            .await
            .map_err(EngineError::storage("write-insertion-marker"))?;
        Ok(key)
    }

    /// Remove an insertion marker. Absence is not an error; the TTL is the
    /// backstop when the writer died before cleaning up.
    #[instrument(skip(self))]
    pub async fn clean_insertion(&self, marker_key: &str) -> EngineResult<()> {
        match self.store.delete(marker_key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(EngineError::storage("delete-insertion-marker")(e)),
        }
    }

    /// Whether the insertion that registered `marker_key` may still commit:
    /// true iff no collection has started since the marker was created.
    #[instrument(skip(self), fields(repo = %name))]
    pub async fn check_can_insert(
        &self,
        name: &RepositoryName,
        marker_key: &str,
    ) -> EngineResult<bool> {
        let marker = match self.store.get_bytes(marker_key).await {
            Ok(bytes) => bytes,
            // A vanished marker means its TTL lapsed or a collector raced
            // it away; either way the insertion must not commit.
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(EngineError::storage("read-insertion-marker")(e)),
        };
        let marker: InsertionMarker = serde_json::from_slice(&marker)
            .map_err(|e| EngineError::Internal(format!("marker decoding failed: {e}")))?;

        let epoch = match self.store.get_bytes(&epoch_key(name)).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return Ok(true),
            Err(e) => return Err(EngineError::storage("read-gc-epoch")(e)),
        };
        let epoch: CollectionEpoch = serde_json::from_slice(&epoch)
            .map_err(|e| EngineError::Internal(format!("epoch decoding failed: {e}")))?;

        Ok(epoch.started_at <= marker.created_at)
    }

    /// Run one best-effort collection pass.
    ///
    /// Returns false without deleting anything when an insertion marker
    /// newer than the pass's own start epoch exists.
    #[instrument(skip(self), fields(repo = %name, mode = ?mode))]
    pub async fn garbage_collect(
        &self,
        name: &RepositoryName,
        mode: GcMode,
    ) -> EngineResult<bool> {
        let started_at = OffsetDateTime::now_utc();
        self.write_epoch(name, started_at, None).await?;

        for key in self.list_all(&insertion_prefix(name)).await? {
            let marker = match self.store.get_bytes(&key).await {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(EngineError::storage("read-insertion-marker")(e)),
            };
            match serde_json::from_slice::<InsertionMarker>(&marker) {
                Ok(marker) if marker.created_at >= started_at => {
                    debug!(marker = %key, "aborting collection: insertion in flight");
                    self.write_epoch(name, started_at, Some(OffsetDateTime::now_utc()))
                        .await?;
                    return Ok(false);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(marker = %key, error = %e, "skipping undecodable insertion marker");
                }
            }
        }

        match mode {
            GcMode::Unreferenced => {
                self.sweep_unreferenced_blobs(name).await?;
            }
            GcMode::Untagged => {
                self.sweep_untagged_manifests(name).await?;
                self.sweep_unreferenced_blobs(name).await?;
            }
        }

        self.write_epoch(name, started_at, Some(OffsetDateTime::now_utc()))
            .await?;
        Ok(true)
    }

    async fn write_epoch(
        &self,
        name: &RepositoryName,
        started_at: OffsetDateTime,
        finished_at: Option<OffsetDateTime>,
    ) -> EngineResult<()> {
        let epoch = CollectionEpoch {
            started_at,
            finished_at,
        };
        let body = serde_json::to_vec(&epoch)
            .map_err(|e| EngineError::Internal(format!("epoch encoding failed: {e}")))?;
        self.store
            .put(
                &epoch_key(name),
                Bytes::from(body),
                PutOptions::default().with_content_type("application/json"),
            )
            .await
            .map_err(EngineError::storage("write-gc-epoch"))
    }

    /// Delete blobs no live manifest references.
    async fn sweep_unreferenced_blobs(&self, name: &RepositoryName) -> EngineResult<u64> {
        let mut live: BTreeSet<String> = BTreeSet::new();
        for key in self.list_all(&name.manifest_prefix()).await? {
            let bytes = match self.store.get_bytes(&key).await {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(EngineError::storage("get-manifest")(e)),
            };
            match ImageManifest::parse(&bytes) {
                Ok(manifest) => {
                    live.extend(manifest.referenced_blobs().iter().map(ToString::to_string));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unparsable manifest during sweep");
                }
            }
        }

        let blob_prefix = name.blob_prefix();
        let mut deleted = 0u64;
        for key in self.list_all(&blob_prefix).await? {
            let digest = &key[blob_prefix.len()..];
            if live.contains(digest) {
                continue;
            }
            match self.store.delete(&key).await {
                Ok(()) => deleted += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(EngineError::storage("delete-blob")(e)),
            }
        }

        debug!(deleted, repo = %name, "unreferenced blob sweep finished");
        Ok(deleted)
    }

    /// Delete digest-referenced manifests no tag points at. Children of a
    /// tagged index stay live even without their own tag.
    async fn sweep_untagged_manifests(&self, name: &RepositoryName) -> EngineResult<u64> {
        let prefix = name.manifest_prefix();
        let keys = self.list_all(&prefix).await?;

        let mut keep: BTreeSet<String> = BTreeSet::new();
        let mut digest_keys: Vec<String> = Vec::new();

        for key in &keys {
            let reference = &key[prefix.len()..];
            if reference.starts_with("sha256:") {
                digest_keys.push(key.clone());
                continue;
            }
            let bytes = match self.store.get_bytes(key).await {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(EngineError::storage("get-manifest")(e)),
            };
            keep.insert(stevedore_core::digest::Digest::compute(&bytes).to_string());
            if let Ok(manifest) = ImageManifest::parse(&bytes) {
                keep.extend(
                    manifest
                        .referenced_manifests()
                        .iter()
                        .map(ToString::to_string),
                );
            }
        }

        let mut deleted = 0u64;
        for key in digest_keys {
            let reference = key[prefix.len()..].to_string();
            if keep.contains(&reference) {
                continue;
            }
            match self.store.delete(&key).await {
                Ok(()) => deleted += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(EngineError::storage("delete-manifest")(e)),
            }
        }

        debug!(deleted, repo = %name, "untagged manifest sweep finished");
        Ok(deleted)
    }

    /// Collect every key under a prefix, following the store's pagination.
    pub(crate) async fn list_all(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .list(Some(prefix), cursor.as_deref(), None, DEFAULT_PAGE_SIZE)
                .await
                .map_err(EngineError::storage("list"))?;
            keys.extend(page.keys);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }
}
