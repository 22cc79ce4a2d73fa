//! Storage-and-upload engine for an OCI/Docker-v2 image registry backed by
//! an external object store.
//!
//! The engine is built for a stateless front end: different requests of the
//! same upload may land on different workers, and the only shared state is
//! the object store. The resumable-upload cursor lives in the store itself;
//! the fingerprint of its serialized form is the concurrency-control token.
//!
//! Modules map onto the moving parts:
//! - [`stream`]: digest tees, exact reads, piecewise splitting
//! - [`state`]: the upload-state codec and freshness protocol
//! - [`reconcile`]: client chunks reconciled into valid store parts
//! - [`upload`]: the upload session operations
//! - [`manifest`]: manifests, layer reads, mounts, and the catalog
//! - [`gc`]: garbage collection and the insertion interlock

pub mod error;
pub mod gc;
pub mod manifest;
mod reconcile;
mod state;
pub mod stream;
pub mod upload;

pub use error::{EngineError, EngineResult};
pub use gc::GcMode;
pub use manifest::SYMLINK_META_KEY;

use std::sync::Arc;
use stevedore_core::config::EngineConfig;
use stevedore_core::digest::Digest;
use stevedore_core::repository::RepositoryName;
use stevedore_core::upload::UploadId;
use stevedore_storage::{ByteStream, ObjectStore};

/// The registry storage engine.
///
/// Cheap to clone per request; all state lives in the object store.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn ObjectStore>,
    config: EngineConfig,
}

impl Registry {
    /// Create an engine over a store.
    pub fn new(store: Arc<dyn ObjectStore>, config: EngineConfig) -> EngineResult<Self> {
        config
            .validate()
            .map_err(EngineError::Internal)?;
        Ok(Self { store, config })
    }

    /// The underlying object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Status of a resumable upload, as returned by start/get/append.
#[derive(Clone, Debug)]
pub struct UploadStatus {
    pub id: UploadId,
    /// Resume URL path, fingerprint embedded as a query parameter.
    pub location: String,
    /// Inclusive accepted byte range; `None` before any bytes landed.
    pub range: Option<(u64, u64)>,
    pub min_chunk: u64,
    pub max_chunk: u64,
}

/// A blob sealed under its digest.
#[derive(Clone, Debug)]
pub struct FinishedUpload {
    pub digest: Digest,
    pub location: String,
}

/// A manifest stored under its digest (and tag, when pushed by tag).
#[derive(Clone, Debug)]
pub struct PlacedManifest {
    pub digest: Digest,
    pub location: String,
}

/// A manifest fetched with content.
pub struct ManifestGet {
    pub content: ByteStream,
    pub digest: Digest,
    pub size: u64,
    pub content_type: Option<String>,
}

/// A manifest probed without content.
#[derive(Clone, Debug)]
pub struct ManifestHead {
    pub digest: Digest,
    pub size: u64,
    pub content_type: Option<String>,
}

/// A layer fetched with content, symlinks resolved.
pub struct LayerGet {
    pub content: ByteStream,
    pub digest: Digest,
    pub size: u64,
}

/// A layer probed without content, symlinks resolved.
#[derive(Clone, Debug)]
pub struct LayerHead {
    pub digest: Digest,
    pub size: u64,
}

/// One page of the repository catalog.
#[derive(Clone, Debug)]
pub struct RepositoryPage {
    pub repositories: Vec<String>,
    pub cursor: Option<String>,
}

/// Resume path for an upload, fingerprint embedded as the `_state` query
/// parameter the client echoes back.
pub fn upload_location(name: &RepositoryName, id: &UploadId, fingerprint: &str) -> String {
    format!("/v2/{name}/blobs/uploads/{id}?_state={fingerprint}")
}

/// Canonical path of a blob.
pub fn blob_location(name: &RepositoryName, digest: &Digest) -> String {
    format!("/v2/{name}/blobs/{digest}")
}

/// Canonical path of a manifest.
pub fn manifest_location(name: &RepositoryName, digest: &Digest) -> String {
    format!("/v2/{name}/manifests/{digest}")
}
