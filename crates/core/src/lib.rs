//! Core domain types for the Stevedore registry storage engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content digests and incremental hashing
//! - Repository names, references, and the object-key layout
//! - Image manifest parsing
//! - Resumable upload state (the cross-request cursor)
//! - Engine and storage configuration

pub mod config;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod repository;
pub mod upload;

pub use config::{EngineConfig, PushCompatibility, StorageConfig};
pub use digest::{Digest, DigestHasher};
pub use error::{Error, Result};
pub use manifest::ImageManifest;
pub use repository::{Reference, RepositoryName};
pub use upload::{ChunkRecord, PartRecord, UploadId, UploadState};

/// Minimum store part size: 5 MiB. Parts below this (except the last) are
/// rejected by the object store at assembly.
pub const MIN_CHUNK: u64 = 5 * 1024 * 1024;

/// Maximum store part size: 5 GiB.
pub const MAX_CHUNK: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in a single multipart upload.
pub const MAX_PARTS: usize = 10_000;
