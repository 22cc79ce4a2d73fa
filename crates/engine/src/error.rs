//! Engine error types.
//!
//! Errors are grouped by what the dispatcher should tell the client, not by
//! where they happened. `Range` is the only variant carrying a structured
//! payload: the authoritative cursor a client needs to resume.

use stevedore_storage::StorageError;
use thiserror::Error;

/// Engine operation errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller raced another writer or supplied an invalid range. Carries
    /// the authoritative fingerprint and accepted byte count so the client
    /// can resume from the real cursor.
    #[error("range mismatch: {accepted} bytes accepted")]
    Range { accepted: u64, fingerprint: String },

    /// Malformed manifest.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// A referenced blob is absent.
    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    /// A referenced manifest is absent.
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// A referenced resource is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself is invalid.
    #[error("bad request: {0}")]
    Client(String),

    /// The blob exceeds the monolithic limit; the caller should fall back to
    /// the chunked path.
    #[error("blob of {size} bytes exceeds monolithic limit of {max}")]
    BlobTooLarge { size: u64, max: u64 },

    /// A garbage collection raced the insertion; retriable.
    #[error("garbage collection in progress for {0}, retry")]
    GcContention(String),

    /// The object store failed; tagged with the operation for diagnosis.
    #[error("storage failure during {op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: StorageError,
    },

    /// Programmer error. Never carries request data.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wrap a storage failure with the operation it occurred in.
    pub fn storage(op: &'static str) -> impl FnOnce(StorageError) -> Self {
        move |source| Self::Storage { op, source }
    }

    /// Whether the client may retry the identical request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::GcContention(_) | Self::Storage { .. })
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
