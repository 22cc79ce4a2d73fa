//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid repository name: {0}")]
    InvalidRepositoryName(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("manifest parse error: {0}")]
    Manifest(String),

    #[error("upload state error: {0}")]
    UploadState(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
