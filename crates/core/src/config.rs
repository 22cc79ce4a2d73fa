//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How far the chunk reconciler bends to accommodate non-ideal client
/// chunking. This is a deployment knob: `full` trades store bandwidth
/// (scratch copies, repair re-uploads) for client tolerance.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushCompatibility {
    /// Non-ideal chunk sequences are answered with a range error.
    #[default]
    Off,
    /// Shrinking, growing, and repairable sequences are accepted.
    Full,
}

impl PushCompatibility {
    /// Whether repair and grow-split branches are enabled.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chunk-reconciler compatibility mode.
    #[serde(default)]
    pub push_compatibility: PushCompatibility,
    /// Minimum store part size in bytes.
    #[serde(default = "default_min_chunk")]
    pub min_chunk: u64,
    /// Maximum store part size in bytes.
    #[serde(default = "default_max_chunk")]
    pub max_chunk: u64,
    /// Largest single part the engine will upload; must not exceed `max_chunk`.
    #[serde(default = "default_max_chunk")]
    pub max_upload_chunk: u64,
    /// Maximum number of parts per upload.
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
    /// Lifetime of the upload-state record in seconds.
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
    /// Lifetime of reconciler scratch objects in seconds.
    #[serde(default = "default_scratch_ttl_secs")]
    pub scratch_ttl_secs: u64,
}

fn default_min_chunk() -> u64 {
    crate::MIN_CHUNK
}

fn default_max_chunk() -> u64 {
    crate::MAX_CHUNK
}

fn default_max_parts() -> usize {
    crate::MAX_PARTS
}

fn default_state_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_scratch_ttl_secs() -> u64 {
    60 * 60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push_compatibility: PushCompatibility::default(),
            min_chunk: default_min_chunk(),
            max_chunk: default_max_chunk(),
            max_upload_chunk: default_max_chunk(),
            max_parts: default_max_parts(),
            state_ttl_secs: default_state_ttl_secs(),
            scratch_ttl_secs: default_scratch_ttl_secs(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_chunk == 0 {
            return Err("min_chunk must be positive".to_string());
        }
        if self.min_chunk > self.max_chunk {
            return Err(format!(
                "min_chunk {} exceeds max_chunk {}",
                self.min_chunk, self.max_chunk
            ));
        }
        if self.max_upload_chunk < self.min_chunk || self.max_upload_chunk > self.max_chunk {
            return Err(format!(
                "max_upload_chunk {} must be within [{}, {}]",
                self.max_upload_chunk, self.min_chunk, self.max_chunk
            ));
        }
        if self.max_parts == 0 {
            return Err("max_parts must be positive".to_string());
        }
        Ok(())
    }

    /// Upload-state record lifetime.
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    /// Scratch-object lifetime.
    pub fn scratch_ttl(&self) -> Duration {
        Duration::from_secs(self.scratch_ttl_secs)
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage, for tests and local development.
    Memory,
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if unset.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if unset.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO
        /// and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            StorageConfig::Memory => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_chunk, crate::MIN_CHUNK);
        assert_eq!(config.max_parts, crate::MAX_PARTS);
        assert_eq!(config.push_compatibility, PushCompatibility::Off);
    }

    #[test]
    fn test_engine_config_rejects_inverted_bounds() {
        let config = EngineConfig {
            min_chunk: 10,
            max_chunk: 5,
            max_upload_chunk: 5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_deserialize_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.state_ttl(), Duration::from_secs(7200));
        assert_eq!(config.scratch_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_storage_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_s3_roundtrip() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("http://minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("registry".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: StorageConfig = serde_json::from_str(&json).unwrap();
        match decoded {
            StorageConfig::S3 {
                force_path_style, ..
            } => assert!(force_path_style),
            other => panic!("unexpected config: {other:?}"),
        }
    }
}
