//! Resumable upload state: the cross-request cursor for a blob push.

use crate::repository::RepositoryName;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a resumable upload. Also names the multipart
/// staging object the parts are assembled into.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidUploadId(e.to_string()))
    }

    /// Object key of the in-flight multipart staging object.
    pub fn staging_key(&self) -> String {
        self.0.to_string()
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One client-visible append that became a store part.
///
/// Once the chain transitions away from `Equal`, it never returns: the store
/// requires all parts except the last to share a size, so a shrunk or
/// sub-minimum part can only be followed by further non-`Equal` parts or
/// repaired by recombining its scratch copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChunkRecord {
    /// A part matching the size of every other `Equal` part in the chain.
    Equal { size: u64 },
    /// A part smaller than its predecessors. `scratch_key` holds a second
    /// copy of the bytes when compatibility mode allowed one.
    Shrunk {
        size: u64,
        scratch_key: Option<String>,
    },
    /// A part below the store minimum.
    SmallTrailing {
        size: u64,
        scratch_key: Option<String>,
    },
}

impl ChunkRecord {
    /// Size of the part this record describes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Equal { size }
            | Self::Shrunk { size, .. }
            | Self::SmallTrailing { size, .. } => *size,
        }
    }

    /// Whether this record is part of the equal-size run.
    pub fn is_equal(&self) -> bool {
        matches!(self, Self::Equal { .. })
    }

    /// Scratch key carrying a recoverable copy of the bytes, if any.
    pub fn scratch_key(&self) -> Option<&str> {
        match self {
            Self::Equal { .. } => None,
            Self::Shrunk { scratch_key, .. } | Self::SmallTrailing { scratch_key, .. } => {
                scratch_key.as_deref()
            }
        }
    }
}

/// A store part accepted into the multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub number: i32,
    pub etag: String,
}

/// The authoritative cursor for one in-flight blob push.
///
/// Exactly one copy lives in the object store at `<repo>/uploads/<id>`; the
/// token a client carries is the serialized form of this record and the
/// fingerprint is the SHA-256 of those bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadState {
    /// Stable id for the whole upload; also the staging key.
    pub upload_id: UploadId,
    /// Token the object store issued for the multipart upload.
    pub store_upload_id: String,
    /// Target repository.
    pub name: RepositoryName,
    /// Total bytes accepted so far.
    pub byte_range: u64,
    /// Parts accepted by the store, in part-number order.
    pub parts: Vec<PartRecord>,
    /// Chunk chain, one record per part.
    pub chunks: Vec<ChunkRecord>,
    /// When the upload was started.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UploadState {
    /// Create the empty state for a freshly started upload.
    pub fn new(upload_id: UploadId, store_upload_id: String, name: RepositoryName) -> Self {
        Self {
            upload_id,
            store_upload_id,
            name,
            byte_range: 0,
            parts: Vec::new(),
            chunks: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// The part number the next upload will use.
    pub fn next_part_number(&self) -> i32 {
        self.parts.len() as i32 + 1
    }

    /// The most recent chunk record, if any.
    pub fn last_chunk(&self) -> Option<&ChunkRecord> {
        self.chunks.last()
    }

    /// Record an accepted part and its chunk, advancing the cursor.
    pub fn push(&mut self, part: PartRecord, chunk: ChunkRecord) {
        self.byte_range += chunk.size();
        self.parts.push(part);
        self.chunks.push(chunk);
    }

    /// Undo the most recent part/chunk pair, rewinding the cursor.
    pub fn pop(&mut self) -> Option<(PartRecord, ChunkRecord)> {
        let part = self.parts.pop()?;
        let chunk = self.chunks.pop()?;
        self.byte_range -= chunk.size();
        Some((part, chunk))
    }

    /// The inclusive accepted byte range, or `None` before any bytes landed.
    pub fn accepted_range(&self) -> Option<(u64, u64)> {
        if self.byte_range == 0 {
            None
        } else {
            Some((0, self.byte_range - 1))
        }
    }

    /// Check the chain invariants:
    /// sizes sum to `byte_range`, parts and chunks stay paired, and no
    /// `Equal` chunk follows a non-`Equal` one (with all `Equal` sizes
    /// matching).
    pub fn validate(&self) -> crate::Result<()> {
        if self.parts.len() != self.chunks.len() {
            return Err(crate::Error::UploadState(format!(
                "{} parts but {} chunks",
                self.parts.len(),
                self.chunks.len()
            )));
        }
        let total: u64 = self.chunks.iter().map(ChunkRecord::size).sum();
        if total != self.byte_range {
            return Err(crate::Error::UploadState(format!(
                "chunk sizes sum to {total} but byte range is {}",
                self.byte_range
            )));
        }
        for (i, window) in self.chunks.windows(2).enumerate() {
            if window[1].is_equal() {
                if !window[0].is_equal() {
                    return Err(crate::Error::UploadState(format!(
                        "equal chunk at {} follows non-equal chunk",
                        i + 1
                    )));
                }
                if window[0].size() != window[1].size() {
                    return Err(crate::Error::UploadState(format!(
                        "equal chunk at {} changes size from {} to {}",
                        i + 1,
                        window[0].size(),
                        window[1].size()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> UploadState {
        UploadState::new(
            UploadId::new(),
            "store-upload-1".to_string(),
            RepositoryName::parse("lib/app").unwrap(),
        )
    }

    fn part(n: i32) -> PartRecord {
        PartRecord {
            number: n,
            etag: format!("etag-{n}"),
        }
    }

    #[test]
    fn test_upload_id_roundtrip() {
        let id = UploadId::new();
        let parsed = UploadId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(UploadId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_push_pop_cursor() {
        let mut state = sample_state();
        state.push(part(1), ChunkRecord::Equal { size: 100 });
        state.push(part(2), ChunkRecord::Equal { size: 100 });
        assert_eq!(state.byte_range, 200);
        assert_eq!(state.next_part_number(), 3);
        assert_eq!(state.accepted_range(), Some((0, 199)));

        let (popped, chunk) = state.pop().unwrap();
        assert_eq!(popped.number, 2);
        assert_eq!(chunk.size(), 100);
        assert_eq!(state.byte_range, 100);
        assert_eq!(state.next_part_number(), 2);
    }

    #[test]
    fn test_validate_catches_equal_after_shrunk() {
        let mut state = sample_state();
        state.push(part(1), ChunkRecord::Equal { size: 100 });
        state.push(
            part(2),
            ChunkRecord::Shrunk {
                size: 50,
                scratch_key: Some("scratch/x".to_string()),
            },
        );
        assert!(state.validate().is_ok());

        state.push(part(3), ChunkRecord::Equal { size: 100 });
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_validate_catches_size_drift() {
        let mut state = sample_state();
        state.push(part(1), ChunkRecord::Equal { size: 100 });
        state.chunks.push(ChunkRecord::Equal { size: 80 });
        state.parts.push(part(2));
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = sample_state();
        state.push(
            part(1),
            ChunkRecord::SmallTrailing {
                size: 10,
                scratch_key: None,
            },
        );
        let json = serde_json::to_vec(&state).unwrap();
        let back: UploadState = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.byte_range, 10);
        assert_eq!(back.chunks, state.chunks);
        assert_eq!(back.parts, state.parts);
    }

    #[test]
    fn test_empty_range_is_none() {
        assert_eq!(sample_state().accepted_range(), None);
    }
}
