//! Chunk reconciler: turns arbitrary client chunks into valid store parts.
//!
//! The object store demands that all parts of a multipart upload share one
//! size, except the last, bounded below and above. Clients promise nothing
//! of the sort. The reconciler resolves each arriving chunk against the
//! chunk chain in the upload state, producing zero or more store parts while
//! keeping the chain invariants intact:
//!
//! - an `Equal` chunk only ever follows an `Equal` chunk of the same size;
//! - every shrunk or sub-minimum chunk written in `full` compatibility mode
//!   keeps a live scratch copy, so a later append can undo it and recombine.
//!
//! State is mutated on a clone and committed only when every part upload
//! succeeded; a failed append leaves the authoritative cursor untouched.

use crate::error::{EngineError, EngineResult};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use stevedore_core::config::EngineConfig;
use stevedore_core::repository;
use stevedore_core::upload::{ChunkRecord, PartRecord, UploadState};
use stevedore_storage::{ByteStream, MultipartUpload, ObjectStore, PutOptions, StorageError};
use uuid::Uuid;

pub(crate) struct Reconciler<'a> {
    store: &'a dyn ObjectStore,
    config: &'a EngineConfig,
    upload: Box<dyn MultipartUpload>,
    /// Authoritative fingerprint of the state this append started from;
    /// echoed in range rejections.
    fingerprint: String,
    /// Accepted byte count before this append; echoed in range rejections.
    base_accepted: u64,
    /// Scratch keys made obsolete by repairs, deletable once the new state
    /// is persisted.
    reclaimed_scratch: Vec<String>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        config: &'a EngineConfig,
        upload: Box<dyn MultipartUpload>,
        fingerprint: String,
        base_accepted: u64,
    ) -> Self {
        Self {
            store,
            config,
            upload,
            fingerprint,
            base_accepted,
            reclaimed_scratch: Vec::new(),
        }
    }

    /// Scratch keys that stopped mattering during this append.
    pub fn reclaimed_scratch(&self) -> &[String] {
        &self.reclaimed_scratch
    }

    /// Reconcile one client chunk of `size` bytes into the upload.
    ///
    /// On success `state` has advanced by exactly `size` bytes. On any error
    /// `state` is unchanged; parts that reached the store before the failure
    /// are harmless because a retry re-uploads the same part numbers.
    pub async fn append(
        &mut self,
        state: &mut UploadState,
        stream: ByteStream,
        size: u64,
    ) -> EngineResult<()> {
        let mut next = state.clone();

        // An oversize client chunk is consumed piecewise so at most one
        // store part is ever buffered at a time.
        let mut splitter = crate::stream::Splitter::new(stream, size);
        while let Some(piece) = splitter.next_piece(self.config.max_upload_chunk).await? {
            self.apply(&mut next, piece).await?;
        }

        *state = next;
        Ok(())
    }

    /// Resolve one materialized piece against the chunk chain.
    async fn apply(&mut self, state: &mut UploadState, data: Bytes) -> EngineResult<()> {
        let mut queue = VecDeque::from([data]);

        while let Some(data) = queue.pop_front() {
            let size = data.len() as u64;
            let max = self.config.max_upload_chunk;
            let min = self.config.min_chunk;
            let full = self.config.push_compatibility.is_full();

            // Repair recombination can overshoot the part bound; shed
            // max-size pieces until the remainder fits.
            if size > max {
                requeue_split(&mut queue, data, max as usize);
                continue;
            }

            let last = state.last_chunk().cloned();

            // Ideal path: the chunk extends the equal-size run.
            let extends_run = match &last {
                None => true,
                Some(chunk) => chunk.is_equal() && chunk.size() == size,
            };
            if extends_run && size >= min && size <= max {
                let part = self.upload_one(state, data).await?;
                state.push(part, ChunkRecord::Equal { size });
                continue;
            }

            // Repair: undo a shrunk or sub-minimum tail and recombine it
            // with the new bytes. The popped part number is reused by the
            // next upload.
            if let Some(chunk) = &last
                && !chunk.is_equal()
                && full
            {
                let Some(scratch_key) = chunk.scratch_key() else {
                    return Err(self.range_error());
                };
                let scratch = match self.store.get_bytes(scratch_key).await {
                    Ok(scratch) => scratch,
                    Err(StorageError::NotFound(_)) => {
                        return Err(EngineError::Internal(format!(
                            "scratch object missing for chunk of {} bytes",
                            chunk.size()
                        )));
                    }
                    Err(e) => return Err(EngineError::storage("read-scratch")(e)),
                };
                if scratch.len() as u64 != chunk.size() {
                    return Err(EngineError::Internal(format!(
                        "scratch object holds {} bytes, chunk recorded {}",
                        scratch.len(),
                        chunk.size()
                    )));
                }

                let _ = state.pop();
                self.reclaimed_scratch.push(scratch_key.to_string());

                let mut combined = BytesMut::with_capacity(scratch.len() + data.len());
                combined.extend_from_slice(&scratch);
                combined.extend_from_slice(&data);
                queue.push_front(combined.freeze());
                continue;
            }

            // Shrink, or a sub-minimum chunk starting or ending the run.
            let shrinks = last.as_ref().is_some_and(|chunk| chunk.size() > size);
            let small = size < min && last.as_ref().is_none_or(ChunkRecord::is_equal);
            if shrinks || small {
                if full {
                    let scratch_key = repository::scratch_key(Uuid::new_v4());
                    self.upload_with_scratch(state, data, &scratch_key).await?;
                } else {
                    let part = self.upload_one(state, data).await?;
                    state.push(part, classify(size, min, None));
                }
                continue;
            }

            // Grow: keep the equal-size run going by splitting at its size.
            if let Some(chunk) = &last
                && chunk.is_equal()
                && size > chunk.size()
                && full
            {
                requeue_split(&mut queue, data, chunk.size() as usize);
                continue;
            }

            return Err(self.range_error());
        }

        Ok(())
    }

    /// Upload one part, enforcing the part-count bound.
    async fn upload_one(&mut self, state: &UploadState, data: Bytes) -> EngineResult<PartRecord> {
        if state.parts.len() >= self.config.max_parts {
            return Err(self.range_error());
        }
        let number = state.next_part_number();
        let etag = self
            .upload
            .upload_part(number, data)
            .await
            .map_err(EngineError::storage("upload-part"))?;
        Ok(PartRecord { number, etag })
    }

    /// Tee one part into the store and a scratch copy concurrently, then
    /// record the classified chunk.
    async fn upload_with_scratch(
        &mut self,
        state: &mut UploadState,
        data: Bytes,
        scratch_key: &str,
    ) -> EngineResult<()> {
        if state.parts.len() >= self.config.max_parts {
            return Err(self.range_error());
        }
        let number = state.next_part_number();
        let size = data.len() as u64;

        let upload = &mut self.upload;
        let store = self.store;
        let opts = PutOptions::default().with_expiry(self.config.scratch_ttl());
        let scratch_data = data.clone();
        let (etag, ()) = futures::try_join!(
            async move {
                upload
                    .upload_part(number, data)
                    .await
                    .map_err(EngineError::storage("upload-part"))
            },
            async move {
                store
                    .put(scratch_key, scratch_data, opts)
                    .await
                    .map_err(EngineError::storage("write-scratch"))
            },
        )?;

        state.push(
            PartRecord { number, etag },
            classify(size, self.config.min_chunk, Some(scratch_key.to_string())),
        );
        Ok(())
    }

    fn range_error(&self) -> EngineError {
        EngineError::Range {
            accepted: self.base_accepted,
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Classify a non-equal part by whether it clears the store minimum.
fn classify(size: u64, min: u64, scratch_key: Option<String>) -> ChunkRecord {
    if size < min {
        ChunkRecord::SmallTrailing { size, scratch_key }
    } else {
        ChunkRecord::Shrunk { size, scratch_key }
    }
}

/// Re-queue `data` as whole `step`-sized pieces plus a trailing remainder,
/// preserving byte order at the front of the queue.
fn requeue_split(queue: &mut VecDeque<Bytes>, data: Bytes, step: usize) {
    let mut offset = data.len();
    while offset > 0 {
        let start = if offset % step == 0 {
            offset - step
        } else {
            offset - offset % step
        };
        queue.push_front(data.slice(start..offset));
        offset = start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_split_preserves_order() {
        let data = Bytes::from((0..10u8).collect::<Vec<_>>());
        let mut queue = VecDeque::new();
        requeue_split(&mut queue, data, 4);

        let pieces: Vec<Vec<u8>> = queue.iter().map(|b| b.to_vec()).collect();
        assert_eq!(
            pieces,
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
    }

    #[test]
    fn test_requeue_split_exact_multiple() {
        let data = Bytes::from(vec![1u8; 8]);
        let mut queue = VecDeque::new();
        requeue_split(&mut queue, data, 4);
        let sizes: Vec<usize> = queue.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4]);
    }

    #[test]
    fn test_classify_boundaries() {
        assert!(matches!(
            classify(4, 5, None),
            ChunkRecord::SmallTrailing { .. }
        ));
        assert!(matches!(classify(5, 5, None), ChunkRecord::Shrunk { .. }));
    }
}
