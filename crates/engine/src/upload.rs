//! Upload session orchestration: start, append, finish, cancel.

use crate::error::{EngineError, EngineResult};
use crate::reconcile::Reconciler;
use crate::state::StateStore;
use crate::stream::{self, observe_digest};
use crate::{FinishedUpload, Registry, UploadStatus, blob_location, upload_location};
use stevedore_core::digest::Digest;
use stevedore_core::repository::RepositoryName;
use stevedore_core::upload::{UploadId, UploadState};
use stevedore_storage::{ByteStream, CompletedPart, PutOptions, StorageError};
use tracing::{instrument, warn};

impl Registry {
    pub(crate) fn states(&self) -> StateStore<'_> {
        StateStore::new(self.store.as_ref(), &self.config)
    }

    fn status(
        &self,
        name: &RepositoryName,
        state: &UploadState,
        fingerprint: &str,
    ) -> UploadStatus {
        UploadStatus {
            id: state.upload_id,
            location: upload_location(name, &state.upload_id, fingerprint),
            range: state.accepted_range(),
            min_chunk: self.config.min_chunk,
            max_chunk: self.config.max_chunk,
        }
    }

    /// Open a resumable upload: allocate the id, start the multipart upload
    /// against the staging key, and persist the empty cursor.
    #[instrument(skip(self), fields(repo = %name))]
    pub async fn start_upload(&self, name: &RepositoryName) -> EngineResult<UploadStatus> {
        let id = UploadId::new();
        let store_upload_id = self
            .store
            .create_multipart(&id.staging_key())
            .await
            .map_err(EngineError::storage("create-multipart"))?;

        let state = UploadState::new(id, store_upload_id, name.clone());
        let fingerprint = self.states().persist(&state).await?;
        Ok(self.status(name, &state, &fingerprint))
    }

    /// Report the current cursor. Does not validate a fingerprint: a status
    /// query never advances the upload.
    #[instrument(skip(self), fields(repo = %name))]
    pub async fn get_upload(
        &self,
        name: &RepositoryName,
        id: &UploadId,
    ) -> EngineResult<UploadStatus> {
        let loaded = self.states().load(name, id, None).await?;
        Ok(self.status(name, &loaded.state, &loaded.fingerprint))
    }

    /// Append one client chunk.
    ///
    /// The fingerprint linearizes appends: of two racing writers, at most
    /// one matches the authoritative copy, and the loser gets a range error
    /// without the store being touched.
    #[instrument(skip(self, body), fields(repo = %name, len = length))]
    pub async fn upload_chunk(
        &self,
        name: &RepositoryName,
        id: &UploadId,
        fingerprint: &str,
        body: ByteStream,
        length: u64,
        content_range: Option<(u64, u64)>,
    ) -> EngineResult<UploadStatus> {
        let loaded = self.states().load(name, id, Some(fingerprint)).await?;
        let mut state = loaded.state;

        if let Some((start, end)) = content_range {
            let valid = start == state.byte_range && start < end && end - start + 1 == length;
            if !valid {
                return Err(EngineError::Range {
                    accepted: state.byte_range,
                    fingerprint: loaded.fingerprint,
                });
            }
        }
        if length == 0 {
            return Err(EngineError::Client("empty chunk".to_string()));
        }

        let upload = self
            .store
            .resume_multipart(&id.staging_key(), &state.store_upload_id)
            .await
            .map_err(EngineError::storage("resume-multipart"))?;
        let mut reconciler = Reconciler::new(
            self.store.as_ref(),
            &self.config,
            upload,
            loaded.fingerprint.clone(),
            state.byte_range,
        );
        reconciler.append(&mut state, body, length).await?;

        let fingerprint = self.states().persist(&state).await?;

        // Scratch copies undone by a repair only matter until the new state
        // is durable; reap them now rather than waiting out their TTL.
        for key in reconciler.reclaimed_scratch() {
            if let Err(e) = self.store.delete(key).await
                && !matches!(e, StorageError::NotFound(_))
            {
                warn!(key = %key, error = %e, "failed to delete reclaimed scratch object");
            }
        }

        Ok(self.status(name, &state, &fingerprint))
    }

    /// Seal the upload under its content digest.
    ///
    /// With no parts accepted, this is the monolithic finish and the body is
    /// required. With parts accepted, any non-empty trailing body is
    /// rejected; clients must append remaining bytes first and finish with
    /// an empty body.
    #[instrument(skip(self, body), fields(repo = %name, digest = %digest))]
    pub async fn finish_upload(
        &self,
        name: &RepositoryName,
        id: &UploadId,
        fingerprint: &str,
        digest: &Digest,
        body: Option<(ByteStream, u64)>,
    ) -> EngineResult<FinishedUpload> {
        let loaded = self.states().load(name, id, Some(fingerprint)).await?;
        let state = loaded.state;
        let staging = state.upload_id.staging_key();

        if state.parts.is_empty() {
            let Some((body, length)) = body else {
                return Err(EngineError::Client(
                    "finishing an upload with no accepted parts requires a body".to_string(),
                ));
            };
            if length > self.config.max_chunk {
                return Err(EngineError::BlobTooLarge {
                    size: length,
                    max: self.config.max_chunk,
                });
            }

            let (body, tee) = observe_digest(body);
            let data = stream::collect_exact(body, length).await?;
            let actual = tee.digest();
            if actual != *digest {
                return Err(EngineError::Client(format!(
                    "digest mismatch: body hashes to {actual}"
                )));
            }

            let opts = PutOptions::default()
                .with_sha256(digest.to_hex())
                .with_content_type("application/octet-stream");
            self.store
                .put(&name.blob_key(digest), data, opts)
                .await
                .map_err(EngineError::storage("put-blob"))?;

            // The staging multipart upload never received a part.
            self.abort_staging(&staging, &state.store_upload_id).await;
        } else {
            if let Some((_, length)) = &body
                && *length > 0
            {
                return Err(EngineError::Client(
                    "trailing bytes at finish are not accepted; append them as a chunk first"
                        .to_string(),
                ));
            }

            // Every part except the last must clear the store bounds, or the
            // assembly is doomed; fail it here instead of at the store.
            if let Some((_, leading)) = state.chunks.split_last() {
                for chunk in leading {
                    if chunk.size() < self.config.min_chunk
                        || chunk.size() > self.config.max_chunk
                    {
                        return Err(EngineError::Client(format!(
                            "part of {} bytes cannot precede the final part",
                            chunk.size()
                        )));
                    }
                }
            }

            let parts: Vec<CompletedPart> = state
                .parts
                .iter()
                .map(|p| CompletedPart {
                    number: p.number,
                    etag: p.etag.clone(),
                })
                .collect();
            let handle = self
                .store
                .resume_multipart(&staging, &state.store_upload_id)
                .await
                .map_err(EngineError::storage("resume-multipart"))?;
            handle
                .complete(&parts)
                .await
                .map_err(EngineError::storage("complete-multipart"))?;

            // Re-materialize the assembled object under its digest key,
            // stamping the digest hint the completion call could not carry.
            let opts = PutOptions::default()
                .with_sha256(digest.to_hex())
                .with_content_type("application/octet-stream");
            self.store
                .copy(&staging, &name.blob_key(digest), opts)
                .await
                .map_err(EngineError::storage("copy-blob"))?;
            if let Err(e) = self.store.delete(&staging).await
                && !matches!(e, StorageError::NotFound(_))
            {
                warn!(key = %staging, error = %e, "failed to delete staging object");
            }
        }

        self.cleanup_scratch(&state).await;
        self.states().remove(name, id).await?;

        Ok(FinishedUpload {
            digest: *digest,
            location: blob_location(name, digest),
        })
    }

    /// Abort the upload, discarding parts, scratch copies, and the cursor.
    /// A missing upload reports not-found, so a second cancel is visible as
    /// such.
    #[instrument(skip(self), fields(repo = %name))]
    pub async fn cancel_upload(&self, name: &RepositoryName, id: &UploadId) -> EngineResult<()> {
        let loaded = self.states().load(name, id, None).await?;
        let state = loaded.state;

        self.abort_staging(&state.upload_id.staging_key(), &state.store_upload_id)
            .await;
        self.cleanup_scratch(&state).await;
        self.states().remove(name, id).await?;
        Ok(())
    }

    /// Accept a whole blob in one request.
    ///
    /// An unknown size is learned by buffering; anything past the part limit
    /// reports too-large so the caller falls back to the chunked path.
    #[instrument(skip(self, body), fields(repo = %name, digest = %digest))]
    pub async fn monolithic_upload(
        &self,
        name: &RepositoryName,
        digest: &Digest,
        body: ByteStream,
        size: Option<u64>,
    ) -> EngineResult<FinishedUpload> {
        let (body, tee) = observe_digest(body);
        let data = match size {
            Some(size) if size > self.config.max_chunk => {
                return Err(EngineError::BlobTooLarge {
                    size,
                    max: self.config.max_chunk,
                });
            }
            Some(size) => stream::collect_exact(body, size).await?,
            None => stream::drain_capped(body, self.config.max_chunk).await?,
        };

        let actual = tee.digest();
        if actual != *digest {
            return Err(EngineError::Client(format!(
                "digest mismatch: body hashes to {actual}"
            )));
        }

        let opts = PutOptions::default()
            .with_sha256(digest.to_hex())
            .with_content_type("application/octet-stream");
        self.store
            .put(&name.blob_key(digest), data, opts)
            .await
            .map_err(EngineError::storage("put-blob"))?;

        Ok(FinishedUpload {
            digest: *digest,
            location: blob_location(name, digest),
        })
    }

    /// Best-effort abort of the staging multipart upload.
    async fn abort_staging(&self, staging: &str, store_upload_id: &str) {
        match self.store.resume_multipart(staging, store_upload_id).await {
            Ok(handle) => {
                if let Err(e) = handle.abort().await {
                    warn!(key = %staging, error = %e, "failed to abort multipart upload");
                }
            }
            Err(e) => {
                warn!(key = %staging, error = %e, "failed to resume multipart upload for abort");
            }
        }
    }

    /// Best-effort deletion of every scratch copy the chain still references.
    async fn cleanup_scratch(&self, state: &UploadState) {
        for chunk in &state.chunks {
            if let Some(key) = chunk.scratch_key()
                && let Err(e) = self.store.delete(key).await
                && !matches!(e, StorageError::NotFound(_))
            {
                warn!(key = %key, error = %e, "failed to delete scratch object");
            }
        }
    }
}
