//! Upload-state codec and the cross-request freshness protocol.
//!
//! The token a client carries is the serialized state record itself; the
//! fingerprint is `SHA-256(token bytes)` in hex. Freshness comes entirely
//! from the authoritative copy at `<repo>/uploads/<id>`: a request whose
//! fingerprint no longer matches that copy lost a race and is answered with
//! a range error carrying the real cursor. There is no signature; the store
//! copy always wins, so nothing a client could forge matters.

use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use stevedore_core::config::EngineConfig;
use stevedore_core::digest::Digest;
use stevedore_core::repository::RepositoryName;
use stevedore_core::upload::{UploadId, UploadState};
use stevedore_storage::{ObjectStore, PutOptions, StorageError};

/// A state record loaded from the authoritative copy.
pub(crate) struct LoadedState {
    pub state: UploadState,
    pub fingerprint: String,
}

pub(crate) struct StateStore<'a> {
    store: &'a dyn ObjectStore,
    config: &'a EngineConfig,
}

impl<'a> StateStore<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    /// Serialize `state`, write the authoritative copy, and return the new
    /// fingerprint.
    pub async fn persist(&self, state: &UploadState) -> EngineResult<String> {
        state
            .validate()
            .map_err(|e| EngineError::Internal(format!("state invariant broken: {e}")))?;
        let token = serde_json::to_vec(state)
            .map_err(|e| EngineError::Internal(format!("state encoding failed: {e}")))?;
        let fingerprint = Digest::compute(&token).to_hex();

        let key = state.name.upload_key(&state.upload_id);
        let opts = PutOptions::default()
            .with_content_type("application/json")
            .with_expiry(self.config.state_ttl());
        self.store
            .put(&key, Bytes::from(token), opts)
            .await
            .map_err(EngineError::storage("persist-upload-state"))?;

        Ok(fingerprint)
    }

    /// Fetch and decode the authoritative state.
    ///
    /// When `expected_fingerprint` is supplied and does not match the copy's
    /// fingerprint, the caller raced another writer: the result is a range
    /// error carrying the authoritative cursor so the client can resume.
    pub async fn load(
        &self,
        name: &RepositoryName,
        id: &UploadId,
        expected_fingerprint: Option<&str>,
    ) -> EngineResult<LoadedState> {
        let key = name.upload_key(id);
        let token = match self.store.get_bytes(&key).await {
            Ok(token) => token,
            Err(StorageError::NotFound(_)) => {
                return Err(EngineError::NotFound(format!("upload {id}")));
            }
            Err(e) => return Err(EngineError::storage("load-upload-state")(e)),
        };

        let fingerprint = Digest::compute(&token).to_hex();
        let state: UploadState = serde_json::from_slice(&token)
            .map_err(|e| EngineError::Internal(format!("state decoding failed: {e}")))?;

        if let Some(expected) = expected_fingerprint
            && expected != fingerprint
        {
            return Err(EngineError::Range {
                accepted: state.byte_range,
                fingerprint,
            });
        }

        Ok(LoadedState { state, fingerprint })
    }

    /// Delete the authoritative copy. Absence is not an error.
    pub async fn remove(&self, name: &RepositoryName, id: &UploadId) -> EngineResult<()> {
        match self.store.delete(&name.upload_key(id)).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(EngineError::storage("remove-upload-state")(e)),
        }
    }
}
