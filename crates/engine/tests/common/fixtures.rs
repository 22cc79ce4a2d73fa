//! Deterministic byte fixtures and stream helpers.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use stevedore_core::digest::Digest;
use stevedore_core::repository::RepositoryName;
use stevedore_core::upload::{UploadId, UploadState};
use stevedore_engine::{Registry, UploadStatus};
use stevedore_storage::{ByteStream, ObjectStore};

/// Deterministic pseudo-random bytes from a seed.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.push(state as u8);
    }
    Bytes::from(out)
}

/// Wrap data as a request body whose items never align with part
/// boundaries, so tests exercise the splitter's carry path.
#[allow(dead_code)]
pub fn body(data: &Bytes) -> ByteStream {
    let items: Vec<stevedore_storage::StorageResult<Bytes>> = data
        .chunks(1500)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(futures::stream::iter(items))
}

/// Drain a stream into one buffer.
#[allow(dead_code)]
pub async fn collect(mut stream: ByteStream) -> Bytes {
    let mut buf = BytesMut::new();
    while let Some(item) = stream.next().await {
        buf.extend_from_slice(&item.expect("stream item should be ok"));
    }
    buf.freeze()
}

/// Pull the fingerprint out of a resume location.
#[allow(dead_code)]
pub fn fingerprint_of(status: &UploadStatus) -> String {
    status
        .location
        .split("_state=")
        .nth(1)
        .expect("location should embed a fingerprint")
        .to_string()
}

/// Read the authoritative upload-state record straight from the store.
#[allow(dead_code)]
pub async fn read_state(
    store: &Arc<dyn ObjectStore>,
    name: &RepositoryName,
    id: &UploadId,
) -> UploadState {
    let bytes = store
        .get_bytes(&name.upload_key(id))
        .await
        .expect("state record should exist");
    serde_json::from_slice(&bytes).expect("state record should decode")
}

/// Push `data` through the chunked path with the given chunk sizes and
/// finish under its digest.
#[allow(dead_code)]
pub async fn push_chunked(
    registry: &Registry,
    name: &RepositoryName,
    data: &Bytes,
    chunk_sizes: &[usize],
) -> Digest {
    assert_eq!(
        chunk_sizes.iter().sum::<usize>(),
        data.len(),
        "chunk sizes must cover the data"
    );

    let start = registry.start_upload(name).await.expect("start should work");
    let mut fingerprint = fingerprint_of(&start);
    let mut offset = 0usize;

    for &len in chunk_sizes {
        let chunk = data.slice(offset..offset + len);
        let status = registry
            .upload_chunk(
                name,
                &start.id,
                &fingerprint,
                body(&chunk),
                len as u64,
                Some((offset as u64, (offset + len - 1) as u64)),
            )
            .await
            .expect("append should work");
        fingerprint = fingerprint_of(&status);
        offset += len;
    }

    let digest = Digest::compute(data);
    registry
        .finish_upload(name, &start.id, &fingerprint, &digest, None)
        .await
        .expect("finish should work");
    digest
}
