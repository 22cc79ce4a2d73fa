//! Streaming helpers: digest tees, exact reads, and piecewise splitting.

use crate::error::{EngineError, EngineResult};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use stevedore_core::digest::{Digest, DigestHasher};
use stevedore_storage::ByteStream;

/// Wrap a one-shot buffer as a `ByteStream`.
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Handle onto a digest computed as a stream flows past.
///
/// `digest()` snapshots the hash over everything observed so far; call it
/// only after the stream has been fully drained.
#[derive(Clone)]
pub struct DigestTee {
    hasher: Arc<Mutex<DigestHasher>>,
}

impl DigestTee {
    /// Digest of all bytes that have flowed through the observed stream.
    pub fn digest(&self) -> Digest {
        self.hasher
            .lock()
            .expect("digest hasher lock poisoned")
            .clone()
            .finalize()
    }
}

/// Tee a stream through a SHA-256 hasher, yielding the same bytes.
pub fn observe_digest(stream: ByteStream) -> (ByteStream, DigestTee) {
    let tee = DigestTee {
        hasher: Arc::new(Mutex::new(Digest::hasher())),
    };
    let hasher = tee.hasher.clone();
    let observed = stream.map(move |item| {
        if let Ok(chunk) = &item {
            hasher
                .lock()
                .expect("digest hasher lock poisoned")
                .update(chunk);
        }
        item
    });
    (Box::pin(observed), tee)
}

/// Reads a stream of known total size piece by piece.
///
/// Stream items rarely align with piece boundaries; the overhang of the item
/// that crosses a boundary is carried into the next piece, so bytes are
/// never reordered or dropped.
pub struct Splitter {
    stream: ByteStream,
    carry: Option<Bytes>,
    remaining: u64,
}

impl Splitter {
    /// Split `stream`, which must yield exactly `total` bytes, into pieces.
    pub fn new(stream: ByteStream, total: u64) -> Self {
        Self {
            stream,
            carry: None,
            remaining: total,
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read the next piece of up to `piece_size` bytes.
    ///
    /// Every piece is exactly `piece_size` bytes except the last, which is
    /// the remainder. Returns `None` once the declared total is consumed and
    /// an error if the source ends early.
    pub async fn next_piece(&mut self, piece_size: u64) -> EngineResult<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if piece_size == 0 {
            return Err(EngineError::Internal("zero piece size".to_string()));
        }

        let want = self.remaining.min(piece_size) as usize;
        let mut buf = BytesMut::with_capacity(want);

        if let Some(carry) = self.carry.take() {
            if carry.len() > want {
                buf.extend_from_slice(&carry.slice(..want));
                self.carry = Some(carry.slice(want..));
            } else {
                buf.extend_from_slice(&carry);
            }
        }

        while buf.len() < want {
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    let need = want - buf.len();
                    if chunk.len() > need {
                        buf.extend_from_slice(&chunk.slice(..need));
                        self.carry = Some(chunk.slice(need..));
                    } else {
                        buf.extend_from_slice(&chunk);
                    }
                }
                Some(Err(e)) => return Err(EngineError::storage("read-body")(e)),
                None => {
                    return Err(EngineError::Client(format!(
                        "request body ended early: {} bytes missing",
                        self.remaining as usize - buf.len()
                    )));
                }
            }
        }

        self.remaining -= want as u64;
        Ok(Some(buf.freeze()))
    }
}

/// Read exactly `n` bytes from a stream, failing if the source is short.
pub async fn collect_exact(stream: ByteStream, n: u64) -> EngineResult<Bytes> {
    let mut splitter = Splitter::new(stream, n);
    let piece = splitter.next_piece(n.max(1)).await?;
    Ok(piece.unwrap_or_default())
}

/// Drain a stream of unknown length, failing once it exceeds `cap` bytes.
pub async fn drain_capped(mut stream: ByteStream, cap: u64) -> EngineResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(EngineError::storage("read-body"))?;
        if buf.len() as u64 + chunk.len() as u64 > cap {
            return Err(EngineError::BlobTooLarge {
                size: buf.len() as u64 + chunk.len() as u64,
                max: cap,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
