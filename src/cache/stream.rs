//! Single-pass hash + cache tee for upstream blob fetches.
//!
//! One producer consumes the upstream byte stream exactly once. Every chunk
//! is fed to an incremental SHA-256, appended to a replayable fan-out buffer
//! for any number of client subscribers, and written to a dot-prefixed part
//! file. On EOF the digest is finalized: a match renames the part file into
//! place and records metadata; a mismatch or stream error deletes it. A
//! failed cache write never aborts the client stream.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::store::{now_seconds, CacheStore};

// ---------------------------------------------------------------------------
// Fan-out buffer
// ---------------------------------------------------------------------------

/// Replayable chunk buffer shared by all subscribers of one in-flight fetch.
///
/// Chunks are kept until the owning fetch entry is dropped, so a subscriber
/// attaching at any point before EOF observes identical bytes in identical
/// order from offset zero.
pub struct FanoutBuffer {
    inner: Mutex<FanoutInner>,
    version: watch::Sender<u64>,
}

struct FanoutInner {
    chunks: Vec<Bytes>,
    finished: Option<Result<(), String>>,
}

impl FanoutBuffer {
    pub fn new() -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(FanoutInner {
                chunks: Vec::new(),
                finished: None,
            }),
            version,
        })
    }

    pub(crate) fn push(&self, chunk: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        inner.chunks.push(chunk);
        drop(inner);
        self.version.send_modify(|v| *v += 1);
    }

    /// Mark the stream complete. `Err` propagates to every subscriber that
    /// has not yet reached the tail.
    pub(crate) fn finish(&self, result: Result<(), String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.finished.is_none() {
            inner.finished = Some(result);
        }
        drop(inner);
        self.version.send_modify(|v| *v += 1);
    }

    /// A fresh reader over the buffered bytes followed by the live tail.
    pub fn subscribe(self: &Arc<Self>) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let buffer = Arc::clone(self);
        let version = self.version.subscribe();

        futures::stream::unfold(
            (buffer, version, 0usize, false),
            |(buffer, mut version, index, errored)| async move {
                if errored {
                    return None;
                }
                loop {
                    {
                        let inner = buffer.inner.lock().unwrap();
                        if index < inner.chunks.len() {
                            let chunk = inner.chunks[index].clone();
                            drop(inner);
                            return Some((Ok(chunk), (buffer, version, index + 1, false)));
                        }
                        match &inner.finished {
                            Some(Ok(())) => return None,
                            Some(Err(reason)) => {
                                let err = io::Error::other(reason.clone());
                                drop(inner);
                                return Some((Err(err), (buffer, version, index, true)));
                            }
                            None => {}
                        }
                    }
                    if version.changed().await.is_err() {
                        // Producer vanished without finishing.
                        let err = io::Error::other("fetch aborted");
                        return Some((Err(err), (buffer, version, index, true)));
                    }
                }
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Tee driver
// ---------------------------------------------------------------------------

/// Outcome of one tee run, reported back to the dedup handle.
pub struct TeeOutcome {
    /// Whether the finalized hash matched the expected digest. `false` for
    /// stream errors too.
    pub hash_valid: bool,
    /// The stream failed before EOF, so the hash never got a verdict.
    pub aborted: bool,
    /// Bytes that flowed through the hasher.
    pub bytes: u64,
}

/// Drive `upstream` to completion through hasher, part file, and fan-out.
///
/// Every byte flows through the hasher exactly once and into the part file
/// at most once; the verified file appears at its final path only after the
/// digest check passes.
pub async fn run_tee<S, E>(
    store: &CacheStore,
    digest: &str,
    upstream: S,
    buffer: &Arc<FanoutBuffer>,
) -> TeeOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let part_path = store.part_path(digest);

    // A failed part-file create degrades to hash-and-serve without caching.
    let mut part_file = match tokio::fs::File::create(&part_path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(digest = %digest, error = %e, "cache part file could not be created");
            None
        }
    };

    let mut hasher = Sha256::new();
    let mut bytes: u64 = 0;

    while let Some(chunk) = upstream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                // Stream abort: drop the partial file and fail subscribers.
                warn!(digest = %digest, error = %e, "upstream stream failed mid-transfer");
                drop(part_file.take());
                let _ = tokio::fs::remove_file(&part_path).await;
                buffer.finish(Err(format!("upstream stream failed: {e}")));
                return TeeOutcome {
                    hash_valid: false,
                    aborted: true,
                    bytes,
                };
            }
        };

        hasher.update(&chunk);
        bytes += chunk.len() as u64;

        if let Some(file) = part_file.as_mut() {
            if let Err(e) = file.write_all(&chunk).await {
                warn!(digest = %digest, error = %e, "cache write failed, continuing without cache");
                drop(part_file.take());
                let _ = tokio::fs::remove_file(&part_path).await;
            }
        }

        buffer.push(chunk);
    }

    // EOF: close the part file before validating so every byte is on disk.
    let mut cache_ok = false;
    if let Some(mut file) = part_file.take() {
        match file.flush().await {
            Ok(()) => cache_ok = true,
            Err(e) => {
                warn!(digest = %digest, error = %e, "cache flush failed");
                let _ = tokio::fs::remove_file(&part_path).await;
            }
        }
    }

    let computed = hex::encode(hasher.finalize());
    let hash_valid = computed.eq_ignore_ascii_case(digest);

    if hash_valid {
        if cache_ok {
            match tokio::fs::rename(&part_path, store.blob_path(digest)).await {
                Ok(()) => {
                    store.write_and_record(digest, bytes, now_seconds()).await;
                    debug!(digest = %digest, bytes, "blob verified and cached");
                }
                Err(e) => {
                    warn!(digest = %digest, error = %e, "verified blob could not be moved into cache");
                    let _ = tokio::fs::remove_file(&part_path).await;
                }
            }
        }
        buffer.finish(Ok(()));
    } else {
        // Poisoned transfer: the bytes already sent cannot be recalled, but
        // nothing may survive on disk.
        warn!(
            expected = %digest,
            computed = %computed,
            bytes,
            "digest mismatch, discarding fetched blob"
        );
        let _ = tokio::fs::remove_file(&part_path).await;
        buffer.finish(Ok(()));
    }

    TeeOutcome {
        hash_valid,
        aborted: false,
        bytes,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use sha2::Sha256;

    fn digest_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn ok_chunks(parts: &[&[u8]]) -> Vec<Result<Bytes, std::io::Error>> {
        parts.iter().map(|p| Ok(Bytes::copy_from_slice(p))).collect()
    }

    async fn collect(s: impl Stream<Item = io::Result<Bytes>>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut s = std::pin::pin!(s);
        while let Some(chunk) = s.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    // ── fan-out buffer ──────────────────────────────────────────────────

    #[tokio::test]
    async fn late_subscriber_sees_identical_bytes() {
        let buffer = FanoutBuffer::new();
        buffer.push(Bytes::from_static(b"hel"));
        buffer.push(Bytes::from_static(b"lo"));

        let early = buffer.subscribe();
        buffer.push(Bytes::from_static(b" world"));
        let late = buffer.subscribe();
        buffer.finish(Ok(()));

        assert_eq!(collect(early).await.unwrap(), b"hello world");
        assert_eq!(collect(late).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn subscriber_blocks_until_chunks_arrive() {
        let buffer = FanoutBuffer::new();
        let reader = tokio::spawn(collect(buffer.subscribe()));

        tokio::task::yield_now().await;
        buffer.push(Bytes::from_static(b"data"));
        buffer.finish(Ok(()));

        assert_eq!(reader.await.unwrap().unwrap(), b"data");
    }

    #[tokio::test]
    async fn error_finish_propagates_to_subscribers() {
        let buffer = FanoutBuffer::new();
        buffer.push(Bytes::from_static(b"partial"));
        buffer.finish(Err("upstream died".to_string()));

        let err = collect(buffer.subscribe()).await.unwrap_err();
        assert!(err.to_string().contains("upstream died"));
    }

    #[tokio::test]
    async fn cancelled_subscriber_does_not_starve_others() {
        let buffer = FanoutBuffer::new();
        buffer.push(Bytes::from_static(b"abc"));

        let dropped = buffer.subscribe();
        drop(dropped);

        buffer.push(Bytes::from_static(b"def"));
        buffer.finish(Ok(()));
        assert_eq!(collect(buffer.subscribe()).await.unwrap(), b"abcdef");
    }

    // ── tee ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn valid_stream_caches_and_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(tmp.path(), None).await.unwrap();
        let digest = digest_of(b"hello world");

        let buffer = FanoutBuffer::new();
        let subscriber = buffer.subscribe();
        let outcome = run_tee(
            &store,
            &digest,
            stream::iter(ok_chunks(&[b"hello", b" ", b"world"])),
            &buffer,
        )
        .await;

        assert!(outcome.hash_valid);
        assert!(!outcome.aborted);
        assert_eq!(outcome.bytes, 11);
        assert_eq!(collect(subscriber).await.unwrap(), b"hello world");
        assert_eq!(
            tokio::fs::read(store.blob_path(&digest)).await.unwrap(),
            b"hello world"
        );
        assert!(!store.part_path(&digest).exists());
    }

    #[tokio::test]
    async fn digest_mismatch_deletes_file_but_completes_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(tmp.path(), None).await.unwrap();
        let wrong = digest_of(b"something else");

        let buffer = FanoutBuffer::new();
        let subscriber = buffer.subscribe();
        let outcome = run_tee(
            &store,
            &wrong,
            stream::iter(ok_chunks(&[b"poisoned content"])),
            &buffer,
        )
        .await;

        assert!(!outcome.hash_valid);
        // Subscribers still drain the full body; only the disk is protected.
        assert_eq!(collect(subscriber).await.unwrap(), b"poisoned content");
        assert!(!store.blob_path(&wrong).exists());
        assert!(!store.part_path(&wrong).exists());
    }

    #[tokio::test]
    async fn stream_error_aborts_and_cleans_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(tmp.path(), None).await.unwrap();
        let digest = digest_of(b"never arrives");

        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"first")),
            Err(std::io::Error::other("connection reset")),
        ];

        let buffer = FanoutBuffer::new();
        let subscriber = buffer.subscribe();
        let outcome = run_tee(&store, &digest, stream::iter(chunks), &buffer).await;

        assert!(!outcome.hash_valid);
        assert!(outcome.aborted);
        assert!(collect(subscriber).await.is_err());
        assert!(!store.blob_path(&digest).exists());
        assert!(!store.part_path(&digest).exists());
    }

    #[tokio::test]
    async fn digest_comparison_is_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CacheStore::open(tmp.path(), None).await.unwrap();
        let digest = digest_of(b"abc").to_uppercase();

        let buffer = FanoutBuffer::new();
        let outcome = run_tee(&store, &digest, stream::iter(ok_chunks(&[b"abc"])), &buffer).await;

        assert!(outcome.hash_valid);
    }
}
