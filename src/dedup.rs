//! In-flight fetch deduplication.
//!
//! Concurrent requests for the same digest collapse onto one upstream fetch:
//! the first arrival inserts a shared [`FetchHandle`] into the digest-keyed
//! map and spawns the producer; later arrivals receive the same handle and
//! subscribe to its fan-out buffer. The entry is removed when the producer
//! finishes, success or not, while handles already obtained stay readable.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::stream::FanoutBuffer;

// ---------------------------------------------------------------------------
// Handle types
// ---------------------------------------------------------------------------

/// Response metadata from the winning upstream server.
#[derive(Debug, Clone)]
pub struct UpstreamMeta {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Where an in-flight fetch currently stands.
#[derive(Debug, Clone)]
pub enum FetchPhase {
    /// Resolving candidates / connecting. Nothing to read yet.
    Connecting,
    /// All candidate servers failed; there will be no stream.
    Failed,
    /// Bytes are flowing (or already complete).
    Streaming(UpstreamMeta),
}

/// Shared state of one in-flight fetch for a digest.
pub struct FetchHandle {
    buffer: Arc<FanoutBuffer>,
    phase_rx: watch::Receiver<FetchPhase>,
    hash_valid_rx: watch::Receiver<Option<bool>>,
    cache_written_rx: watch::Receiver<bool>,
}

impl FetchHandle {
    /// Wait until the producer either connected or exhausted its candidates.
    /// `None` means no upstream produced the blob.
    pub async fn upstream_meta(&self) -> Option<UpstreamMeta> {
        let mut rx = self.phase_rx.clone();
        let phase = rx
            .wait_for(|p| !matches!(p, FetchPhase::Connecting))
            .await
            .ok()?
            .clone();
        match phase {
            FetchPhase::Streaming(meta) => Some(meta),
            _ => None,
        }
    }

    /// A fresh, independent reader over the full byte sequence.
    pub fn subscribe(&self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        self.buffer.subscribe()
    }

    /// Resolves once the digest check has run. `false` for mismatches and
    /// aborted transfers.
    pub async fn hash_valid(&self) -> bool {
        let mut rx = self.hash_valid_rx.clone();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => value.unwrap_or(false),
            Err(_) => false,
        };
        result
    }

    /// Resolves once the cache-writer branch has settled, success or not.
    pub async fn cache_written(&self) {
        let mut rx = self.cache_written_rx.clone();
        let _ = rx.wait_for(|v| *v).await;
    }
}

/// Producer-side ends of a [`FetchHandle`].
pub struct FetchDriver {
    pub digest: String,
    pub buffer: Arc<FanoutBuffer>,
    phase_tx: watch::Sender<FetchPhase>,
    hash_valid_tx: watch::Sender<Option<bool>>,
    cache_written_tx: watch::Sender<bool>,
}

impl FetchDriver {
    /// Record the winning upstream's metadata; subscribers waiting in
    /// [`FetchHandle::upstream_meta`] unblock.
    pub fn start_streaming(&self, meta: UpstreamMeta) {
        let _ = self.phase_tx.send(FetchPhase::Streaming(meta));
    }

    /// Settle the latches after the tee finished. Call in this order so
    /// `hash_valid` observers always see a settled cache-writer first.
    pub fn settle(&self, hash_valid: bool) {
        let _ = self.cache_written_tx.send(true);
        let _ = self.hash_valid_tx.send(Some(hash_valid));
    }

    /// Mark the fetch as failed before any byte arrived: no candidate server
    /// produced the blob.
    pub fn fail(&self, reason: &str) {
        let _ = self.phase_tx.send(FetchPhase::Failed);
        self.buffer.finish(Err(reason.to_string()));
        self.settle(false);
    }
}

// ---------------------------------------------------------------------------
// In-flight map
// ---------------------------------------------------------------------------

/// Digest-keyed map of in-flight fetches. At most one entry per digest.
#[derive(Clone, Default)]
pub struct InflightMap {
    inner: Arc<Mutex<HashMap<String, Arc<FetchHandle>>>>,
}

impl InflightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fetches currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Return the existing handle for `digest`, or insert a fresh one and
    /// spawn `produce` with its driver. The map entry is removed when
    /// `produce` returns, regardless of outcome.
    pub fn get_or_create<F, Fut>(&self, digest: &str, produce: F) -> Arc<FetchHandle>
    where
        F: FnOnce(FetchDriver) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut map = self.inner.lock().unwrap();

        if let Some(existing) = map.get(digest) {
            debug!(digest = %digest, "joining in-flight fetch");
            return Arc::clone(existing);
        }

        let buffer = FanoutBuffer::new();
        let (phase_tx, phase_rx) = watch::channel(FetchPhase::Connecting);
        let (hash_valid_tx, hash_valid_rx) = watch::channel(None);
        let (cache_written_tx, cache_written_rx) = watch::channel(false);

        let handle = Arc::new(FetchHandle {
            buffer: Arc::clone(&buffer),
            phase_rx,
            hash_valid_rx,
            cache_written_rx,
        });
        map.insert(digest.to_string(), Arc::clone(&handle));
        drop(map);

        let driver = FetchDriver {
            digest: digest.to_string(),
            buffer,
            phase_tx,
            hash_valid_tx,
            cache_written_tx,
        };

        let task = produce(driver);
        let map_ref = Arc::clone(&self.inner);
        let key = digest.to_string();
        tokio::spawn(async move {
            task.await;
            map_ref.lock().unwrap().remove(&key);
        });

        handle
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
