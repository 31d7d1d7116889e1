use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: RequestMethod,
    pub cache_status: CacheStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RequestMethod {
    Get,
    Head,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    Hit,
    Miss,
    Conditional,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    pub outcome: FetchOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchOutcome {
    /// Digest verified, blob cached.
    Verified,
    /// Bytes arrived but the digest did not match.
    Poisoned,
    /// The winning stream failed before EOF.
    Aborted,
    /// Every candidate server refused or was unreachable.
    Exhausted,
    /// The resolver produced no servers to try.
    NoCandidates,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub blob_requests: Family<RequestLabels, Counter>,
    pub upstream_fetches: Family<FetchLabels, Counter>,
    pub uploads_total: Counter,
    pub deletes_total: Counter,
    pub inflight_fetches: Gauge,
    pub cache_size_bytes: Gauge,
    pub cache_blobs_total: Gauge,
}

impl Metrics {
    /// Register every metric with the supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let blob_requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "blobcache_requests_total",
            "Blob requests by method and cache status",
            blob_requests.clone(),
        );

        let upstream_fetches = Family::<FetchLabels, Counter>::default();
        registry.register(
            "blobcache_upstream_fetches_total",
            "Completed upstream fetches by outcome",
            upstream_fetches.clone(),
        );

        let uploads_total = Counter::default();
        registry.register(
            "blobcache_uploads_total",
            "Accepted uploads",
            uploads_total.clone(),
        );

        let deletes_total = Counter::default();
        registry.register(
            "blobcache_deletes_total",
            "Deleted blobs",
            deletes_total.clone(),
        );

        let inflight_fetches: Gauge = Gauge::default();
        registry.register(
            "blobcache_inflight_fetches",
            "Upstream fetches currently in flight",
            inflight_fetches.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "blobcache_cache_size_bytes",
            "Recorded cache size in bytes",
            cache_size_bytes.clone(),
        );

        let cache_blobs_total: Gauge = Gauge::default();
        registry.register(
            "blobcache_cache_blobs_total",
            "Number of blobs in the cache",
            cache_blobs_total.clone(),
        );

        Self {
            blob_requests,
            upstream_fetches,
            uploads_total,
            deletes_total,
            inflight_fetches,
            cache_size_bytes,
            cache_blobs_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Record a finished blob request.
    pub fn blob_request(&self, method: RequestMethod, cache_status: CacheStatus) {
        self.metrics
            .blob_requests
            .get_or_create(&RequestLabels {
                method,
                cache_status,
            })
            .inc();
    }

    /// Record a finished upstream fetch and drop the in-flight gauge.
    pub fn fetch_finished(&self, outcome: FetchOutcome) {
        self.metrics
            .upstream_fetches
            .get_or_create(&FetchLabels { outcome })
            .inc();
        self.metrics.inflight_fetches.dec();
    }

    /// Account a newly started upstream fetch.
    pub fn fetch_started(&self) {
        self.metrics.inflight_fetches.inc();
    }

    /// Refresh the cache gauges from store accounting.
    pub fn set_cache_stats(&self, blobs: u64, bytes: u64) {
        self.metrics.cache_blobs_total.set(blobs as i64);
        self.metrics.cache_size_bytes.set(bytes as i64);
    }
}
