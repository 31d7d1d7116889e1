//! Content-addressed blob caching proxy.
//!
//! Clients request a blob by its SHA-256 digest. The proxy serves it from a
//! local disk cache or, on miss, fetches it from candidate upstream servers,
//! validating the digest while streaming, persisting verified bytes, and
//! fanning the same byte sequence out to every concurrent requester.

pub mod auth;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod fetch;
pub mod http;
pub mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::auth::UploadAcl;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::dedup::InflightMap;
use crate::metrics::MetricsRegistry;

const USER_AGENT: &str = "blobcache/0.1";

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: CacheStore,
    pub inflight: InflightMap,
    pub upload_acl: UploadAcl,
    pub metrics: MetricsRegistry,
    /// General-purpose client (author lookups); follows redirects normally.
    pub http_client: reqwest::Client,
    /// Upstream blob fetches; redirects are followed manually with the
    /// digest check, so this client never follows them itself.
    pub fetch_client: reqwest::Client,
}

/// Build the shared state: open the cache store (creating the directory and
/// metadata database) and construct the HTTP clients.
pub async fn build_state(config: Arc<Config>) -> Result<Arc<AppState>> {
    let store = CacheStore::open(&config.cache_dir, config.max_cache_size)
        .await
        .context("failed to open cache store")?;

    let http_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")?;

    let fetch_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build upstream fetch client")?;

    Ok(Arc::new(AppState {
        upload_acl: UploadAcl::new(config.allowed_upload_nets()),
        config,
        store,
        inflight: InflightMap::new(),
        metrics: MetricsRegistry::new(),
        http_client,
        fetch_client,
    }))
}
