//! Server test utilities.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, StatusCode};
use blobcache::config::Config;
use blobcache::{build_state, AppState};
use clap::Parser;
use tempfile::TempDir;
use tower::ServiceExt;

/// Everything a test needs to drive the proxy: the router, the state
/// behind it, and the scratch cache directory that outlives both.
// Every integration binary compiles its own copy of this module, so
// helpers that only some binaries call are allowed to look unused.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server backed by a temporary cache directory.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with config modifications applied before the
    /// state is built.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        let mut config = Config::try_parse_from(["blobcache"]).expect("failed to build config");
        config.cache_dir = temp_dir.path().join("cache");
        modifier(&mut config);

        let state = build_state(Arc::new(config))
            .await
            .expect("failed to build app state");
        let router = blobcache::http::handler::create_router(Arc::clone(&state));

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Send one request through the router from the loopback address.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.request_from(request, SocketAddr::from(([127, 0, 0, 1], 54_321)))
            .await
    }

    /// Send one request through the router from a specific peer address.
    pub async fn request_from(
        &self,
        mut request: Request<Body>,
        peer: SocketAddr,
    ) -> Response<Body> {
        request.extensions_mut().insert(ConnectInfo(peer));
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router call failed")
    }

    /// Place verified content directly into the cache, file and metadata.
    pub async fn seed_blob(&self, digest: &str, content: &[u8]) {
        tokio::fs::write(self.state.store.blob_path(digest), content)
            .await
            .expect("failed to write seed blob");
        self.state
            .store
            .write_and_record(digest, content.len() as u64, 1_700_000_000)
            .await;
    }
}

/// Read a response body to completion.
#[allow(dead_code)]
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body")
        .to_vec()
}

/// Fetch a header value as a string, panicking when absent.
#[allow(dead_code)]
pub fn header_str<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .expect("non-UTF8 header value")
}

/// Assert an error response's status and `X-Reason`.
#[allow(dead_code)]
pub fn assert_error(response: &Response<Body>, status: StatusCode, reason: &str) {
    assert_eq!(response.status(), status);
    assert_eq!(header_str(response, "X-Reason"), reason);
}
