//! Axum router and HTTP boundary for the blob proxy.
//!
//! Routes:
//! - `OPTIONS *`                - CORS preflight (204)
//! - `GET  /`                   - HTML statistics page
//! - `GET/HEAD /{sha256}[.ext]` - blob retrieval (cache or upstream)
//! - `PUT  /upload`             - IP-gated upload
//! - `DELETE /{sha256}`         - IP-gated delete
//! - `GET  /healthz`            - health check
//! - `GET  /metrics`            - Prometheus metrics
//!
//! Anything else answers 405. Every error response carries its reason as
//! the body and in an `X-Reason` header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::http::{blob, stats, upload};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(handle_root))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/upload", any(handle_upload_route))
        .route("/{path}", any(handle_blob_route))
        .fallback(handle_fallback)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Method dispatch
// ---------------------------------------------------------------------------

/// `GET /` — statistics page. Other methods: preflight or 405.
async fn handle_root(
    State(state): State<Arc<AppState>>,
    method: Method,
) -> Result<Response, AppError> {
    match method {
        Method::GET => stats::handle_stats(&state).await,
        Method::OPTIONS => Ok(preflight_response()),
        _ => Err(AppError::MethodNotAllowed),
    }
}

/// `PUT /upload` — streaming upload. Other methods: preflight or 405.
async fn handle_upload_route(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    match method {
        Method::PUT => upload::handle_upload(&state, peer, &headers, body).await,
        Method::OPTIONS => Ok(preflight_response()),
        _ => Err(AppError::MethodNotAllowed),
    }
}

/// `/{sha256}[.ext]` — retrieval and delete.
async fn handle_blob_route(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    match method {
        Method::GET | Method::HEAD => {
            blob::handle_blob(&state, &method, &path, query.as_deref(), &headers).await
        }
        Method::DELETE => upload::handle_delete(&state, peer, &path).await,
        Method::OPTIONS => Ok(preflight_response()),
        _ => Err(AppError::MethodNotAllowed),
    }
}

/// Unmatched paths: preflight for OPTIONS, 405 otherwise.
async fn handle_fallback(method: Method) -> Result<Response, AppError> {
    match method {
        Method::OPTIONS => Ok(preflight_response()),
        _ => Err(AppError::MethodNotAllowed),
    }
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

/// `204` preflight response advertising the mutating surface.
pub fn preflight_response() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, HEAD, PUT, DELETE",
            ),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Authorization, *"),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: HealthStatus,
    checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
struct HealthChecks {
    cache_dir: bool,
    metadata_db: bool,
    cache_bytes: u64,
    max_cache_bytes: Option<u64>,
}

/// `GET /healthz`. Serving needs only the cache directory; a broken
/// metadata database degrades but does not fail the check.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache_dir = state.store.ensure_dir().await.is_ok();
    let metadata_db = state.store.ping().await.is_ok();
    let cache_bytes = state.store.size_total().await.unwrap_or(0);

    let status = if !cache_dir {
        HealthStatus::Unhealthy
    } else if !metadata_db {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        http_status,
        Json(HealthResponse {
            status,
            checks: HealthChecks {
                cache_dir,
                metadata_db,
                cache_bytes,
                max_cache_bytes: state.config.max_cache_size,
            },
        }),
    )
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// `GET /metrics` — Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    if let Ok((blobs, bytes)) = state.store.stats().await {
        state.metrics.set_cache_stats(blobs, bytes);
    }

    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error that maps onto the response taxonomy: the reason
/// string becomes both the body and the `X-Reason` header.
#[derive(Debug)]
pub enum AppError {
    /// Malformed path, digest, or upload (400).
    BadRequest(String),
    /// Peer not allowed to mutate (403).
    Forbidden(String),
    /// Blob absent locally and upstream (404).
    NotFound(String),
    /// Unsupported method (405).
    MethodNotAllowed,
    /// Range outside the blob (416).
    RangeNotSatisfiable,
    /// Anything unexpected (500); logged in full, surfaced sanitized.
    Internal(anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> String {
        match self {
            AppError::BadRequest(reason)
            | AppError::Forbidden(reason)
            | AppError::NotFound(reason) => reason.clone(),
            AppError::MethodNotAllowed => "Method not allowed".to_string(),
            AppError::RangeNotSatisfiable => "Range not satisfiable".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal(ref e) = self {
            error!(error = %e, "internal server error");
        }

        let reason = self.reason();
        let header_value = reason
            .parse()
            .unwrap_or_else(|_| header::HeaderValue::from_static("error"));

        let mut response = (self.status(), reason).into_response();
        response.headers_mut().insert("X-Reason", header_value);
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
