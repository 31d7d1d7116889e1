//! Integration tests for the HTTP blob surface: retrieval, conditional and
//! range requests, upload, delete, and the method/preflight contract.

mod common;

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{assert_error, body_bytes, header_str, TestServer};
use sha2::{Digest, Sha256};

/// Digest used by the seeded-blob scenarios: 64 'a' characters.
const D_AAAA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// ── cache hits ──────────────────────────────────────────────────────────

#[tokio::test]
async fn cache_hit_serves_full_blob_with_headers() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let response = server.request(get(&format!("/{D_AAAA}.txt"))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-type"), "text/plain");
    assert_eq!(header_str(&response, "content-length"), "6");
    assert_eq!(header_str(&response, "etag"), format!("\"{D_AAAA}\""));
    assert_eq!(header_str(&response, "accept-ranges"), "bytes");
    assert_eq!(
        header_str(&response, "cache-control"),
        "public, max-age=31536000, immutable"
    );
    assert_eq!(header_str(&response, "access-control-allow-origin"), "*");
    assert_eq!(body_bytes(response).await, b"hello\n");
}

#[tokio::test]
async fn cache_hit_without_extension_is_octet_stream() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let response = server.request(get(&format!("/{D_AAAA}"))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "content-type"),
        "application/octet-stream"
    );
}

#[tokio::test]
async fn head_returns_headers_without_body() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let request = Request::builder()
        .method("HEAD")
        .uri(format!("/{D_AAAA}.txt"))
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-length"), "6");
    assert!(body_bytes(response).await.is_empty());
}

// ── conditional requests ────────────────────────────────────────────────

#[tokio::test]
async fn if_none_match_returns_304() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/{D_AAAA}.txt"))
        .header("If-None-Match", format!("\"{D_AAAA}\""))
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header_str(&response, "etag"), format!("\"{D_AAAA}\""));
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn if_none_match_with_range_still_serves_bytes() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/{D_AAAA}.txt"))
        .header("If-None-Match", format!("\"{D_AAAA}\""))
        .header("Range", "bytes=0-2")
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await, b"hel");
}

// ── range requests ──────────────────────────────────────────────────────

#[tokio::test]
async fn range_request_returns_slice() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/{D_AAAA}.txt"))
        .header("Range", "bytes=1-3")
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, "content-range"), "bytes 1-3/6");
    assert_eq!(header_str(&response, "content-length"), "3");
    assert_eq!(body_bytes(response).await, b"ell");
}

#[tokio::test]
async fn unsatisfiable_range_returns_416() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/{D_AAAA}.txt"))
        .header("Range", "bytes=10-20")
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;

    assert_error(
        &response,
        StatusCode::RANGE_NOT_SATISFIABLE,
        "Range not satisfiable",
    );
}

// ── misses and bad requests ─────────────────────────────────────────────

#[tokio::test]
async fn miss_with_no_candidates_returns_404() {
    let server = TestServer::new().await;

    let response = server.request(get(&format!("/{D_AAAA}"))).await;

    assert_error(&response, StatusCode::NOT_FOUND, "Blob not found");
}

#[tokio::test]
async fn non_digest_path_returns_400() {
    let server = TestServer::new().await;

    let response = server.request(get("/favicon.ico")).await;

    assert_error(&response, StatusCode::BAD_REQUEST, "Invalid hash in path");
}

#[tokio::test]
async fn unsupported_method_returns_405() {
    let server = TestServer::new().await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/{D_AAAA}"))
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;

    assert_error(
        &response,
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed",
    );
}

// ── CORS preflight ──────────────────────────────────────────────────────

#[tokio::test]
async fn options_preflight_advertises_surface() {
    let server = TestServer::new().await;

    let request = Request::builder()
        .method("OPTIONS")
        .uri(format!("/{D_AAAA}"))
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        header_str(&response, "access-control-allow-methods"),
        "GET, HEAD, PUT, DELETE"
    );
    assert_eq!(header_str(&response, "access-control-max-age"), "86400");
}

// ── upload and delete ───────────────────────────────────────────────────

#[tokio::test]
async fn upload_stores_blob_under_its_digest() {
    let server = TestServer::new().await;
    let content = b"uploaded content";
    let digest = hex::encode(Sha256::digest(content));

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .header("Content-Type", "text/plain")
        .body(Body::from(content.as_slice()))
        .unwrap();
    let response = server.request(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    let descriptor: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(descriptor["sha256"], digest.as_str());
    assert_eq!(descriptor["size"], content.len());
    assert_eq!(descriptor["type"], "text/plain");

    // The blob is immediately retrievable.
    let response = server.request(get(&format!("/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, content);
}

#[tokio::test]
async fn upload_with_mismatched_expected_digest_returns_400() {
    let server = TestServer::new().await;

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .header("X-SHA-256", D_AAAA)
        .body(Body::from("whatever"))
        .unwrap();
    let response = server.request(request).await;

    assert_error(&response, StatusCode::BAD_REQUEST, "Digest mismatch");
}

#[tokio::test]
async fn upload_from_non_allowed_ip_returns_403() {
    let server = TestServer::with_config(|config| {
        config.allowed_upload_ips = Some("10.1.2.3".to_string());
    })
    .await;

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .body(Body::from("data"))
        .unwrap();
    let response = server
        .request_from(request, SocketAddr::from(([127, 0, 0, 1], 40_000)))
        .await;

    assert_error(&response, StatusCode::FORBIDDEN, "IP not allowed");
}

#[tokio::test]
async fn delete_removes_blob_then_404s() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/{D_AAAA}"))
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/{D_AAAA}"))
        .body(Body::empty())
        .unwrap();
    let response = server.request(request).await;
    assert_error(&response, StatusCode::NOT_FOUND, "Blob not found");

    // And the blob no longer serves.
    let response = server.request(get(&format!("/{D_AAAA}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_from_non_allowed_ip_returns_403() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/{D_AAAA}"))
        .body(Body::empty())
        .unwrap();
    let response = server
        .request_from(request, SocketAddr::from(([203, 0, 113, 9], 40_000)))
        .await;

    assert_error(&response, StatusCode::FORBIDDEN, "IP not allowed");
}

// ── service pages ───────────────────────────────────────────────────────

#[tokio::test]
async fn stats_page_reports_cache_contents() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;

    let response = server.request(get("/")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let page = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(page.contains("Cached blobs: 1"));
    assert!(page.contains("Cached bytes: 6"));
}

#[tokio::test]
async fn healthz_reports_ok() {
    let server = TestServer::new().await;

    let response = server.request(get("/healthz")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters() {
    let server = TestServer::new().await;
    server.seed_blob(D_AAAA, b"hello\n").await;
    let _ = server.request(get(&format!("/{D_AAAA}"))).await;

    let response = server.request(get("/metrics")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("blobcache_requests"));
}
