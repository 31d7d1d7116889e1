//! IP-gated upload and delete endpoints.
//!
//! Uploads stream to a dot-prefixed temp file inside the cache directory
//! while an incremental SHA-256 runs, then rename into place once the
//! digest is known — rebuild scans never see partial content, and the
//! stored name is always the verified digest.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use crate::cache::store::now_seconds;
use crate::http::blob::parse_blob_path;
use crate::http::handler::AppError;
use crate::AppState;

/// Distinguishes concurrent upload temp files within one process.
static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// JSON document returned for an accepted upload.
#[derive(Debug, Serialize)]
pub struct BlobDescriptor {
    pub url: String,
    pub sha256: String,
    pub size: u64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub uploaded: i64,
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// `PUT /upload`
#[instrument(skip(state, headers, body), fields(peer = %peer))]
pub async fn handle_upload(
    state: &Arc<AppState>,
    peer: SocketAddr,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    require_allowed(state, peer)?;
    state.store.ensure_dir().await?;

    let tmp_path = state.store.cache_dir().join(format!(
        ".upload-{}-{}",
        std::process::id(),
        UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let result = receive_to_file(&tmp_path, body).await;
    let (digest, size) = match result {
        Ok(ok) => ok,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AppError::Internal(e));
        }
    };

    // An expected-digest header turns the upload into a checked write.
    if let Some(expected) = headers.get("x-sha-256").and_then(|v| v.to_str().ok()) {
        if !expected.trim().eq_ignore_ascii_case(&digest) {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            warn!(expected = %expected, computed = %digest, "upload digest mismatch");
            return Err(AppError::BadRequest("Digest mismatch".to_string()));
        }
    }

    let final_path = state.store.blob_path(&digest);
    if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(AppError::Internal(
            anyhow::Error::from(e).context("failed to move upload into cache"),
        ));
    }

    // A re-upload of an existing blob keeps its original upload time.
    let uploaded = match state.store.get_uploaded(&digest).await {
        Some(ts) => ts,
        None => now_seconds(),
    };
    state.store.write_and_record(&digest, size, uploaded).await;
    state.metrics.metrics.uploads_total.inc();
    info!(digest = %digest, size, "blob uploaded");

    let descriptor = BlobDescriptor {
        url: format!("/{digest}"),
        sha256: digest,
        size,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        uploaded,
    };

    Ok((
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(descriptor),
    )
        .into_response())
}

/// Stream the request body into `path`, hashing as it goes. Returns the
/// lowercase hex digest and the byte count.
async fn receive_to_file(path: &Path, body: Body) -> anyhow::Result<(String, u64)> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("upload body failed: {e}"))?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok((hex::encode(hasher.finalize()), size))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// `DELETE /{sha256}`
#[instrument(skip(state), fields(peer = %peer, path = %path))]
pub async fn handle_delete(
    state: &Arc<AppState>,
    peer: SocketAddr,
    path: &str,
) -> Result<Response, AppError> {
    require_allowed(state, peer)?;

    let (digest, ext) = parse_blob_path(path)
        .ok_or_else(|| AppError::BadRequest("Invalid hash in path".to_string()))?;
    if ext.is_some() {
        return Err(AppError::BadRequest("Invalid hash in path".to_string()));
    }

    if state.store.delete(&digest).await {
        state.metrics.metrics.deletes_total.inc();
        info!(digest = %digest, "blob deleted");
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(AppError::NotFound("Blob not found".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

fn require_allowed(state: &AppState, peer: SocketAddr) -> Result<(), AppError> {
    if state.upload_acl.allows(peer.ip()) {
        Ok(())
    } else {
        warn!(peer = %peer, "rejected mutating request from non-allowed IP");
        Err(AppError::Forbidden("IP not allowed".to_string()))
    }
}
