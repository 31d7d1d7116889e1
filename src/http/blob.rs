//! Blob retrieval: the GET/HEAD contract over cache hits and the
//! deduplicated miss path.
//!
//! Responses are immutable by construction — the digest is the identity —
//! so every success carries `ETag: "<digest>"` and
//! `Cache-Control: public, max-age=31536000, immutable`, and conditional
//! requests answer 304 without touching the cache.

use std::io::SeekFrom;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, StatusCode},
    response::Response,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::cache::store::CachedBlob;
use crate::dedup::UpstreamMeta;
use crate::http::handler::AppError;
use crate::http::range::{parse_range, slice_stream, ByteRange};
use crate::metrics::{CacheStatus, RequestMethod};
use crate::AppState;

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// One parsed blob request: identity plus fetch hints.
#[derive(Debug, Clone)]
pub struct BlobRequest {
    /// 64 lowercase hex characters.
    pub digest: String,
    /// Extension including its leading dot, e.g. `.png`. Affects only the
    /// default Content-Type, never identity.
    pub ext: Option<String>,
    /// `as` query values: author pubkeys for the server directory lookup.
    pub authors: Vec<String>,
    /// `sx` query values: caller-supplied candidate servers.
    pub hints: Vec<String>,
}

/// Split `<64hex>[.ext]` into digest and extension. The digest is
/// normalized to lowercase; anything after it must start with a dot.
pub fn parse_blob_path(path: &str) -> Option<(String, Option<String>)> {
    if path.len() < 64 || !path.is_char_boundary(64) {
        return None;
    }

    let (digest, rest) = path.split_at(64);
    if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let ext = match rest {
        "" => None,
        e if e.starts_with('.') && e.len() > 1 => Some(e.to_string()),
        _ => return None,
    };

    Some((digest.to_ascii_lowercase(), ext))
}

/// Collect the repeatable `as` / `sx` query parameters.
fn parse_query(query: Option<&str>) -> (Vec<String>, Vec<String>) {
    let mut authors = Vec::new();
    let mut hints = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "as" => authors.push(value.into_owned()),
            "sx" => hints.push(value.into_owned()),
            _ => {}
        }
    }

    (authors, hints)
}

/// Default Content-Type for an extension, used when the upstream did not
/// provide one. Unknown extensions fall back to an opaque octet stream.
pub fn content_type_for_ext(ext: Option<&str>) -> &'static str {
    match ext.map(str::to_ascii_lowercase).as_deref() {
        Some(".txt") => "text/plain",
        Some(".html") | Some(".htm") => "text/html",
        Some(".css") => "text/css",
        Some(".js") => "text/javascript",
        Some(".json") => "application/json",
        Some(".xml") => "application/xml",
        Some(".pdf") => "application/pdf",
        Some(".png") => "image/png",
        Some(".jpg") | Some(".jpeg") => "image/jpeg",
        Some(".gif") => "image/gif",
        Some(".webp") => "image/webp",
        Some(".svg") => "image/svg+xml",
        Some(".mp4") => "video/mp4",
        Some(".webm") => "video/webm",
        Some(".mov") => "video/quicktime",
        Some(".mp3") => "audio/mpeg",
        Some(".ogg") => "audio/ogg",
        Some(".wav") => "audio/wav",
        Some(".zip") => "application/zip",
        Some(".wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Whether an `If-None-Match` header matches the blob's ETag, accepting
/// quoted, weak-prefixed, and wildcard forms.
fn if_none_match_matches(headers: &HeaderMap, digest: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    let quoted = format!("\"{digest}\"");
    value.split(',').map(str::trim).any(|candidate| {
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate == "*" || candidate.eq_ignore_ascii_case(&quoted)
    })
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `GET`/`HEAD /{sha256}[.ext]?as=…&sx=…`
#[instrument(skip(state, headers, query), fields(method = %method, path = %path))]
pub async fn handle_blob(
    state: &Arc<AppState>,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let (digest, ext) = parse_blob_path(path)
        .ok_or_else(|| AppError::BadRequest("Invalid hash in path".to_string()))?;
    let (authors, hints) = parse_query(query);
    let request = BlobRequest {
        digest,
        ext,
        authors,
        hints,
    };

    let method_label = if method == Method::HEAD {
        RequestMethod::Head
    } else {
        RequestMethod::Get
    };

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // 1. Conditional request. Ranges opt out so a partial follow-up after a
    //    full 200 still gets bytes.
    if range_header.is_none() && if_none_match_matches(headers, &request.digest) {
        debug!(digest = %request.digest, "ETag match, returning 304");
        state
            .metrics
            .blob_request(method_label, CacheStatus::Conditional);
        return Ok(not_modified_response(&request.digest));
    }

    // 2. The cache directory may have been removed behind us.
    state.store.ensure_dir().await?;

    // 3. Cache probe.
    if let Some(blob) = state.store.lookup(&request.digest).await {
        state.metrics.blob_request(method_label, CacheStatus::Hit);
        return serve_cached(&request, method, range_header.as_deref(), blob).await;
    }

    // 4. Miss: join or start the single upstream fetch for this digest.
    state.metrics.blob_request(method_label, CacheStatus::Miss);
    let producer_state = Arc::clone(state);
    let producer_request = request.clone();
    let handle = state.inflight.get_or_create(&request.digest, move |driver| {
        crate::fetch::produce_blob(producer_state, producer_request, driver)
    });

    // 5. No candidate produced the blob.
    let Some(meta) = handle.upstream_meta().await else {
        return Err(AppError::NotFound("Blob not found".to_string()));
    };

    // 6. Purge the cache entry if the transfer turns out poisoned. Bytes
    //    already relayed cannot be recalled; the disk can be protected.
    {
        let store = state.store.clone();
        let metrics = state.metrics.clone();
        let handle = Arc::clone(&handle);
        let digest = request.digest.clone();
        tokio::spawn(async move {
            handle.cache_written().await;
            if handle.hash_valid().await {
                if let Ok((blobs, bytes)) = store.stats().await {
                    metrics.set_cache_stats(blobs, bytes);
                }
            } else {
                warn!(digest = %digest, "fetch did not validate, purging any cache entry");
                store.delete(&digest).await;
            }
        });
    }

    serve_inflight(&request, method, range_header.as_deref(), &handle, meta)
}

// ---------------------------------------------------------------------------
// Cache-hit serving
// ---------------------------------------------------------------------------

async fn serve_cached(
    request: &BlobRequest,
    method: &Method,
    range_header: Option<&str>,
    blob: CachedBlob,
) -> Result<Response, AppError> {
    let content_type = content_type_for_ext(request.ext.as_deref());

    if method == Method::HEAD {
        return Ok(blob_response_builder(&request.digest, content_type)
            .header(header::CONTENT_LENGTH, blob.size)
            .body(Body::empty())
            .map_err(anyhow::Error::from)?);
    }

    if let Some(raw_range) = range_header {
        let range = parse_range(raw_range, blob.size).ok_or(AppError::RangeNotSatisfiable)?;
        return serve_file_range(request, blob, range, content_type).await;
    }

    let size = blob.size;
    let body = Body::from_stream(ReaderStream::new(blob.file));
    Ok(blob_response_builder(&request.digest, content_type)
        .header(header::CONTENT_LENGTH, size)
        .body(body)
        .map_err(anyhow::Error::from)?)
}

/// 206 from an open cache file: seek to the window and bound the reader.
async fn serve_file_range(
    request: &BlobRequest,
    mut blob: CachedBlob,
    range: ByteRange,
    content_type: &str,
) -> Result<Response, AppError> {
    blob.file
        .seek(SeekFrom::Start(range.start))
        .await
        .map_err(anyhow::Error::from)?;
    let limited = blob.file.take(range.len());

    Ok(blob_response_builder(&request.digest, content_type)
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_RANGE, range.content_range(blob.size))
        .header(header::CONTENT_LENGTH, range.len())
        .body(Body::from_stream(ReaderStream::new(limited)))
        .map_err(anyhow::Error::from)?)
}

// ---------------------------------------------------------------------------
// Miss-path serving
// ---------------------------------------------------------------------------

fn serve_inflight(
    request: &BlobRequest,
    method: &Method,
    range_header: Option<&str>,
    handle: &crate::dedup::FetchHandle,
    meta: UpstreamMeta,
) -> Result<Response, AppError> {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| content_type_for_ext(request.ext.as_deref()).to_string());

    // HEAD never takes a body; the producer still drains upstream so the
    // cache fills.
    if method == Method::HEAD {
        let mut builder = blob_response_builder(&request.digest, &content_type);
        if let Some(total) = meta.content_length {
            builder = builder.header(header::CONTENT_LENGTH, total);
        }
        return Ok(builder.body(Body::empty()).map_err(anyhow::Error::from)?);
    }

    if let Some(raw_range) = range_header {
        // Range against an unknown total degrades to a full 200.
        if let Some(total) = meta.content_length {
            let range = parse_range(raw_range, total).ok_or(AppError::RangeNotSatisfiable)?;
            let sliced = slice_stream(Box::pin(handle.subscribe()), range);
            return Ok(blob_response_builder(&request.digest, &content_type)
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, range.content_range(total))
                .header(header::CONTENT_LENGTH, range.len())
                .body(Body::from_stream(sliced))
                .map_err(anyhow::Error::from)?);
        }
        debug!(digest = %request.digest, "range requested but upstream length unknown, serving full body");
    }

    let mut builder = blob_response_builder(&request.digest, &content_type);
    if let Some(total) = meta.content_length {
        builder = builder.header(header::CONTENT_LENGTH, total);
    }
    Ok(builder
        .body(Body::from_stream(handle.subscribe()))
        .map_err(anyhow::Error::from)?)
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

fn etag_for(digest: &str) -> String {
    format!("\"{digest}\"")
}

/// Common success headers for every blob response.
fn blob_response_builder(digest: &str, content_type: &str) -> axum::http::response::Builder {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag_for(digest))
        .header(header::CACHE_CONTROL, IMMUTABLE_CACHE_CONTROL)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
}

fn not_modified_response(digest: &str) -> Response {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(header::ETAG, etag_for(digest))
        .header(header::CACHE_CONTROL, IMMUTABLE_CACHE_CONTROL)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::empty())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
