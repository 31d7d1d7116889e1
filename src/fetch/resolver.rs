//! Candidate server assembly for a blob request.
//!
//! Order matters: per-request `sx` hints first, then servers advertised for
//! each `as` author pubkey (only when lookup relays are configured), then
//! the configured fallbacks. Duplicates collapse onto the first occurrence,
//! compared by normalized origin so `cdn.example.com` and
//! `https://cdn.example.com/` count as one server.

use tracing::debug;
use url::Url;

use crate::http::blob::BlobRequest;
use crate::AppState;

use super::authors;

/// Assemble the ordered, deduplicated candidate list for a request. An
/// empty result means the blob cannot be fetched and the request 404s.
pub async fn resolve_candidates(state: &AppState, request: &BlobRequest) -> Vec<String> {
    let mut candidates: Vec<String> = request.hints.clone();

    let relays = state.config.lookup_relays();
    if !relays.is_empty() && !request.authors.is_empty() {
        for pubkey in &request.authors {
            let servers = authors::resolve_author_servers(
                &state.http_client,
                &relays,
                pubkey,
                state.config.user_server_list_timeout(),
            )
            .await;
            candidates.extend(servers);
        }
    }

    candidates.extend(state.config.fallback_servers());

    let deduped = dedupe_by_origin(candidates);
    debug!(
        digest = %request.digest,
        candidates = deduped.len(),
        "resolved candidate servers"
    );
    deduped
}

/// Collapse servers that share a normalized origin, keeping first-seen order.
fn dedupe_by_origin(servers: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(servers.len());

    for server in servers {
        let trimmed = server.trim().trim_end_matches('/').to_string();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(origin_key(&trimmed)) {
            out.push(trimmed);
        }
    }

    out
}

/// Normalized origin used as the dedup key. Schemeless entries are keyed as
/// https, matching how the fetcher will first try them; anything unparseable
/// keys as itself.
fn origin_key(server: &str) -> String {
    let with_scheme = if server.contains("://") {
        server.to_string()
    } else {
        format!("https://{server}")
    };

    match Url::parse(&with_scheme) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            }
        }
        Err(_) => server.to_ascii_lowercase(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
