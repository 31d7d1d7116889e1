//! Upstream side of the miss path: candidate resolution, the digest-checked
//! HTTP fetcher, and the producer that drives one fetch through the
//! hash/cache tee for all subscribers.

pub mod authors;
pub mod resolver;
pub mod upstream;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::stream::run_tee;
use crate::dedup::{FetchDriver, UpstreamMeta};
use crate::http::blob::BlobRequest;
use crate::metrics::FetchOutcome;
use crate::AppState;

/// Produce the blob for one in-flight entry: resolve candidates, try them in
/// order, and stream the winner through the hash/cache tee.
///
/// This is the single-flight body run by the deduplicator; every subscriber
/// for the digest reads from the driver's fan-out buffer.
pub async fn produce_blob(state: Arc<AppState>, request: BlobRequest, driver: FetchDriver) {
    let digest = driver.digest.clone();
    state.metrics.fetch_started();
    let candidates = resolver::resolve_candidates(&state, &request).await;

    if candidates.is_empty() {
        debug!(digest = %digest, "no candidate servers for blob");
        state.metrics.fetch_finished(FetchOutcome::NoCandidates);
        driver.fail("Blob not found");
        return;
    }

    for server in &candidates {
        let response = upstream::fetch_blob(
            &state.fetch_client,
            server,
            &digest,
            request.ext.as_deref(),
            state.config.request_timeout(),
            state.config.max_redirects,
        )
        .await;

        let Some(response) = response else {
            debug!(digest = %digest, server = %server, "candidate failed, trying next");
            continue;
        };

        let meta = UpstreamMeta {
            content_type: response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            content_length: response.content_length(),
        };

        info!(
            digest = %digest,
            server = %server,
            content_length = ?meta.content_length,
            "fetching blob from upstream"
        );
        driver.start_streaming(meta);

        let outcome = run_tee(
            &state.store,
            &digest,
            response.bytes_stream(),
            &driver.buffer,
        )
        .await;

        state.metrics.fetch_finished(if outcome.hash_valid {
            FetchOutcome::Verified
        } else if outcome.aborted {
            FetchOutcome::Aborted
        } else {
            FetchOutcome::Poisoned
        });
        driver.settle(outcome.hash_valid);
        return;
    }

    warn!(digest = %digest, tried = candidates.len(), "all candidate servers failed");
    state.metrics.fetch_finished(FetchOutcome::Exhausted);
    driver.fail("Blob not found");
}
