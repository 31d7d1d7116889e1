//! Static statistics page served at `/`.

use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::http::handler::AppError;
use crate::AppState;

/// `GET /` — blob count and total cached bytes as a small HTML page.
pub async fn handle_stats(state: &AppState) -> Result<Response, AppError> {
    let (blobs, bytes) = state.store.stats().await.unwrap_or((0, 0));
    state.metrics.set_cache_stats(blobs, bytes);

    let page = render_stats_page(blobs, bytes);
    Ok(([(header::CONTENT_TYPE, "text/html; charset=utf-8")], page).into_response())
}

fn render_stats_page(blobs: u64, bytes: u64) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>blobcache</title></head>\n\
         <body>\n\
         <h1>blobcache</h1>\n\
         <p>Content-addressed blob caching proxy.</p>\n\
         <ul>\n\
         <li>Cached blobs: {blobs}</li>\n\
         <li>Cached bytes: {bytes}</li>\n\
         </ul>\n\
         </body>\n\
         </html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_page_includes_counts() {
        let page = render_stats_page(42, 123_456);
        assert!(page.contains("Cached blobs: 42"));
        assert!(page.contains("Cached bytes: 123456"));
    }
}
