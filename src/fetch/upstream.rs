//! Digest-addressed GET against one candidate server.
//!
//! Scheme promotion and fallback live here and only here: a bare hostname is
//! tried as `https://` first and retried as `http://` on a transport error.
//! Redirects are followed manually (the shared client has redirects
//! disabled) and a redirect target is accepted only while it still contains
//! the expected digest, so an upstream cannot swap in different content.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

/// Fetch `digest` from `server`, returning the winning response or `None`
/// when this candidate cannot produce the blob.
pub async fn fetch_blob(
    client: &reqwest::Client,
    server: &str,
    digest: &str,
    ext: Option<&str>,
    timeout: Duration,
    max_redirects: usize,
) -> Option<reqwest::Response> {
    for base in candidate_bases(server) {
        let url = blob_url(&base, digest, ext);
        match fetch_following_redirects(client, &url, digest, timeout, max_redirects).await {
            Ok(response) => return response,
            Err(e) => {
                // Transport error: fall through to the next scheme, if any.
                debug!(url = %url, error = %e, "transport error contacting upstream");
            }
        }
    }
    None
}

/// Base URLs to attempt for a candidate server. Explicit schemes are used
/// as-is; bare hostnames get https with an http fallback.
fn candidate_bases(server: &str) -> Vec<String> {
    let trimmed = server.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        vec![trimmed.to_string()]
    } else {
        vec![format!("https://{trimmed}"), format!("http://{trimmed}")]
    }
}

/// `{base}/{digest}{ext}` — the extension already carries its dot.
fn blob_url(base: &str, digest: &str, ext: Option<&str>) -> String {
    format!("{}/{}{}", base.trim_end_matches('/'), digest, ext.unwrap_or(""))
}

/// Whether a redirect may be followed: the target must still name the
/// expected digest somewhere in the URL.
fn redirect_allowed(location: &str, digest: &str) -> bool {
    location.to_ascii_lowercase().contains(&digest.to_ascii_lowercase())
}

/// Issue the GET, chasing up to `max_redirects` digest-preserving redirects.
///
/// `Ok(None)` is a definitive failure for this base (bad status, redirect
/// rejected); `Err` is a transport error the caller may retry on another
/// scheme.
async fn fetch_following_redirects(
    client: &reqwest::Client,
    url: &str,
    digest: &str,
    timeout: Duration,
    max_redirects: usize,
) -> Result<Option<reqwest::Response>, reqwest::Error> {
    let mut current = url.to_string();

    for hop in 0..=max_redirects {
        let response = client.get(&current).timeout(timeout).send().await?;
        let status = response.status();

        if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
            return Ok(Some(response));
        }

        if status.is_redirection() {
            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                debug!(url = %current, %status, "redirect without Location header");
                return Ok(None);
            };

            // Resolve relative redirects against the current URL.
            let target = match Url::parse(&current).and_then(|base| base.join(location)) {
                Ok(u) => u.to_string(),
                Err(e) => {
                    debug!(url = %current, location = %location, error = %e, "unparseable redirect");
                    return Ok(None);
                }
            };

            if !redirect_allowed(&target, digest) {
                warn!(
                    url = %current,
                    target = %target,
                    "redirect target does not reference the requested digest, refusing"
                );
                return Ok(None);
            }

            if hop == max_redirects {
                debug!(url = %url, "redirect limit exceeded");
                return Ok(None);
            }

            current = target;
            continue;
        }

        debug!(url = %current, %status, "upstream returned non-success status");
        return Ok(None);
    }

    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const D: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    // ── candidate bases ─────────────────────────────────────────────────

    #[test]
    fn bare_host_gets_https_then_http() {
        assert_eq!(
            candidate_bases("cdn.example.com"),
            vec![
                "https://cdn.example.com".to_string(),
                "http://cdn.example.com".to_string()
            ]
        );
    }

    #[test]
    fn explicit_scheme_used_as_is() {
        assert_eq!(
            candidate_bases("http://cdn.example.com/"),
            vec!["http://cdn.example.com".to_string()]
        );
    }

    // ── URL construction ────────────────────────────────────────────────

    #[test]
    fn blob_url_without_extension() {
        assert_eq!(
            blob_url("https://cdn.example.com", D, None),
            format!("https://cdn.example.com/{D}")
        );
    }

    #[test]
    fn blob_url_with_extension_and_trailing_slash() {
        assert_eq!(
            blob_url("https://cdn.example.com/", D, Some(".png")),
            format!("https://cdn.example.com/{D}.png")
        );
    }

    // ── redirect checks ─────────────────────────────────────────────────

    #[test]
    fn redirect_with_digest_allowed() {
        let target = format!("https://mirror.example.com/blobs/{D}?sig=abc");
        assert!(redirect_allowed(&target, D));
    }

    #[test]
    fn redirect_without_digest_refused() {
        assert!(!redirect_allowed("https://mirror.example.com/other", D));
    }

    #[test]
    fn redirect_digest_check_is_case_insensitive() {
        let target = format!("https://mirror.example.com/{}", D.to_uppercase());
        assert!(redirect_allowed(&target, D));
    }
}
