//! Author-server directory lookup boundary.
//!
//! Given an author pubkey, ask each configured lookup relay which servers
//! host that author's blobs. Strictly best-effort: the whole lookup runs
//! under one bounded deadline and any failure simply contributes no servers.
//! The wire shape is `GET {relay}/{pubkey}` returning a JSON array of
//! server URL strings.

use std::time::Duration;

use tracing::debug;

/// Query every relay for `pubkey`'s servers, in relay order, under one
/// overall deadline.
pub async fn resolve_author_servers(
    client: &reqwest::Client,
    relays: &[String],
    pubkey: &str,
    timeout: Duration,
) -> Vec<String> {
    let lookup = async {
        let mut servers = Vec::new();
        for relay in relays {
            match query_relay(client, relay, pubkey).await {
                Ok(mut list) => servers.append(&mut list),
                Err(e) => {
                    debug!(relay = %relay, pubkey = %pubkey, error = %e, "author lookup failed");
                }
            }
        }
        servers
    };

    match tokio::time::timeout(timeout, lookup).await {
        Ok(servers) => servers,
        Err(_) => {
            debug!(pubkey = %pubkey, "author lookup timed out");
            Vec::new()
        }
    }
}

async fn query_relay(
    client: &reqwest::Client,
    relay: &str,
    pubkey: &str,
) -> anyhow::Result<Vec<String>> {
    let url = format!("{}/{}", relay.trim_end_matches('/'), pubkey);

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("relay returned {}", response.status());
    }

    let body: serde_json::Value = response.json().await?;
    Ok(extract_servers(&body))
}

/// Pull server URL strings out of the relay response, tolerating anything
/// that is not a plain string array.
fn extract_servers(body: &serde_json::Value) -> Vec<String> {
    body.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
