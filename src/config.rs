use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnet::IpNet;
use tracing::warn;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration, sourced from environment variables with CLI
/// overrides for local development.
#[derive(Parser, Debug, Clone)]
#[command(name = "blobcache", about = "Content-addressed blob caching proxy")]
pub struct Config {
    /// Port for the HTTP listener.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Directory holding cached blob files and the metadata database.
    #[arg(long, env = "CACHE_DIR", default_value = "cache")]
    pub cache_dir: PathBuf,

    /// Ceiling for total cache size in bytes. Accepts a B/KB/MB/GB/TB
    /// suffix (decimal multiples). Unset means no limit.
    #[arg(long, env = "MAX_CACHE_SIZE", value_parser = parse_size)]
    pub max_cache_size: Option<u64>,

    /// Per-request deadline for upstream fetches, in milliseconds.
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Maximum number of redirects followed per upstream fetch.
    #[arg(long, env = "MAX_REDIRECTS", default_value_t = 5)]
    pub max_redirects: usize,

    /// Overall deadline for author-server directory lookups, in milliseconds.
    #[arg(long, env = "USER_SERVER_LIST_TIMEOUT", default_value_t = 20_000)]
    pub user_server_list_timeout_ms: u64,

    /// Comma-separated relay URLs for author-server lookups. Author pubkeys
    /// in requests are ignored when this is empty.
    #[arg(long, env = "LOOKUP_RELAYS")]
    pub lookup_relays: Option<String>,

    /// Comma-separated upstream URLs tried after request hints and author
    /// servers. Entries that do not parse as URLs are skipped.
    #[arg(long, env = "FALLBACK_SERVERS")]
    pub fallback_servers: Option<String>,

    /// Comma-separated IPs or CIDR ranges allowed to upload and delete.
    /// Defaults to localhost only.
    #[arg(long, env = "ALLOWED_UPLOAD_IPS")]
    pub allowed_upload_ips: Option<String>,
}

impl Config {
    /// Upstream fetch deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Author-lookup deadline as a [`Duration`].
    pub fn user_server_list_timeout(&self) -> Duration {
        Duration::from_millis(self.user_server_list_timeout_ms)
    }

    /// Relay URLs for author-server lookups.
    pub fn lookup_relays(&self) -> Vec<String> {
        split_list(self.lookup_relays.as_deref())
    }

    /// Configured fallback servers, with unparseable entries skipped.
    pub fn fallback_servers(&self) -> Vec<String> {
        split_list(self.fallback_servers.as_deref())
            .into_iter()
            .filter(|s| match url::Url::parse(s) {
                Ok(_) => true,
                Err(e) => {
                    warn!(server = %s, error = %e, "skipping unparseable fallback server");
                    false
                }
            })
            .collect()
    }

    /// Networks allowed to use the upload and delete endpoints.
    ///
    /// Bare IPs become host-length prefixes; unparseable entries are skipped
    /// with a warning. An unset variable yields the loopback addresses.
    pub fn allowed_upload_nets(&self) -> Vec<IpNet> {
        let entries = match self.allowed_upload_ips.as_deref() {
            Some(raw) => split_list(Some(raw)),
            None => vec!["127.0.0.1".to_string(), "::1".to_string()],
        };

        entries
            .iter()
            .filter_map(|entry| {
                if let Ok(net) = entry.parse::<IpNet>() {
                    return Some(net);
                }
                if let Ok(ip) = entry.parse::<IpAddr>() {
                    return Some(IpNet::from(ip));
                }
                warn!(entry = %entry, "skipping unparseable allowed upload IP");
                None
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Split a comma-separated list, trimming entries and dropping empties.
fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a byte size with an optional B/KB/MB/GB/TB suffix.
///
/// Multiples are decimal: `1KB` is 1000 bytes.
fn parse_size(raw: &str) -> Result<u64, String> {
    let upper = raw.trim().to_ascii_uppercase();

    let (number, multiplier) = if let Some(n) = upper.strip_suffix("TB") {
        (n, 1_000_000_000_000_u64)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1_000_000_000)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1_000_000)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1_000)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {raw}"))?;

    if value < 0.0 {
        return Err(format!("size must not be negative: {raw}"));
    }

    Ok((value * multiplier as f64) as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
