//! Source-address gating for the mutating endpoints.
//!
//! Upload and delete are restricted to peers inside the configured set of
//! IPs / CIDR ranges (`ALLOWED_UPLOAD_IPS`, default localhost only). The
//! read path is public and never consults this module.

use std::net::IpAddr;

use ipnet::IpNet;

/// Compiled allow-list for upload/delete peers.
#[derive(Debug, Clone)]
pub struct UploadAcl {
    nets: Vec<IpNet>,
}

impl UploadAcl {
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    /// Check whether `peer` may use the mutating endpoints.
    ///
    /// IPv4-mapped IPv6 addresses (e.g. `::ffff:127.0.0.1` from a dual-stack
    /// listener) are unmapped before matching so IPv4 rules apply to them.
    pub fn allows(&self, peer: IpAddr) -> bool {
        let candidates = match peer {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => vec![peer, IpAddr::V4(v4)],
                None => vec![peer],
            },
            IpAddr::V4(_) => vec![peer],
        };

        self.nets
            .iter()
            .any(|net| candidates.iter().any(|ip| net.contains(ip)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(entries: &[&str]) -> UploadAcl {
        UploadAcl::new(entries.iter().map(|e| e.parse().unwrap()).collect())
    }

    #[test]
    fn allows_exact_ip() {
        let acl = acl(&["127.0.0.1/32"]);
        assert!(acl.allows("127.0.0.1".parse().unwrap()));
        assert!(!acl.allows("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn allows_cidr_range() {
        let acl = acl(&["10.0.0.0/8"]);
        assert!(acl.allows("10.255.1.2".parse().unwrap()));
        assert!(!acl.allows("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn allows_ipv6_loopback() {
        let acl = acl(&["::1/128"]);
        assert!(acl.allows("::1".parse().unwrap()));
        assert!(!acl.allows("::2".parse().unwrap()));
    }

    #[test]
    fn unmaps_v4_mapped_peers() {
        let acl = acl(&["127.0.0.1/32"]);
        assert!(acl.allows("::ffff:127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_acl_denies_everything() {
        let acl = UploadAcl::new(Vec::new());
        assert!(!acl.allows("127.0.0.1".parse().unwrap()));
    }
}
