//! Connection-level access control.

use std::net::SocketAddr;

use cidr::IpCidr;
use ferropost_common::config;

/// Allowlist over remote peers. Closed by default: with both lists empty
/// every connection is denied before the greeting.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    networks: Vec<IpCidr>,
    hosts: Vec<String>,
}

impl AccessPolicy {
    /// `hosts` are compared case-insensitively against the textual form
    /// of the peer address; callers should pass them lower-cased.
    pub fn new(networks: Vec<IpCidr>, hosts: Vec<String>) -> Self {
        Self { networks, hosts }
    }

    /// Policy from `SMTP_ALLOW_NETWORKS` / `SMTP_ALLOW_HOSTS`.
    pub fn from_env() -> Self {
        Self::new(config::allowed_networks(), config::allowed_hosts())
    }

    pub fn allows(&self, peer: SocketAddr) -> bool {
        if self.networks.is_empty() && self.hosts.is_empty() {
            return false;
        }

        let host = peer.ip().to_string().to_lowercase();
        if self.hosts.iter().any(|allowed| *allowed == host) {
            return true;
        }
        self.networks.iter().any(|net| net.contains(&peer.ip()))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn empty_policy_denies_everything() {
        let policy = AccessPolicy::default();
        assert!(!policy.allows(peer("127.0.0.1:1000")));
        assert!(!policy.allows(peer("[::1]:1000")));
    }

    #[test]
    fn network_containment_allows() {
        let policy = AccessPolicy::new(vec![IpCidr::from_str("203.0.113.0/24").unwrap()], vec![]);
        assert!(policy.allows(peer("203.0.113.10:25")));
        assert!(!policy.allows(peer("203.0.114.10:25")));
    }

    #[test]
    fn host_match_is_textual_and_case_insensitive() {
        let policy = AccessPolicy::new(vec![], vec!["10.1.2.3".to_string()]);
        assert!(policy.allows(peer("10.1.2.3:5000")));
        assert!(!policy.allows(peer("10.1.2.4:5000")));
    }

    #[test]
    fn either_list_suffices() {
        let policy = AccessPolicy::new(
            vec![IpCidr::from_str("127.0.0.0/8").unwrap()],
            vec!["192.0.2.7".to_string()],
        );
        assert!(policy.allows(peer("127.5.5.5:1")));
        assert!(policy.allows(peer("192.0.2.7:1")));
        assert!(!policy.allows(peer("198.51.100.1:1")));
    }
}
