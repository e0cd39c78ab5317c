use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::debug;

use crate::dns::CachingResolver;

/// 10.0.0.0/8, 127.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16.
pub fn is_private_ipv4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 10
        || octets[0] == 127
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

pub fn is_private_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(is_private_ipv4)
            .unwrap_or_else(|| v6.is_loopback()),
    }
}

/// Resolve a hostname and decide whether crawling it should be skipped.
/// A failed resolution does not blacklist: the fetch itself will surface the
/// transport error per link.
pub async fn host_is_private(resolver: &CachingResolver, host: &str) -> bool {
    match resolver.lookup(host).await {
        Ok(addrs) => addrs.iter().any(is_private_addr),
        Err(e) => {
            debug!(host, error = %e, "blacklist dns probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges() {
        for addr in ["10.0.0.1", "127.0.0.1", "172.16.0.1", "172.31.255.1", "192.168.1.1"] {
            assert!(is_private_ipv4(addr.parse().unwrap()), "{addr}");
        }
        for addr in ["8.8.8.8", "172.15.0.1", "172.32.0.1", "192.169.0.1", "11.0.0.1"] {
            assert!(!is_private_ipv4(addr.parse().unwrap()), "{addr}");
        }
    }

    #[test]
    fn mapped_v6_goes_through_v4_check() {
        let mapped: SocketAddr = "[::ffff:10.1.2.3]:80".parse().unwrap();
        assert!(is_private_addr(&mapped));
        let loopback: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(is_private_addr(&loopback));
        let public: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        assert!(!is_private_addr(&public));
    }

    #[tokio::test]
    async fn localhost_is_private() {
        let resolver = CachingResolver::new(4);
        assert!(host_is_private(&resolver, "localhost").await);
    }
}
