//! Target address resolution.
//!
//! Targets are configured as `ip:port` or `host:port`. The kernel route
//! slots hold IPv4 addresses, so hostnames are resolved up front and cached;
//! resolution status feeds the `dns_up` gauge and a target that stops
//! resolving keeps its last known address until a lookup succeeds again.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const DNS_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    fn validate_domain(domain: &str) -> bool {
        !domain.is_empty()
            && domain.len() <= 253
            && domain.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !domain.contains("..")
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Socket(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Socket(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl FromStr for TargetAddr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(socket_addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Socket(socket_addr));
        }
        let (domain, port) = s.rsplit_once(':').ok_or_else(|| "missing port number".to_string())?;
        if !Self::validate_domain(domain) {
            return Err("invalid domain name".to_string());
        }
        let port = port.parse::<u16>().map_err(|_| "invalid port number".to_string())?;
        Ok(TargetAddr::Domain(domain.to_string(), port))
    }
}

#[derive(Clone)]
struct CacheEntry {
    address: Ipv4Addr,
    resolved_at: Instant,
}

/// Cached hostname-to-IPv4 resolver.
#[derive(Default)]
pub struct Resolver {
    entries: DashMap<String, CacheEntry>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a target to an IPv4 address and port. Hostname lookups are
    /// cached for a minute; on failure a stale entry is served if one exists.
    pub async fn resolve(&self, target: &TargetAddr) -> Result<(Ipv4Addr, u16)> {
        match target {
            TargetAddr::Socket(SocketAddr::V4(v4)) => Ok((*v4.ip(), v4.port())),
            TargetAddr::Socket(other) => {
                Err(Error::Resolve(format!("{other}: only IPv4 targets are routable")))
            }
            TargetAddr::Domain(domain, port) => {
                if let Some(entry) = self.entries.get(domain) {
                    if entry.resolved_at.elapsed() < DNS_CACHE_TTL {
                        debug!(domain, "DNS cache hit");
                        return Ok((entry.address, *port));
                    }
                }
                match self.lookup_ipv4(domain, *port).await {
                    Ok(address) => {
                        self.entries.insert(
                            domain.clone(),
                            CacheEntry { address, resolved_at: Instant::now() },
                        );
                        Ok((address, *port))
                    }
                    Err(e) => {
                        if let Some(entry) = self.entries.get(domain) {
                            warn!(domain, error = %e, "DNS lookup failed, serving stale entry");
                            return Ok((entry.address, *port));
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn lookup_ipv4(&self, domain: &str, port: u16) -> Result<Ipv4Addr> {
        let addrs = lookup_host((domain, port))
            .await
            .map_err(|e| Error::Resolve(format!("{domain}: {e}")))?;
        addrs
            .filter_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| Error::Resolve(format!("{domain}: no IPv4 address")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socket_and_domain_forms() {
        assert_eq!(
            "10.0.0.1:8080".parse::<TargetAddr>().unwrap(),
            TargetAddr::Socket("10.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(
            "backend.internal:80".parse::<TargetAddr>().unwrap(),
            TargetAddr::Domain("backend.internal".to_string(), 80)
        );
        assert!("no-port".parse::<TargetAddr>().is_err());
        assert!(".bad.:80".parse::<TargetAddr>().is_err());
        assert!("a..b:80".parse::<TargetAddr>().is_err());
    }

    #[tokio::test]
    async fn resolves_literal_without_lookup() {
        let resolver = Resolver::new();
        let target = "192.0.2.7:443".parse().unwrap();
        assert_eq!(
            resolver.resolve(&target).await.unwrap(),
            (Ipv4Addr::new(192, 0, 2, 7), 443)
        );
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let resolver = Resolver::new();
        let target = TargetAddr::Domain("localhost".to_string(), 80);
        let (ip, port) = resolver.resolve(&target).await.unwrap();
        assert_eq!(ip, Ipv4Addr::LOCALHOST);
        assert_eq!(port, 80);
    }
}
