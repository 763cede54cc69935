//! Name resolution and local network discovery for the allowlist
//!
//! Only IPv4 (A) results are used. A domain that fails to resolve is
//! skipped for that cycle; the next refresh tries again.

use crate::core::error::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::collections::BTreeSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, warn};

/// Addresses that stay reachable no matter what resolves
pub const ALWAYS_ALLOWED: [Ipv4Addr; 2] = [Ipv4Addr::LOCALHOST, Ipv4Addr::BROADCAST];

pub trait Resolver: Send + Sync {
    /// IPv4 addresses of `domain`.
    fn resolve(&self, domain: &str) -> impl Future<Output = Result<Vec<Ipv4Addr>>> + Send;

    /// Networks directly attached to this host.
    fn local_subnets(&self) -> Vec<IpNetwork>;
}

/// Resolves through the OS resolver and reads the host's interfaces.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Resolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        let lookup = tokio::net::lookup_host(format!("{domain}:0"));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| Error::Resolution {
                domain: domain.to_string(),
                message: format!("timed out after {:?}", self.timeout),
            })?
            .map_err(|e| Error::Resolution {
                domain: domain.to_string(),
                message: e.to_string(),
            })?;

        let mut v4: Vec<Ipv4Addr> = addrs
            .filter_map(|sa| match sa.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .collect();
        v4.sort_unstable();
        v4.dedup();
        Ok(v4)
    }

    fn local_subnets(&self) -> Vec<IpNetwork> {
        let interfaces = match NetworkInterface::show() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Interface discovery failed ({}); using private ranges", e);
                return private_ranges();
            }
        };

        let mut subnets = Vec::new();
        for iface in interfaces {
            for addr in iface.addr {
                let Addr::V4(v4) = addr else { continue };
                if v4.ip.is_loopback() {
                    continue;
                }
                let Some(mask) = v4.netmask else { continue };
                match Ipv4Network::with_netmask(v4.ip, mask) {
                    Ok(net) => {
                        // Normalise to the network address
                        if let Ok(net) = Ipv4Network::new(net.network(), net.prefix()) {
                            let net = IpNetwork::V4(net);
                            if !subnets.contains(&net) {
                                debug!("Local subnet on {}: {}", iface.name, net);
                                subnets.push(net);
                            }
                        }
                    }
                    Err(e) => debug!("Skipping {} on {}: {}", v4.ip, iface.name, e),
                }
            }
        }

        if subnets.is_empty() {
            warn!("No IPv4 interfaces found; using private ranges as local subnet");
            return private_ranges();
        }
        subnets
    }
}

/// All of 127.0.0.0/8 and `::1`. The output hook sees loopback traffic too,
/// including queries to a local stub resolver such as 127.0.0.53.
pub fn loopback_ranges() -> Vec<IpNetwork> {
    let mut ranges: Vec<IpNetwork> = Ipv4Network::new(Ipv4Addr::new(127, 0, 0, 0), 8)
        .ok()
        .map(IpNetwork::V4)
        .into_iter()
        .collect();
    ranges.push(IpNetwork::from(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    ranges
}

/// RFC 1918 and link-local ranges
pub fn private_ranges() -> Vec<IpNetwork> {
    [
        (Ipv4Addr::new(10, 0, 0, 0), 8),
        (Ipv4Addr::new(172, 16, 0, 0), 12),
        (Ipv4Addr::new(192, 168, 0, 0), 16),
        (Ipv4Addr::new(169, 254, 0, 0), 16),
    ]
    .into_iter()
    .filter_map(|(addr, prefix)| Ipv4Network::new(addr, prefix).ok())
    .map(IpNetwork::V4)
    .collect()
}

/// Resolves every domain and adds [`ALWAYS_ALLOWED`]. Failures are logged
/// and skipped.
pub async fn resolve_allowed<R: Resolver>(resolver: &R, domains: &[String]) -> BTreeSet<Ipv4Addr> {
    let mut allowed: BTreeSet<Ipv4Addr> = ALWAYS_ALLOWED.into_iter().collect();
    for domain in domains {
        match resolver.resolve(domain).await {
            Ok(ips) if ips.is_empty() => debug!("{} has no A records", domain),
            Ok(ips) => {
                debug!("Resolved {} -> {:?}", domain, ips);
                allowed.extend(ips);
            }
            Err(e) => debug!("Skipping {}: {}", domain, e),
        }
    }
    allowed
}
