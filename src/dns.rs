//! Host resolution capability
//!
//! The router never speaks DNS itself. Rules that need an IP and UDP sessions
//! that must dial a host go through a [`Resolver`]; [`SystemResolver`] uses the
//! operating system's resolver via `tokio::net::lookup_host`.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::trace;

/// Resolves host names to IP addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` to one address
    ///
    /// # Errors
    ///
    /// Returns an error if the host has no usable address.
    async fn resolve_ip(&self, host: &str) -> io::Result<IpAddr>;
}

/// Resolver backed by the system's `getaddrinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver {
    /// Prefer IPv6 answers when both families are returned
    pub prefer_ipv6: bool,
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve_ip(&self, host: &str) -> io::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();
        trace!(host, answers = addrs.len(), "system resolve");

        let preferred = addrs
            .iter()
            .find(|ip| ip.is_ipv6() == self.prefer_ipv6)
            .or_else(|| addrs.first());
        preferred.copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
        })
    }
}

/// Fixed host table, used by tests and embedders with static mappings
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), ip);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve_ip(&self, host: &str) -> io::Result<IpAddr> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
    }
}
