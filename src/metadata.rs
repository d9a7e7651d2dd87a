//! Per-connection routing metadata
//!
//! [`Metadata`] describes one TCP connection or one UDP packet: where it comes
//! from, where it wants to go, and which inbound accepted it. It is filled in
//! progressively during dispatch (DNS resolution sets `dst_ip`, process lookup
//! sets `process`), so rules receive it mutably.
//!
//! # Example
//!
//! ```
//! use meta_router::metadata::{AddrType, Metadata, Network};
//!
//! let mut m = Metadata::new(Network::Tcp);
//! m.host = "example.com".into();
//! m.dst_port = 443;
//! assert_eq!(m.addr_type(), AddrType::Domain);
//! assert!(!m.resolved());
//! assert_eq!(m.remote_address(), "example.com:443");
//!
//! m.dst_ip = Some("93.184.216.34".parse().unwrap());
//! assert!(m.resolved());
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// TCP stream
    #[default]
    Tcp,
    /// UDP datagrams
    Udp,
}

impl Network {
    /// Parse a network name (case-insensitive)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of inbound that accepted a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundType {
    Http,
    Socks5,
    Mixed,
    Tun,
    Tproxy,
    Redir,
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
    Hysteria2,
    Tuic,
    Anytls,
    /// Connections created by the router itself (probes, provider downloads)
    #[default]
    Inner,
}

impl InboundType {
    /// All inbound types, in declaration order
    pub const ALL: [Self; 14] = [
        Self::Http,
        Self::Socks5,
        Self::Mixed,
        Self::Tun,
        Self::Tproxy,
        Self::Redir,
        Self::Shadowsocks,
        Self::Vmess,
        Self::Vless,
        Self::Trojan,
        Self::Hysteria2,
        Self::Tuic,
        Self::Anytls,
        Self::Inner,
    ];

    /// Parse an inbound type name (case-insensitive)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == lower)
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks5 => "socks5",
            Self::Mixed => "mixed",
            Self::Tun => "tun",
            Self::Tproxy => "tproxy",
            Self::Redir => "redir",
            Self::Shadowsocks => "shadowsocks",
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Hysteria2 => "hysteria2",
            Self::Tuic => "tuic",
            Self::Anytls => "anytls",
            Self::Inner => "inner",
        }
    }
}

impl fmt::Display for InboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the DNS layer produced the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    /// Real resolution
    #[default]
    Normal,
    /// Fake-IP pool
    FakeIp,
    /// IP mapped back to a host by the DNS layer
    Mapping,
    /// Static hosts entry
    Hosts,
}

/// Address kind derived from which of host/dst_ip is set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    Domain,
    Ipv4,
    Ipv6,
}

/// Routing metadata of one connection or packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub network: Network,
    pub inbound_type: InboundType,
    pub inbound_name: String,
    pub inbound_user: String,
    pub inbound_port: u16,
    pub src_ip: Option<IpAddr>,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub host: String,
    pub sniff_host: String,
    pub process: String,
    pub process_path: String,
    pub uid: Option<u32>,
    pub dns_mode: DnsMode,
    /// Adapter forced by the inbound, bypassing rules
    pub special_proxy: String,
    /// Sub-rule list forced by the inbound instead of the main rules
    pub special_rules: String,
}

impl Metadata {
    /// Create empty metadata for the given network
    #[must_use]
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Builder-style destination IP setter
    #[must_use]
    pub fn with_dst(mut self, ip: IpAddr, port: u16) -> Self {
        self.dst_ip = Some(unmap(ip));
        self.dst_port = port;
        self
    }

    /// Builder-style source setter
    #[must_use]
    pub fn with_src(mut self, ip: IpAddr, port: u16) -> Self {
        self.src_ip = Some(unmap(ip));
        self.src_port = port;
        self
    }

    /// Builder-style host setter
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Whether the destination IP is known
    #[must_use]
    pub const fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Whether either a host or a destination IP is present
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    /// Address kind, derived only from host and `dst_ip`
    #[must_use]
    pub fn addr_type(&self) -> AddrType {
        if !self.host.is_empty() {
            return AddrType::Domain;
        }
        match self.dst_ip {
            Some(IpAddr::V4(_)) => AddrType::Ipv4,
            Some(IpAddr::V6(_)) => AddrType::Ipv6,
            None => AddrType::Domain,
        }
    }

    /// Host used by domain rules: the sniffed host wins over the dialed one
    #[must_use]
    pub fn rule_host(&self) -> &str {
        if self.sniff_host.is_empty() {
            &self.host
        } else {
            &self.sniff_host
        }
    }

    /// Copy that dials the mapped IP instead of a mapped/hosts name
    #[must_use]
    pub fn pure(&self) -> Self {
        let mut copy = self.clone();
        if matches!(self.dns_mode, DnsMode::Mapping | DnsMode::Hosts) && self.dst_ip.is_some() {
            copy.host.clear();
        }
        copy
    }

    /// `host:port` (or `ip:port`) of the destination
    #[must_use]
    pub fn remote_address(&self) -> String {
        match (self.host.is_empty(), self.dst_ip) {
            (true, Some(ip)) => SocketAddr::new(ip, self.dst_port).to_string(),
            (true, None) => format!("<nil>:{}", self.dst_port),
            (false, _) if self.host.contains(':') => format!("[{}]:{}", self.host, self.dst_port),
            (false, _) => format!("{}:{}", self.host, self.dst_port),
        }
    }

    /// `ip:port` of the source, or an empty string when unknown
    #[must_use]
    pub fn source_address(&self) -> String {
        self.src_ip
            .map(|ip| SocketAddr::new(ip, self.src_port).to_string())
            .unwrap_or_default()
    }

    /// `source --> destination` for log lines
    #[must_use]
    pub fn source_detail(&self) -> String {
        format!("{} --> {}", self.source_address(), self.remote_address())
    }

    /// Destination socket address, if the IP is known
    #[must_use]
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }

    /// Exchange source and destination addresses
    pub fn swap_src_dst(&mut self) {
        std::mem::swap(&mut self.src_ip, &mut self.dst_ip);
        std::mem::swap(&mut self.src_port, &mut self.dst_port);
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host.is_empty() {
            f.write_str(&self.host)
        } else if let Some(ip) = self.dst_ip {
            write!(f, "{ip}")
        } else {
            f.write_str("<nil>")
        }
    }
}

/// Strip an IPv4-mapped IPv6 address down to IPv4
#[must_use]
pub fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_network_parse() {
        assert_eq!(Network::parse("TCP"), Some(Network::Tcp));
        assert_eq!(Network::parse("udp"), Some(Network::Udp));
        assert_eq!(Network::parse("sctp"), None);
    }

    #[test]
    fn test_inbound_type_parse() {
        assert_eq!(InboundType::parse("SOCKS5"), Some(InboundType::Socks5));
        assert_eq!(InboundType::parse("tun"), Some(InboundType::Tun));
        assert_eq!(InboundType::parse("ftp"), None);
    }

    #[test]
    fn test_resolved_follows_dst_ip() {
        let mut m = Metadata::new(Network::Udp).with_host("a.com");
        assert!(!m.resolved());
        assert!(m.valid());
        m.dst_ip = Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(m.resolved());
    }

    #[test]
    fn test_addr_type() {
        let m = Metadata::new(Network::Tcp).with_dst("1.2.3.4".parse().unwrap(), 80);
        assert_eq!(m.addr_type(), AddrType::Ipv4);
        let m = Metadata::new(Network::Tcp).with_dst("::1".parse().unwrap(), 80);
        assert_eq!(m.addr_type(), AddrType::Ipv6);
        let m = m.with_host("x.org");
        assert_eq!(m.addr_type(), AddrType::Domain);
    }

    #[test]
    fn test_pure_clears_mapped_host() {
        let mut m = Metadata::new(Network::Udp)
            .with_host("mapped.example")
            .with_dst("198.18.0.1".parse().unwrap(), 53);
        assert_eq!(m.pure().host, "mapped.example");

        m.dns_mode = DnsMode::Mapping;
        let pure = m.pure();
        assert!(pure.host.is_empty());
        assert_eq!(m.host, "mapped.example");

        m.dst_ip = None;
        assert_eq!(m.pure().host, "mapped.example");
    }

    #[test]
    fn test_display_key() {
        let m = Metadata::new(Network::Udp);
        assert_eq!(m.to_string(), "<nil>");
        let m = m.with_dst("8.8.8.8".parse().unwrap(), 53);
        assert_eq!(m.to_string(), "8.8.8.8");
        let m = m.with_host("dns.google");
        assert_eq!(m.to_string(), "dns.google");
    }

    #[test]
    fn test_remote_and_source_address() {
        let m = Metadata::new(Network::Tcp)
            .with_src("10.0.0.2".parse().unwrap(), 5000)
            .with_dst("::1".parse().unwrap(), 443);
        assert_eq!(m.remote_address(), "[::1]:443");
        assert_eq!(m.source_address(), "10.0.0.2:5000");
        assert_eq!(m.source_detail(), "10.0.0.2:5000 --> [::1]:443");
    }

    #[test]
    fn test_swap_src_dst() {
        let mut m = Metadata::new(Network::Tcp)
            .with_src("10.0.0.2".parse().unwrap(), 5000)
            .with_dst("1.1.1.1".parse().unwrap(), 443);
        m.swap_src_dst();
        assert_eq!(m.dst_ip, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(m.dst_port, 5000);
        assert_eq!(m.src_port, 443);
    }

    #[test]
    fn test_unmap() {
        let mapped: IpAddr = "::ffff:1.2.3.4".parse().unwrap();
        assert_eq!(unmap(mapped), IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        let m = Metadata::new(Network::Udp).with_dst(mapped, 1);
        assert_eq!(m.addr_type(), AddrType::Ipv4);
    }

    #[test]
    fn test_rule_host_prefers_sniffed() {
        let mut m = Metadata::new(Network::Tcp).with_host("a.com");
        assert_eq!(m.rule_host(), "a.com");
        m.sniff_host = "b.com".into();
        assert_eq!(m.rule_host(), "b.com");
    }
}
