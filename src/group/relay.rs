//! Relay group: dial through every member in turn

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{GroupBase, GroupKind, ProxyGroup};
use crate::adapter::{AdapterType, Conn, PacketConn, Proxy, ProxyAdapter};
use crate::error::AdapterError;
use crate::metadata::{Metadata, Network};

/// Depth limit when unwrapping nested groups
const MAX_UNWRAP_DEPTH: usize = 16;

/// Chains its members: the first dials the second's server, each later
/// member runs its protocol over the previous stream, and the last one
/// reaches the real destination.
///
/// Group members are resolved to their current concrete member. UDP is not
/// relayed.
#[derive(Debug)]
pub struct Relay {
    base: GroupBase,
}

impl Relay {
    #[must_use]
    pub fn new(base: GroupBase) -> Self {
        Self { base }
    }

    /// Concrete hops for `metadata`
    pub fn chain(&self, metadata: &Metadata, touch: bool) -> Vec<Arc<Proxy>> {
        self.base
            .get_proxies(touch)
            .into_iter()
            .map(|p| resolve_member(p, metadata, touch))
            .collect()
    }
}

fn resolve_member(mut proxy: Arc<Proxy>, metadata: &Metadata, touch: bool) -> Arc<Proxy> {
    for _ in 0..MAX_UNWRAP_DEPTH {
        match proxy.unwrap(metadata, touch) {
            Some(inner) => proxy = inner,
            None => break,
        }
    }
    proxy
}

/// Metadata targeting a hop's `host:port` server address
fn hop_metadata(proxy: &Proxy, addr: Option<String>) -> Result<Metadata, AdapterError> {
    let addr = addr.ok_or_else(|| AdapterError::Unsupported {
        proxy: proxy.name().to_string(),
        op: "relay hop",
    })?;
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(Metadata::new(Network::Tcp).with_dst(sa.ip(), sa.port()));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.trim_matches(|c| c == '[' || c == ']'), p)))
        .ok_or_else(|| AdapterError::InvalidDestination(addr.clone()))?;
    let metadata = match host.parse::<IpAddr>() {
        Ok(ip) => Metadata::new(Network::Tcp).with_dst(ip, port),
        Err(_) => {
            let mut m = Metadata::new(Network::Tcp).with_host(host);
            m.dst_port = port;
            m
        }
    };
    Ok(metadata)
}

impl ProxyGroup for Relay {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn kind(&self) -> GroupKind {
        GroupKind::Relay
    }

    fn now(&self) -> String {
        String::new()
    }
}

#[async_trait]
impl ProxyAdapter for Relay {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Relay
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError> {
        let chain = self.chain(metadata, true);
        let Some((first, rest)) = chain.split_first() else {
            return Err(AdapterError::InvalidDestination(format!("relay {} has no members", self.base.name())));
        };
        if rest.is_empty() {
            return first.dial(metadata).await;
        }

        let next = &rest[0];
        let mut conn = first.dial(&hop_metadata(next, next.adapter().addr())?).await?;
        debug!(relay = %self.base.name(), hop = %first.name(), "relay hop connected");
        for (i, hop) in rest.iter().enumerate() {
            let target = match rest.get(i + 1) {
                Some(next) => hop_metadata(next, next.adapter().addr())?,
                None => metadata.clone(),
            };
            conn = hop.adapter().stream_conn(conn, &target).await?;
            debug!(relay = %self.base.name(), hop = %hop.name(), "relay hop connected");
        }
        Ok(conn)
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        Err(AdapterError::UdpUnsupported(self.base.name().to_string()))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.base.close();
        Ok(())
    }
}
