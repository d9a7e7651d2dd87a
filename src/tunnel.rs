//! Connection dispatch
//!
//! The tunnel routes every inbound TCP connection and UDP packet: pick an
//! adapter (by rule, or fixed by the tunnel mode), dial it, and relay data.
//!
//! ```text
//! TCP:  inbound -> handle_tcp -> resolve_proxy -> dial (retry) -> copy_bidirectional
//! UDP:  inbound -> handle_udp_packet -> nat::Table
//!                     | new flow: resolve_proxy -> listen_packet
//!                     |           spawn PacketSender::process + handle_udp_to_local
//!                     '-> PacketSender::send
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterType, Conn, Proxy};
use crate::dns::Resolver;
use crate::error::{AdapterError, GroupError, RouterError};
use crate::metadata::{Metadata, Network};
use crate::nat::{
    handle_udp_to_local, PacketAdapter, PacketSender, Table, UdpPacket, WriteBack, WriteBackProxy,
    DEFAULT_UDP_TIMEOUT,
};
use crate::process::ProcessFinder;
use crate::rules::{Rule, RuleEngine};

/// Dial attempts for one connection
pub const DIAL_ATTEMPTS: u32 = 3;

/// Delay before the first redial; doubles per attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Adapter used in global mode
pub const GLOBAL: &str = "GLOBAL";

/// Adapter used in direct mode and when no rule matches
pub const DIRECT: &str = "DIRECT";

/// Routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Match rules
    #[default]
    Rule,
    /// Everything through the `GLOBAL` adapter
    Global,
    /// Everything through `DIRECT`
    Direct,
}

impl Mode {
    /// Parse a mode name, case-insensitively
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rule" => Some(Self::Rule),
            "global" => Some(Self::Global),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Global => "global",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct TunnelStats {
    tcp: AtomicU64,
    udp_flows: AtomicU64,
    failed: AtomicU64,
    upload: AtomicU64,
    download: AtomicU64,
}

/// Point-in-time copy of [`TunnelStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub tcp: u64,
    pub udp_flows: u64,
    pub failed: u64,
    pub upload: u64,
    pub download: u64,
}

impl TunnelStats {
    fn record_tcp(&self, upload: u64, download: u64) {
        self.tcp.fetch_add(1, Ordering::Relaxed);
        self.upload.fetch_add(upload, Ordering::Relaxed);
        self.download.fetch_add(download, Ordering::Relaxed);
    }

    fn record_udp_flow(&self) {
        self.udp_flows.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tcp: self.tcp.load(Ordering::Relaxed),
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
        }
    }
}

/// Adapter picked for a connection, and the rule that picked it
pub struct Route {
    pub proxy: Arc<Proxy>,
    pub rule: Option<Arc<dyn Rule>>,
}

impl Route {
    /// `"RULE(payload)"`, or the mode when no rule was involved
    #[must_use]
    pub fn describe(&self, mode: Mode) -> String {
        match &self.rule {
            Some(rule) if rule.payload().is_empty() => rule.rule_type().to_string(),
            Some(rule) => format!("{}({})", rule.rule_type(), rule.payload()),
            None => mode.as_str().to_string(),
        }
    }
}

/// Routes connections through adapters
pub struct Tunnel {
    mode: RwLock<Mode>,
    rules: Arc<RuleEngine>,
    proxies: ArcSwap<HashMap<String, Arc<Proxy>>>,
    nat: Arc<Table>,
    resolver: Arc<dyn Resolver>,
    process_finder: Option<Arc<dyn ProcessFinder>>,
    udp_timeout: Duration,
    stats: TunnelStats,
}

impl Tunnel {
    /// Tunnel over `proxies` (every named adapter and group)
    #[must_use]
    pub fn new(rules: Arc<RuleEngine>, proxies: HashMap<String, Arc<Proxy>>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            mode: RwLock::new(Mode::Rule),
            rules,
            proxies: ArcSwap::from_pointee(proxies),
            nat: Arc::new(Table::new()),
            resolver,
            process_finder: None,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            stats: TunnelStats::default(),
        }
    }

    #[must_use]
    pub fn with_mode(self, mode: Mode) -> Self {
        *self.mode.write() = mode;
        self
    }

    #[must_use]
    pub fn with_process_finder(mut self, finder: Arc<dyn ProcessFinder>) -> Self {
        self.process_finder = Some(finder);
        self
    }

    #[must_use]
    pub const fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = timeout;
        self
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: Mode) {
        info!(mode = %mode, "tunnel mode changed");
        *self.mode.write() = mode;
    }

    #[must_use]
    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    #[must_use]
    pub fn nat(&self) -> &Arc<Table> {
        &self.nat
    }

    #[must_use]
    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    /// Adapter by name
    #[must_use]
    pub fn proxy(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies.load().get(name).cloned()
    }

    /// All named adapters
    #[must_use]
    pub fn proxies(&self) -> Arc<HashMap<String, Arc<Proxy>>> {
        self.proxies.load_full()
    }

    /// Replace the adapter set
    pub fn update_proxies(&self, proxies: HashMap<String, Arc<Proxy>>) {
        debug!(proxies = proxies.len(), "tunnel proxies updated");
        self.proxies.store(Arc::new(proxies));
    }

    fn named(&self, name: &str) -> Result<Arc<Proxy>, RouterError> {
        self.proxy(name)
            .ok_or_else(|| GroupError::ProxyNotExist(name.to_string()).into())
    }

    /// Pick the adapter for `metadata`
    ///
    /// Rule matching may fill `metadata.dst_ip` and process fields. A
    /// non-empty `special_rules` matches that sub-rule list instead of the
    /// top-level rules.
    ///
    /// # Errors
    ///
    /// Returns `GroupError::ProxyNotExist` if the chosen adapter is unknown.
    pub async fn resolve_proxy(&self, metadata: &mut Metadata) -> Result<Route, RouterError> {
        if !metadata.special_proxy.is_empty() {
            let proxy = self.named(&metadata.special_proxy)?;
            return Ok(Route { proxy, rule: None });
        }
        match self.mode() {
            Mode::Direct => Ok(Route {
                proxy: self.named(DIRECT)?,
                rule: None,
            }),
            Mode::Global => Ok(Route {
                proxy: self.named(GLOBAL)?,
                rule: None,
            }),
            Mode::Rule => {
                let proxies = self.proxies.load_full();
                let accept = move |name: &str, m: &Metadata| accepts(&proxies, name, m);
                let resolver = Some(self.resolver.as_ref());
                let finder = self.process_finder.as_deref();
                let outcome = if metadata.special_rules.is_empty() {
                    self.rules.match_metadata(metadata, resolver, finder, &accept).await
                } else {
                    let name = metadata.special_rules.clone();
                    self.rules
                        .match_sub_rules(&name, metadata, resolver, finder, &accept)
                        .await
                };
                Ok(Route {
                    proxy: self.named(&outcome.adapter)?,
                    rule: outcome.rule,
                })
            }
        }
    }

    /// Route one TCP connection and relay it until either side closes
    ///
    /// Returns the bytes sent upstream and received back.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid metadata, an unknown adapter, a failed
    /// dial or a broken relay.
    pub async fn handle_tcp<S>(&self, mut inbound: S, mut metadata: Metadata) -> Result<(u64, u64), RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !metadata.valid() {
            warn!(metadata = ?metadata, "invalid metadata");
            self.stats.record_failed();
            return Err(AdapterError::InvalidDestination(metadata.remote_address()).into());
        }
        let route = match self.resolve_proxy(&mut metadata).await {
            Ok(route) => route,
            Err(e) => {
                self.stats.record_failed();
                return Err(e);
            }
        };

        let mut outbound = match dial_with_retry(&route.proxy, &metadata.pure()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    conn = %metadata.source_detail(),
                    proxy = %route.proxy.name(),
                    error = %e,
                    "[TCP] dial failed"
                );
                self.stats.record_failed();
                return Err(e.into());
            }
        };
        info!(
            conn = %metadata.source_detail(),
            rule = %route.describe(self.mode()),
            proxy = %route.proxy.name(),
            "[TCP] connected"
        );

        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((up, down)) => {
                debug!(conn = %metadata.source_detail(), up, down, "[TCP] closed");
                self.stats.record_tcp(up, down);
                Ok((up, down))
            }
            Err(e) => {
                debug!(conn = %metadata.source_detail(), error = %e, "[TCP] relay ended");
                self.stats.record_failed();
                Err(e.into())
            }
        }
    }

    /// Route one UDP packet
    ///
    /// The first packet of a flow opens the outbound session in the
    /// background; every packet is queued on the flow's sender without
    /// blocking. Invalid packets are dropped.
    pub fn handle_udp_packet(self: &Arc<Self>, packet: Arc<dyn UdpPacket>, metadata: Metadata) {
        if !metadata.valid() {
            warn!(metadata = ?metadata, "invalid metadata, packet dropped");
            return;
        }
        let packet = PacketAdapter::new(packet, metadata);
        let key = packet.key();
        let (sender, existed) = self.nat.get_or_create(&key, || Arc::new(PacketSender::new()));
        if !existed {
            self.stats.record_udp_flow();
            let tunnel = Arc::clone(self);
            let first = Arc::clone(packet.packet());
            let metadata = packet.metadata().clone();
            let sender = Arc::clone(&sender);
            tokio::spawn(async move { tunnel.open_udp_flow(key, first, metadata, sender).await });
        }
        sender.send(packet);
    }

    async fn open_udp_flow(
        self: Arc<Self>,
        key: String,
        first: Arc<dyn UdpPacket>,
        mut metadata: Metadata,
        sender: Arc<PacketSender>,
    ) {
        let origin = metadata.udp_addr();
        let opened = async {
            let route = self.resolve_proxy(&mut metadata).await?;
            let pc = route.proxy.listen_packet(&metadata.pure()).await?;
            Ok::<_, RouterError>((route, pc))
        }
        .await;
        let (route, pc) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(conn = %metadata.source_detail(), error = %e, "[UDP] dial failed");
                self.stats.record_failed();
                sender.close();
                self.nat.delete(&key);
                return;
            }
        };
        info!(
            conn = %metadata.source_detail(),
            rule = %route.describe(self.mode()),
            proxy = %route.proxy.name(),
            "[UDP] connected"
        );

        let write_back = Arc::new(WriteBackProxy::new(first));
        tokio::spawn(handle_udp_to_local(
            Arc::clone(&write_back) as Arc<dyn WriteBack>,
            Arc::clone(&pc),
            Arc::clone(&sender),
            Arc::clone(&self.nat),
            key,
            origin,
            self.udp_timeout,
        ));
        sender.process(pc, Some(write_back), Arc::clone(&self.resolver)).await;
    }
}

/// Whether the rule loop may route `metadata` through `name`
///
/// Unknown adapters and `Pass` (directly or as a group's current member) let
/// matching continue, as does a UDP packet for an adapter without UDP.
fn accepts(proxies: &HashMap<String, Arc<Proxy>>, name: &str, metadata: &Metadata) -> bool {
    let Some(proxy) = proxies.get(name) else {
        debug!(proxy = %name, "rule target not found, skipped");
        return false;
    };
    let is_pass = proxy.adapter_type() == AdapterType::Pass
        || proxy
            .unwrap(metadata, false)
            .is_some_and(|p| p.adapter_type() == AdapterType::Pass);
    if is_pass {
        return false;
    }
    if metadata.network == Network::Udp && !proxy.support_udp() {
        debug!(proxy = %name, "rule target has no UDP, skipped");
        return false;
    }
    true
}

async fn dial_with_retry(proxy: &Proxy, metadata: &Metadata) -> Result<Conn, AdapterError> {
    let mut backoff = RETRY_BACKOFF;
    let mut attempt = 1;
    loop {
        match proxy.dial(metadata).await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < DIAL_ATTEMPTS && e.is_recoverable() => {
                debug!(proxy = %proxy.name(), attempt, error = %e, "dial failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("mode", &self.mode())
            .field("proxies", &self.proxies.load().len())
            .field("nat_entries", &self.nat.len())
            .field("udp_timeout", &self.udp_timeout)
            .finish_non_exhaustive()
    }
}
