//! Load-balance group
//!
//! Each connection is assigned a member by one of three strategies:
//!
//! | Strategy             | Member chosen by                                   |
//! |----------------------|----------------------------------------------------|
//! | `consistent-hashing` | jump hash of the destination's registrable domain  |
//! | `round-robin`        | a shared cursor, skipping dead members             |
//! | `sticky-sessions`    | cached per source and destination, 10 minute TTL   |
//!
//! Dead members are skipped; when nothing is alive the first member is used.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use super::{GroupBase, GroupKind, ProxyGroup};
use crate::adapter::{AdapterType, Conn, PacketConn, Proxy, ProxyAdapter};
use crate::error::{AdapterError, GroupError};
use crate::metadata::Metadata;

/// Hash probes before falling back to a linear scan
pub const MAX_RETRY: usize = 3;

/// Sticky-session cache size
pub const STICKY_CAPACITY: u64 = 1000;

/// Sticky-session lifetime
pub const STICKY_TTL: Duration = Duration::from_secs(600);

/// Member assignment strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    ConsistentHashing,
    RoundRobin,
    StickySessions,
}

impl Strategy {
    /// Parse a strategy name; empty means consistent hashing
    ///
    /// # Errors
    ///
    /// Returns `GroupError::InvalidStrategy` for other names.
    pub fn parse(s: &str) -> Result<Self, GroupError> {
        match s {
            "" | "consistent-hashing" => Ok(Self::ConsistentHashing),
            "round-robin" => Ok(Self::RoundRobin),
            "sticky-sessions" => Ok(Self::StickySessions),
            other => Err(GroupError::InvalidStrategy(other.to_string())),
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConsistentHashing => "consistent-hashing",
            Self::RoundRobin => "round-robin",
            Self::StickySessions => "sticky-sessions",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Jump consistent hash of `key` into `buckets` slots
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let mut b = 0usize;
    let mut j = 0usize;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as usize;
    }
    b
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Destination key: the last two labels of the host, else the IP
fn destination_key(metadata: &Metadata) -> String {
    let host = metadata.rule_host();
    if !host.is_empty() && host.parse::<IpAddr>().is_err() {
        let labels: Vec<&str> = host.trim_end_matches('.').rsplitn(3, '.').collect();
        if labels.len() >= 2 {
            return format!("{}.{}", labels[1], labels[0]);
        }
        return host.to_string();
    }
    metadata.dst_ip.map(|ip| ip.to_string()).unwrap_or_default()
}

#[allow(clippy::cast_possible_truncation)]
fn nonce() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Spreads connections over alive members
pub struct LoadBalance {
    base: GroupBase,
    strategy: Strategy,
    cursor: AtomicUsize,
    sticky: Cache<u64, usize>,
}

impl LoadBalance {
    #[must_use]
    pub fn new(base: GroupBase, strategy: Strategy) -> Self {
        Self {
            base,
            strategy,
            cursor: AtomicUsize::new(0),
            sticky: Cache::builder()
                .max_capacity(STICKY_CAPACITY)
                .time_to_live(STICKY_TTL)
                .build(),
        }
    }

    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Member assigned to `metadata`
    pub fn select(&self, metadata: &Metadata, touch: bool) -> Arc<Proxy> {
        let proxies = self.base.get_proxies(touch);
        let picked = match self.strategy {
            Strategy::ConsistentHashing => self.consistent_hashing(&proxies, metadata),
            Strategy::RoundRobin => self.round_robin(&proxies),
            Strategy::StickySessions => self.sticky_sessions(&proxies, metadata),
        };
        picked.unwrap_or_else(|| self.base.compatible())
    }

    fn alive(&self, proxy: &Proxy) -> bool {
        proxy.alive_for_test_url(self.base.test_url())
    }

    fn consistent_hashing(&self, proxies: &[Arc<Proxy>], metadata: &Metadata) -> Option<Arc<Proxy>> {
        let mut key = hash_str(&destination_key(metadata));
        for _ in 0..MAX_RETRY {
            let proxy = &proxies[jump_hash(key, proxies.len())];
            if self.alive(proxy) {
                return Some(Arc::clone(proxy));
            }
            key = key.wrapping_add(1);
        }
        proxies
            .iter()
            .find(|p| self.alive(p))
            .or_else(|| proxies.first())
            .cloned()
    }

    fn round_robin(&self, proxies: &[Arc<Proxy>]) -> Option<Arc<Proxy>> {
        let len = proxies.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|i| &proxies[(start + i) % len])
            .find(|p| self.alive(p))
            .or_else(|| proxies.first())
            .cloned()
    }

    fn sticky_sessions(&self, proxies: &[Arc<Proxy>], metadata: &Metadata) -> Option<Arc<Proxy>> {
        let len = proxies.len();
        let src = metadata.src_ip.map(|ip| ip.to_string()).unwrap_or_default();
        let key = hash_str(&format!("{src}-{}", destination_key(metadata)));

        let cached = self.sticky.get(&key).filter(|&idx| idx < len);
        let mut idx = cached.unwrap_or_else(|| jump_hash(key.wrapping_add(nonce()), len));
        for _ in 0..MAX_RETRY {
            let proxy = &proxies[idx];
            if self.alive(proxy) {
                if cached != Some(idx) {
                    self.sticky.insert(key, idx);
                }
                return Some(Arc::clone(proxy));
            }
            idx = jump_hash(key.wrapping_add(nonce()), len);
        }
        self.sticky.insert(key, 0);
        proxies.first().cloned()
    }
}

impl ProxyGroup for LoadBalance {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn kind(&self) -> GroupKind {
        GroupKind::LoadBalance
    }

    /// No single member is current; always empty
    fn now(&self) -> String {
        String::new()
    }
}

#[async_trait]
impl ProxyAdapter for LoadBalance {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::LoadBalance
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError> {
        let proxy = self.select(metadata, true);
        match proxy.dial(metadata).await {
            Ok(conn) => {
                self.base.on_dial_success();
                Ok(conn)
            }
            Err(e) => {
                self.base.on_dial_failed(&proxy.adapter_type(), &e);
                Err(e)
            }
        }
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        self.select(metadata, true).listen_packet(metadata).await
    }

    fn unwrap(&self, metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        Some(self.select(metadata, touch))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.base.close();
        Ok(())
    }
}

impl fmt::Debug for LoadBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalance")
            .field("base", &self.base)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
