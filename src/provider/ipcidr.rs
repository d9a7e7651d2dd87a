//! `ipcidr` rule provider strategy
//!
//! CIDR literals are collected into a [`CidrSet`]: per address family a sorted
//! list of disjoint inclusive ranges. `merge` coalesces overlapping and
//! adjacent ranges, after which containment is one binary search.
//!
//! # Binary format
//!
//! All integers big-endian:
//!
//! ```text
//! "MRCS" | version: u8 | entries: u64
//! v4_count: u32 | v4_count * (start: u32, end: u32)
//! v6_count: u32 | v6_count * (start: u128, end: u128)
//! ```
//!
//! `entries` is the number of literals the set was built from.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ipnet::{IpNet, Ipv4Net, Ipv4Subnets, Ipv6Net, Ipv6Subnets};
use tracing::warn;

use super::{RuleBehavior, RuleStrategy};
use crate::error::ProviderError;
use crate::metadata::{unmap, Metadata};
use crate::rules::RuleMatchHelper;

const MAGIC: &[u8; 4] = b"MRCS";
const FORMAT_VERSION: u8 = 1;

/// Set of IPv4 and IPv6 ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CidrSet {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
    merged: bool,
}

impl CidrSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prefix; call [`merge`](Self::merge) before querying
    pub fn insert(&mut self, net: IpNet) {
        match net.trunc() {
            IpNet::V4(n) => self.v4.push((u32::from(n.network()), u32::from(n.broadcast()))),
            IpNet::V6(n) => self.v6.push((u128::from(n.network()), u128::from(n.broadcast()))),
        }
        self.merged = false;
    }

    /// Sort and coalesce overlapping or adjacent ranges
    pub fn merge(&mut self) {
        merge_ranges(&mut self.v4);
        merge_ranges(&mut self.v6);
        self.merged = true;
    }

    /// Whether `ip` falls in any range
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        debug_assert!(self.merged || (self.v4.is_empty() && self.v6.is_empty()));
        match unmap(ip) {
            IpAddr::V4(v4) => range_contains(&self.v4, u32::from(v4)),
            IpAddr::V6(v6) => range_contains(&self.v6, u128::from(v6)),
        }
    }

    /// Number of disjoint ranges after merging
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Visit the set as a minimal list of prefixes; stop when `f` returns false
    pub fn foreach(&self, mut f: impl FnMut(IpNet) -> bool) {
        for &(start, end) in &self.v4 {
            for net in Ipv4Subnets::new(Ipv4Addr::from(start), Ipv4Addr::from(end), 0) {
                if !f(IpNet::V4(net)) {
                    return;
                }
            }
        }
        for &(start, end) in &self.v6 {
            for net in Ipv6Subnets::new(Ipv6Addr::from(start), Ipv6Addr::from(end), 0) {
                if !f(IpNet::V6(net)) {
                    return;
                }
            }
        }
    }

    /// Serialize, recording `entries` as the literal count
    #[must_use]
    pub fn to_bytes(&self, entries: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(21 + self.v4.len() * 8 + self.v6.len() * 32);
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u64(entries);
        buf.put_u32(len_u32(self.v4.len()));
        for &(start, end) in &self.v4 {
            buf.put_u32(start);
            buf.put_u32(end);
        }
        buf.put_u32(len_u32(self.v6.len()));
        for &(start, end) in &self.v6 {
            buf.put_u128(start);
            buf.put_u128(end);
        }
        buf.freeze()
    }

    /// Deserialize, returning the set and its literal count
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidBinary` for a bad header, a truncated
    /// blob or unsorted ranges.
    pub fn from_bytes(mut data: &[u8]) -> Result<(Self, u64), ProviderError> {
        let invalid = |what: &str| ProviderError::InvalidBinary(what.to_string());
        if data.remaining() < 4 + 1 + 8 + 4 || &data[..4] != MAGIC {
            return Err(invalid("bad header"));
        }
        data.advance(4);
        let version = data.get_u8();
        if version != FORMAT_VERSION {
            return Err(invalid(&format!("unsupported version {version}")));
        }
        let entries = data.get_u64();

        let n4 = data.get_u32() as usize;
        if data.remaining() < n4 * 8 {
            return Err(invalid("truncated v4 ranges"));
        }
        let v4: Vec<(u32, u32)> = (0..n4).map(|_| (data.get_u32(), data.get_u32())).collect();

        if data.remaining() < 4 {
            return Err(invalid("missing v6 count"));
        }
        let n6 = data.get_u32() as usize;
        if data.remaining() < n6 * 32 {
            return Err(invalid("truncated v6 ranges"));
        }
        let v6: Vec<(u128, u128)> = (0..n6).map(|_| (data.get_u128(), data.get_u128())).collect();

        if !is_disjoint_sorted(&v4) || !is_disjoint_sorted(&v6) {
            return Err(invalid("ranges are not sorted"));
        }
        Ok((
            Self {
                v4,
                v6,
                merged: true,
            },
            entries,
        ))
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

trait RangeBound: Copy + Ord {
    fn succ(self) -> Option<Self>;
}

impl RangeBound for u32 {
    fn succ(self) -> Option<Self> {
        self.checked_add(1)
    }
}

impl RangeBound for u128 {
    fn succ(self) -> Option<Self> {
        self.checked_add(1)
    }
}

fn merge_ranges<T: RangeBound>(ranges: &mut Vec<(T, T)>) {
    if ranges.len() < 2 {
        return;
    }
    ranges.sort_unstable();
    let mut merged: Vec<(T, T)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges.iter() {
        if let Some(last) = merged.last_mut() {
            // Overlapping, or adjacent unless the last range already ends at MAX.
            let touches = last.1.succ().map_or(true, |next| start <= next);
            if touches {
                last.1 = last.1.max(end);
                continue;
            }
        }
        merged.push((start, end));
    }
    *ranges = merged;
}

fn range_contains<T: Copy + Ord>(ranges: &[(T, T)], x: T) -> bool {
    let idx = ranges.partition_point(|&(start, _)| start <= x);
    idx > 0 && ranges[idx - 1].1 >= x
}

fn is_disjoint_sorted<T: Copy + Ord>(ranges: &[(T, T)]) -> bool {
    ranges.iter().all(|&(s, e)| s <= e) && ranges.windows(2).all(|w| w[0].1 < w[1].0)
}

fn parse_cidr(line: &str) -> Option<IpNet> {
    if let Ok(net) = line.parse::<IpNet>() {
        return Some(net);
    }
    match line.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => Ipv4Net::new(ip, 32).ok().map(IpNet::V4),
        IpAddr::V6(ip) => Ipv6Net::new(ip, 128).ok().map(IpNet::V6),
    }
}

/// Destination IP membership in a merged CIDR set
#[derive(Debug, Default)]
pub struct IpCidrStrategy {
    set: CidrSet,
    count: usize,
}

impl IpCidrStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strategy loaded from [`CidrSet::to_bytes`] output
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidBinary` for a corrupt blob.
    pub fn from_binary(data: &[u8]) -> Result<Self, ProviderError> {
        let (set, entries) = CidrSet::from_bytes(data)?;
        Ok(Self {
            set,
            count: usize::try_from(entries).unwrap_or(usize::MAX),
        })
    }

    /// The merged set
    #[must_use]
    pub const fn set(&self) -> &CidrSet {
        &self.set
    }
}

#[async_trait]
impl RuleStrategy for IpCidrStrategy {
    fn behavior(&self) -> RuleBehavior {
        RuleBehavior::IpCidr
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> bool {
        if !metadata.resolved() {
            helper.resolve_ip(metadata).await;
        }
        metadata.dst_ip.is_some_and(|ip| self.set.contains(ip))
    }

    fn insert(&mut self, line: &str) {
        match parse_cidr(line) {
            Some(net) => {
                self.set.insert(net);
                self.count += 1;
            }
            None => warn!(line = %line, "invalid CIDR in rule provider, skipped"),
        }
    }

    fn finish_insert(&mut self) {
        self.set.merge();
    }

    fn reset(&mut self) {
        self.set = CidrSet::new();
        self.count = 0;
    }

    fn count(&self) -> usize {
        self.count
    }

    fn should_resolve_ip(&self) -> bool {
        true
    }

    fn to_binary(&self) -> Option<Bytes> {
        Some(self.set.to_bytes(self.count as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use crate::metadata::Network;

    fn strategy(lines: &[&str]) -> IpCidrStrategy {
        let mut s = IpCidrStrategy::new();
        s.reset();
        for line in lines {
            s.insert(line);
        }
        s.finish_insert();
        s
    }

    fn dst(ip: &str) -> Metadata {
        Metadata::new(Network::Udp).with_dst(ip.parse().unwrap(), 53)
    }

    #[tokio::test]
    async fn test_adjacent_prefixes_merge() {
        let s = strategy(&["10.0.0.0/24", "10.0.1.0/24"]);
        assert_eq!(s.set().range_count(), 1);
        assert_eq!(s.count(), 2);

        let helper = RuleMatchHelper::empty();
        assert!(s.matches(&mut dst("10.0.1.5"), &helper).await);
        assert!(!s.matches(&mut dst("10.0.2.5"), &helper).await);
    }

    #[test]
    fn test_overlap_and_containment() {
        let s = strategy(&["10.0.0.0/8", "10.1.0.0/16", "192.168.1.1", "::1", "fe80::/10"]);
        assert_eq!(s.set().range_count(), 4);
        assert!(s.set().contains("10.200.0.1".parse().unwrap()));
        assert!(s.set().contains("192.168.1.1".parse().unwrap()));
        assert!(!s.set().contains("192.168.1.2".parse().unwrap()));
        assert!(s.set().contains("fe80::1234".parse().unwrap()));
        assert!(s.set().contains("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_full_range_does_not_overflow() {
        let s = strategy(&["0.0.0.0/1", "128.0.0.0/1", "255.255.255.255/32"]);
        assert_eq!(s.set().range_count(), 1);
        assert!(s.set().contains("255.255.255.255".parse().unwrap()));
    }

    #[test]
    fn test_malformed_line_skipped() {
        let s = strategy(&["10.0.0.0/33", "garbage", "1.1.1.0/24"]);
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn test_foreach_emits_minimal_prefixes() {
        let s = strategy(&["10.0.0.0/24", "10.0.1.0/24", "2001:db8::/48"]);
        let mut nets = Vec::new();
        s.set().foreach(|net| {
            nets.push(net.to_string());
            true
        });
        assert_eq!(nets, vec!["10.0.0.0/23", "2001:db8::/48"]);

        let mut first = Vec::new();
        s.set().foreach(|net| {
            first.push(net);
            false
        });
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_binary_round_trip() {
        let s = strategy(&["10.0.0.0/24", "172.16.0.0/12", "2001:db8::/32"]);
        let blob = s.to_binary().unwrap();
        let loaded = IpCidrStrategy::from_binary(&blob).unwrap();
        assert_eq!(loaded.set(), s.set());
        assert_eq!(loaded.count(), 3);
    }

    #[test]
    fn test_binary_rejects_garbage() {
        assert!(CidrSet::from_bytes(b"nope").is_err());
        let s = strategy(&["10.0.0.0/24"]);
        let blob = s.to_binary().unwrap();
        assert!(CidrSet::from_bytes(&blob[..blob.len() - 3]).is_err());
    }

    #[tokio::test]
    async fn test_resolves_host_when_allowed() {
        let s = strategy(&["10.0.0.0/8"]);
        let resolver = StaticResolver::new().with_host("intra.lan", "10.9.9.9".parse().unwrap());
        let helper = RuleMatchHelper::new(Some(&resolver), None);
        let mut m = Metadata::new(Network::Tcp).with_host("intra.lan");
        assert!(s.matches(&mut m, &helper).await);

        let mut m = Metadata::new(Network::Tcp).with_host("intra.lan");
        assert!(!s.matches(&mut m, &helper.without_resolve()).await);
    }
}
