//! Port, network, inbound and catch-all rules

use async_trait::async_trait;

use super::{Rule, RuleMatchHelper, RuleType};
use crate::common::IntRanges;
use crate::error::RuleError;
use crate::metadata::{InboundType, Metadata, Network};

/// Which port of the connection a [`PortRule`] looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Dst,
    Src,
    In,
}

/// `DST-PORT`, `SRC-PORT` and `IN-PORT`
#[derive(Debug)]
pub struct PortRule {
    kind: PortKind,
    ranges: IntRanges<u16>,
    payload: String,
    adapter: String,
}

impl PortRule {
    /// Parse a port list such as `80/443/10000-20000`
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPort` for an empty or malformed list.
    pub fn new(kind: PortKind, payload: &str, adapter: &str) -> Result<Self, RuleError> {
        let ranges = IntRanges::parse(payload)
            .map_err(|_| RuleError::InvalidPort(payload.to_string()))?;
        if ranges.is_empty() {
            return Err(RuleError::InvalidPort(payload.to_string()));
        }
        Ok(Self {
            kind,
            ranges,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }
}

#[async_trait]
impl Rule for PortRule {
    fn rule_type(&self) -> RuleType {
        match self.kind {
            PortKind::Dst => RuleType::DstPort,
            PortKind::Src => RuleType::SrcPort,
            PortKind::In => RuleType::InPort,
        }
    }

    async fn matches(&self, metadata: &mut Metadata, _: &RuleMatchHelper<'_>) -> Option<String> {
        let port = match self.kind {
            PortKind::Dst => metadata.dst_port,
            PortKind::Src => metadata.src_port,
            PortKind::In => metadata.inbound_port,
        };
        self.ranges.check(port).then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}

/// `NETWORK,tcp` / `NETWORK,udp`
#[derive(Debug)]
pub struct NetworkRule {
    network: Network,
    payload: String,
    adapter: String,
}

impl NetworkRule {
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPayload` for anything but tcp/udp.
    pub fn new(payload: &str, adapter: &str) -> Result<Self, RuleError> {
        let network = Network::parse(payload)
            .ok_or_else(|| RuleError::invalid_payload("NETWORK", payload))?;
        Ok(Self {
            network,
            payload: network.as_str().to_ascii_uppercase(),
            adapter: adapter.to_string(),
        })
    }
}

#[async_trait]
impl Rule for NetworkRule {
    fn rule_type(&self) -> RuleType {
        RuleType::Network
    }

    async fn matches(&self, metadata: &mut Metadata, _: &RuleMatchHelper<'_>) -> Option<String> {
        (metadata.network == self.network).then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}

/// `IN-TYPE,socks5/http`
#[derive(Debug)]
pub struct InTypeRule {
    types: Vec<InboundType>,
    payload: String,
    adapter: String,
}

impl InTypeRule {
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPayload` for unknown inbound types.
    pub fn new(payload: &str, adapter: &str) -> Result<Self, RuleError> {
        let types = payload
            .split('/')
            .map(|t| {
                InboundType::parse(t.trim())
                    .ok_or_else(|| RuleError::invalid_payload("IN-TYPE", payload))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            types,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }
}

#[async_trait]
impl Rule for InTypeRule {
    fn rule_type(&self) -> RuleType {
        RuleType::InType
    }

    async fn matches(&self, metadata: &mut Metadata, _: &RuleMatchHelper<'_>) -> Option<String> {
        self.types
            .contains(&metadata.inbound_type)
            .then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}

/// Which inbound string an [`InboundNameRule`] compares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundField {
    User,
    Name,
}

/// `IN-USER,alice/bob` and `IN-NAME,socks-in`
#[derive(Debug)]
pub struct InboundNameRule {
    field: InboundField,
    names: Vec<String>,
    payload: String,
    adapter: String,
}

impl InboundNameRule {
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPayload` for an empty list.
    pub fn new(field: InboundField, payload: &str, adapter: &str) -> Result<Self, RuleError> {
        let names: Vec<String> = payload
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if names.is_empty() {
            let ty = match field {
                InboundField::User => "IN-USER",
                InboundField::Name => "IN-NAME",
            };
            return Err(RuleError::invalid_payload(ty, payload));
        }
        Ok(Self {
            field,
            names,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }
}

#[async_trait]
impl Rule for InboundNameRule {
    fn rule_type(&self) -> RuleType {
        match self.field {
            InboundField::User => RuleType::InUser,
            InboundField::Name => RuleType::InName,
        }
    }

    async fn matches(&self, metadata: &mut Metadata, _: &RuleMatchHelper<'_>) -> Option<String> {
        let value = match self.field {
            InboundField::User => &metadata.inbound_user,
            InboundField::Name => &metadata.inbound_name,
        };
        self.names
            .iter()
            .any(|n| n == value)
            .then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}

/// `MATCH`: matches everything
#[derive(Debug)]
pub struct MatchAll {
    adapter: String,
}

impl MatchAll {
    #[must_use]
    pub fn new(adapter: &str) -> Self {
        Self {
            adapter: adapter.to_string(),
        }
    }
}

#[async_trait]
impl Rule for MatchAll {
    fn rule_type(&self) -> RuleType {
        RuleType::Match
    }

    async fn matches(&self, _: &mut Metadata, _: &RuleMatchHelper<'_>) -> Option<String> {
        Some(self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dst_port_ranges() {
        let rule = PortRule::new(PortKind::Dst, "53/10001-65535", "proxy").unwrap();
        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Udp);
        m.dst_port = 53;
        assert_eq!(rule.matches(&mut m, &helper).await.as_deref(), Some("proxy"));
        m.dst_port = 10000;
        assert!(rule.matches(&mut m, &helper).await.is_none());
    }

    #[tokio::test]
    async fn test_src_and_in_port() {
        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Tcp);
        m.src_port = 5000;
        m.inbound_port = 7890;
        let src = PortRule::new(PortKind::Src, "5000", "a").unwrap();
        let inp = PortRule::new(PortKind::In, "7890", "b").unwrap();
        assert!(src.matches(&mut m, &helper).await.is_some());
        assert!(inp.matches(&mut m, &helper).await.is_some());
    }

    #[test]
    fn test_port_rule_rejects_bad_payload() {
        assert!(PortRule::new(PortKind::Dst, "http", "x").is_err());
        assert!(PortRule::new(PortKind::Dst, "", "x").is_err());
    }

    #[tokio::test]
    async fn test_network_rule() {
        let rule = NetworkRule::new("tcp", "proxy").unwrap();
        assert_eq!(rule.payload(), "TCP");
        let helper = RuleMatchHelper::empty();
        assert!(rule.matches(&mut Metadata::new(Network::Tcp), &helper).await.is_some());
        assert!(rule.matches(&mut Metadata::new(Network::Udp), &helper).await.is_none());
        assert!(NetworkRule::new("icmp", "x").is_err());
    }

    #[tokio::test]
    async fn test_in_type_rule() {
        let rule = InTypeRule::new("socks5/http", "proxy").unwrap();
        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Tcp);
        m.inbound_type = InboundType::Http;
        assert!(rule.matches(&mut m, &helper).await.is_some());
        m.inbound_type = InboundType::Tun;
        assert!(rule.matches(&mut m, &helper).await.is_none());
    }

    #[tokio::test]
    async fn test_in_user_and_name() {
        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Tcp);
        m.inbound_user = "alice".into();
        m.inbound_name = "socks-in".into();
        let user = InboundNameRule::new(InboundField::User, "bob/alice", "p").unwrap();
        let name = InboundNameRule::new(InboundField::Name, "http-in", "p").unwrap();
        assert!(user.matches(&mut m, &helper).await.is_some());
        assert!(name.matches(&mut m, &helper).await.is_none());
    }

    #[tokio::test]
    async fn test_match_all() {
        let rule = MatchAll::new("DIRECT");
        let helper = RuleMatchHelper::empty();
        assert_eq!(
            rule.matches(&mut Metadata::default(), &helper).await.as_deref(),
            Some("DIRECT")
        );
    }
}
