//! IP rules
//!
//! Destination IP rules trigger lazy DNS resolution for host-only metadata
//! unless the `no-resolve` parameter is set; with `no-resolve`, unresolved
//! metadata simply does not match. Source IP rules never resolve.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;

use super::{Rule, RuleMatchHelper, RuleType};
use crate::error::RuleError;
use crate::metadata::{unmap, Metadata};

fn parse_net(payload: &str) -> Result<IpNet, RuleError> {
    payload
        .parse::<IpNet>()
        .or_else(|_| payload.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| RuleError::InvalidCidr(payload.to_string()))
}

/// `IP-CIDR`, `IP-CIDR6` and `SRC-IP-CIDR`
#[derive(Debug)]
pub struct IpCidrRule {
    net: IpNet,
    is_source: bool,
    no_resolve: bool,
    payload: String,
    adapter: String,
}

impl IpCidrRule {
    /// # Errors
    ///
    /// Returns `RuleError::InvalidCidr` for a malformed prefix.
    pub fn new(
        payload: &str,
        adapter: &str,
        is_source: bool,
        no_resolve: bool,
    ) -> Result<Self, RuleError> {
        Ok(Self {
            net: parse_net(payload)?.trunc(),
            is_source,
            no_resolve,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }
}

#[async_trait]
impl Rule for IpCidrRule {
    fn rule_type(&self) -> RuleType {
        if self.is_source {
            RuleType::SrcIpCidr
        } else {
            RuleType::IpCidr
        }
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> Option<String> {
        let ip = if self.is_source {
            metadata.src_ip
        } else {
            if !self.no_resolve {
                helper.resolve_ip(metadata).await;
            }
            metadata.dst_ip
        };
        ip.map(unmap)
            .is_some_and(|ip| self.net.contains(&ip))
            .then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_resolve_ip(&self) -> bool {
        !self.is_source && !self.no_resolve
    }
}

/// `IP-SUFFIX` and `SRC-IP-SUFFIX`: compares the last `prefix_len` bits
#[derive(Debug)]
pub struct IpSuffixRule {
    addr: IpAddr,
    bits: u8,
    is_source: bool,
    no_resolve: bool,
    payload: String,
    adapter: String,
}

impl IpSuffixRule {
    /// # Errors
    ///
    /// Returns `RuleError::InvalidCidr` for a malformed `ip/bits` payload.
    pub fn new(
        payload: &str,
        adapter: &str,
        is_source: bool,
        no_resolve: bool,
    ) -> Result<Self, RuleError> {
        let net = parse_net(payload)?;
        Ok(Self {
            addr: net.addr(),
            bits: net.prefix_len(),
            is_source,
            no_resolve,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }

    fn suffix_match(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(want), IpAddr::V4(got)) => {
                let mask = low_mask(u128::from(self.bits), 32);
                (u128::from(u32::from(want)) & mask) == (u128::from(u32::from(got)) & mask)
            }
            (IpAddr::V6(want), IpAddr::V6(got)) => {
                let mask = low_mask(u128::from(self.bits), 128);
                (u128::from(want) & mask) == (u128::from(got) & mask)
            }
            _ => false,
        }
    }
}

fn low_mask(bits: u128, width: u128) -> u128 {
    match bits {
        0 => 0,
        b if b >= width && width == 128 => u128::MAX,
        b => (1u128 << b.min(width)) - 1,
    }
}

#[async_trait]
impl Rule for IpSuffixRule {
    fn rule_type(&self) -> RuleType {
        if self.is_source {
            RuleType::SrcIpSuffix
        } else {
            RuleType::IpSuffix
        }
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> Option<String> {
        let ip = if self.is_source {
            metadata.src_ip
        } else {
            if !self.no_resolve {
                helper.resolve_ip(metadata).await;
            }
            metadata.dst_ip
        };
        ip.map(unmap)
            .is_some_and(|ip| self.suffix_match(ip))
            .then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_resolve_ip(&self) -> bool {
        !self.is_source && !self.no_resolve
    }
}
