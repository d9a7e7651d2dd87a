//! Rule type identifiers and rule-line splitting
//!
//! - [`RuleType`]: the kind of a rule, as written in rule lines
//! - [`RuleLine`]: one rule line split into type, payload, target and params
//! - [`parse_rule_payload`]: the splitter used for both top-level rule lines
//!   and operands of logic rules

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleType {
    Domain,
    DomainSuffix,
    DomainKeyword,
    DomainRegex,
    DomainWildcard,
    IpCidr,
    SrcIpCidr,
    IpSuffix,
    SrcIpSuffix,
    DstPort,
    SrcPort,
    InPort,
    Network,
    InType,
    InUser,
    InName,
    ProcessName,
    ProcessPath,
    ProcessNameRegex,
    ProcessPathRegex,
    Uid,
    RuleSet,
    And,
    Or,
    Not,
    SubRule,
    Match,
}

impl RuleType {
    /// Parse an upper-case rule type name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let t = match s {
            "DOMAIN" => Self::Domain,
            "DOMAIN-SUFFIX" => Self::DomainSuffix,
            "DOMAIN-KEYWORD" => Self::DomainKeyword,
            "DOMAIN-REGEX" => Self::DomainRegex,
            "DOMAIN-WILDCARD" => Self::DomainWildcard,
            "IP-CIDR" | "IP-CIDR6" => Self::IpCidr,
            "SRC-IP-CIDR" => Self::SrcIpCidr,
            "IP-SUFFIX" => Self::IpSuffix,
            "SRC-IP-SUFFIX" => Self::SrcIpSuffix,
            "DST-PORT" => Self::DstPort,
            "SRC-PORT" => Self::SrcPort,
            "IN-PORT" => Self::InPort,
            "NETWORK" => Self::Network,
            "IN-TYPE" => Self::InType,
            "IN-USER" => Self::InUser,
            "IN-NAME" => Self::InName,
            "PROCESS-NAME" => Self::ProcessName,
            "PROCESS-PATH" => Self::ProcessPath,
            "PROCESS-NAME-REGEX" => Self::ProcessNameRegex,
            "PROCESS-PATH-REGEX" => Self::ProcessPathRegex,
            "UID" => Self::Uid,
            "RULE-SET" => Self::RuleSet,
            "AND" => Self::And,
            "OR" => Self::Or,
            "NOT" => Self::Not,
            "SUB-RULE" => Self::SubRule,
            "MATCH" => Self::Match,
            _ => return None,
        };
        Some(t)
    }

    /// Canonical rule type name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "DOMAIN",
            Self::DomainSuffix => "DOMAIN-SUFFIX",
            Self::DomainKeyword => "DOMAIN-KEYWORD",
            Self::DomainRegex => "DOMAIN-REGEX",
            Self::DomainWildcard => "DOMAIN-WILDCARD",
            Self::IpCidr => "IP-CIDR",
            Self::SrcIpCidr => "SRC-IP-CIDR",
            Self::IpSuffix => "IP-SUFFIX",
            Self::SrcIpSuffix => "SRC-IP-SUFFIX",
            Self::DstPort => "DST-PORT",
            Self::SrcPort => "SRC-PORT",
            Self::InPort => "IN-PORT",
            Self::Network => "NETWORK",
            Self::InType => "IN-TYPE",
            Self::InUser => "IN-USER",
            Self::InName => "IN-NAME",
            Self::ProcessName => "PROCESS-NAME",
            Self::ProcessPath => "PROCESS-PATH",
            Self::ProcessNameRegex => "PROCESS-NAME-REGEX",
            Self::ProcessPathRegex => "PROCESS-PATH-REGEX",
            Self::Uid => "UID",
            Self::RuleSet => "RULE-SET",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
            Self::SubRule => "SUB-RULE",
            Self::Match => "MATCH",
        }
    }

    /// Whether the payload may itself contain commas
    #[must_use]
    pub const fn has_comma_payload(&self) -> bool {
        matches!(
            self,
            Self::Not
                | Self::Or
                | Self::And
                | Self::SubRule
                | Self::DomainRegex
                | Self::ProcessNameRegex
                | Self::ProcessPathRegex
        )
    }

    /// Whether this is one of the boolean combinators
    #[must_use]
    pub const fn is_logic(&self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Not | Self::SubRule)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule line split into its parts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleLine {
    /// Upper-cased rule type, empty for an empty line
    pub rule_type: String,
    pub payload: String,
    pub target: String,
    pub params: Vec<String>,
}

/// Split a comma-separated rule line
///
/// With `need_target`, the line is `TYPE,PAYLOAD,TARGET[,PARAMS...]`;
/// without it (logic operands, provider lines) it is `TYPE,PAYLOAD[,PARAMS...]`.
/// Types whose payload may contain commas keep everything between the type
/// and the target as one payload.
///
/// # Example
///
/// ```
/// use meta_router::rules::parse_rule_payload;
///
/// let line = parse_rule_payload("AND,((DOMAIN,a.com),(NETWORK,UDP)),proxy", true);
/// assert_eq!(line.rule_type, "AND");
/// assert_eq!(line.payload, "((DOMAIN,a.com),(NETWORK,UDP))");
/// assert_eq!(line.target, "proxy");
///
/// let line = parse_rule_payload("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve", true);
/// assert_eq!(line.params, vec!["no-resolve"]);
/// ```
#[must_use]
pub fn parse_rule_payload(raw: &str, need_target: bool) -> RuleLine {
    let mut items: Vec<&str> = raw.split(',').map(str::trim).collect();
    let mut line = RuleLine {
        rule_type: items[0].to_ascii_uppercase(),
        ..RuleLine::default()
    };
    if items.len() < 2 {
        return line;
    }

    let comma_payload = RuleType::parse(&line.rule_type).is_some_and(|t| t.has_comma_payload());
    if line.rule_type == "MATCH" {
        line.target = items[1].to_string();
    } else if comma_payload {
        if need_target && items.len() > 2 {
            if let Some(target) = items.pop() {
                line.target = target.to_string();
            }
        }
        line.payload = items[1..].join(",");
    } else {
        line.payload = items[1].to_string();
        if items.len() > 2 {
            if need_target {
                line.target = items[2].to_string();
                line.params = items[3..].iter().map(ToString::to_string).collect();
            } else {
                line.params = items[2..].iter().map(ToString::to_string).collect();
            }
        }
    }
    line
}

/// Whether the params contain `no-resolve`
#[must_use]
pub fn has_no_resolve(params: &[String]) -> bool {
    params.iter().any(|p| p.eq_ignore_ascii_case("no-resolve"))
}

/// Whether the params contain `src`
#[must_use]
pub fn has_src(params: &[String]) -> bool {
    params.iter().any(|p| p.eq_ignore_ascii_case("src"))
}
