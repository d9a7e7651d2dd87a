//! Rule line parsing
//!
//! [`RuleParser`] turns `TYPE,PAYLOAD,TARGET[,PARAMS]` lines into rule objects.
//! The parser optionally carries the sub-rule graph (for `SUB-RULE`) and the
//! rule provider registry (for `RULE-SET`). Without them those rule types are
//! rejected, which is what rule providers rely on to keep classical rule sets
//! free of cycles.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use super::common::{InTypeRule, InboundField, InboundNameRule, MatchAll, NetworkRule, PortKind, PortRule};
use super::domain::DomainRule;
use super::ip::{IpCidrRule, IpSuffixRule};
use super::logic::{Logic, SubRuleGraph, SubRules};
use super::process::{ProcessRule, UidRule};
use super::ruleset::RuleSet;
use super::types::{has_no_resolve, has_src, parse_rule_payload};
use super::{Rule, RuleType};
use crate::error::RuleError;
use crate::provider::RuleProviderRegistry;

/// Builds rules from rule lines
#[derive(Debug, Clone, Default)]
pub struct RuleParser {
    sub_rules: Option<Weak<SubRuleGraph>>,
    providers: Option<Arc<RuleProviderRegistry>>,
}

impl RuleParser {
    /// Parser for leaf and logic rules only
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `SUB-RULE`, resolved against `graph` at match time
    #[must_use]
    pub fn with_sub_rules(mut self, graph: &Arc<SubRuleGraph>) -> Self {
        self.sub_rules = Some(Arc::downgrade(graph));
        self
    }

    /// Allow `RULE-SET`, resolved against `providers` at match time
    #[must_use]
    pub fn with_providers(mut self, providers: Arc<RuleProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Parse a full rule line with a target
    ///
    /// # Errors
    ///
    /// Returns a `RuleError` if the line has no target or the rule is invalid.
    pub fn parse_line(&self, line: &str) -> Result<Arc<dyn Rule>, RuleError> {
        let parsed = parse_rule_payload(line, true);
        if parsed.rule_type.is_empty() || parsed.target.is_empty() {
            return Err(RuleError::InvalidFormat(line.to_string()));
        }
        self.parse(&parsed.rule_type, &parsed.payload, &parsed.target, &parsed.params)
    }

    /// Parse an already split rule
    ///
    /// # Errors
    ///
    /// Returns a `RuleError` for unknown types or invalid payloads.
    pub fn parse(
        &self,
        rule_type: &str,
        payload: &str,
        target: &str,
        params: &[String],
    ) -> Result<Arc<dyn Rule>, RuleError> {
        let ty = RuleType::parse(rule_type)
            .ok_or_else(|| RuleError::UnsupportedType(rule_type.to_string()))?;
        let no_resolve = has_no_resolve(params);

        let rule: Arc<dyn Rule> = match ty {
            RuleType::Domain
            | RuleType::DomainSuffix
            | RuleType::DomainKeyword
            | RuleType::DomainRegex
            | RuleType::DomainWildcard => Arc::new(DomainRule::new(ty, payload, target)?),
            RuleType::IpCidr => Arc::new(IpCidrRule::new(payload, target, false, no_resolve)?),
            RuleType::SrcIpCidr => Arc::new(IpCidrRule::new(payload, target, true, true)?),
            RuleType::IpSuffix => Arc::new(IpSuffixRule::new(payload, target, false, no_resolve)?),
            RuleType::SrcIpSuffix => Arc::new(IpSuffixRule::new(payload, target, true, true)?),
            RuleType::DstPort => Arc::new(PortRule::new(PortKind::Dst, payload, target)?),
            RuleType::SrcPort => Arc::new(PortRule::new(PortKind::Src, payload, target)?),
            RuleType::InPort => Arc::new(PortRule::new(PortKind::In, payload, target)?),
            RuleType::Network => Arc::new(NetworkRule::new(payload, target)?),
            RuleType::InType => Arc::new(InTypeRule::new(payload, target)?),
            RuleType::InUser => Arc::new(InboundNameRule::new(InboundField::User, payload, target)?),
            RuleType::InName => Arc::new(InboundNameRule::new(InboundField::Name, payload, target)?),
            RuleType::ProcessName
            | RuleType::ProcessPath
            | RuleType::ProcessNameRegex
            | RuleType::ProcessPathRegex => Arc::new(ProcessRule::new(ty, payload, target)?),
            RuleType::Uid => Arc::new(UidRule::new(payload, target)?),
            RuleType::RuleSet => {
                let providers = self
                    .providers
                    .as_ref()
                    .ok_or_else(|| RuleError::ProviderNotFound(payload.to_string()))?;
                if !providers.contains(payload) {
                    return Err(RuleError::ProviderNotFound(payload.to_string()));
                }
                Arc::new(RuleSet::new(
                    payload,
                    target,
                    Arc::clone(providers),
                    no_resolve,
                    has_src(params),
                ))
            }
            RuleType::And => Arc::new(Logic::new_and(payload, target, self)?),
            RuleType::Or => Arc::new(Logic::new_or(payload, target, self)?),
            RuleType::Not => Arc::new(Logic::new_not(payload, target, self)?),
            RuleType::SubRule => {
                let graph = self.sub_rules.clone().ok_or(RuleError::SubRulesUnavailable)?;
                Arc::new(Logic::new_sub_rule(payload, target, graph, self)?)
            }
            RuleType::Match => Arc::new(MatchAll::new(target)),
        };
        Ok(rule)
    }

    /// Parse every line, failing on the first bad one
    ///
    /// # Errors
    ///
    /// Returns the first `RuleError`, annotated with the line index.
    pub fn parse_lines<S: AsRef<str>>(&self, lines: &[S]) -> Result<Vec<Arc<dyn Rule>>, RuleError> {
        lines
            .iter()
            .enumerate()
            .map(|(idx, line)| {
                self.parse_line(line.as_ref()).map_err(|e| {
                    RuleError::InvalidFormat(format!("rule {idx} [{}]: {e}", line.as_ref()))
                })
            })
            .collect()
    }
}

/// Check that every `SUB-RULE` target exists and that lists do not loop
///
/// # Errors
///
/// Returns `RuleError::SubRuleNotFound` or `RuleError::SubRuleLoop`.
pub fn verify_sub_rules(sub_rules: &SubRules, rules: &[Arc<dyn Rule>]) -> Result<(), RuleError> {
    let mut targets = edges(rules);
    for list in sub_rules.values() {
        targets.extend(edges(list));
    }
    if let Some(missing) = targets.into_iter().find(|t| !sub_rules.contains_key(t)) {
        return Err(RuleError::SubRuleNotFound(missing));
    }

    let graph: HashMap<&str, Vec<String>> = sub_rules
        .iter()
        .map(|(name, list)| (name.as_str(), edges(list)))
        .collect();

    let mut done: HashSet<&str> = HashSet::new();
    for name in graph.keys().copied() {
        let mut path = Vec::new();
        visit(name, &graph, &mut path, &mut done)?;
    }
    Ok(())
}

fn edges(list: &[Arc<dyn Rule>]) -> Vec<String> {
    list.iter()
        .filter(|r| r.rule_type() == RuleType::SubRule)
        .map(|r| r.adapter().to_string())
        .collect()
}

fn visit<'a>(
    name: &'a str,
    graph: &'a HashMap<&'a str, Vec<String>>,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<(), RuleError> {
    if done.contains(name) {
        return Ok(());
    }
    if path.contains(&name) {
        path.push(name);
        return Err(RuleError::SubRuleLoop(path.join(" -> ")));
    }
    path.push(name);
    if let Some(next) = graph.get(name) {
        for target in next {
            visit(target.as_str(), graph, path, done)?;
        }
    }
    path.pop();
    done.insert(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Metadata, Network};
    use crate::rules::RuleMatchHelper;

    #[test]
    fn test_parse_line_types() {
        let parser = RuleParser::new();
        let rule = parser.parse_line("DOMAIN-SUFFIX,google.com,proxy").unwrap();
        assert_eq!(rule.rule_type(), RuleType::DomainSuffix);
        assert_eq!(rule.adapter(), "proxy");
        assert_eq!(rule.payload(), "google.com");

        let rule = parser.parse_line("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve").unwrap();
        assert!(!rule.should_resolve_ip());
        let rule = parser.parse_line("IP-CIDR6,2001:db8::/32,DIRECT").unwrap();
        assert!(rule.should_resolve_ip());

        let rule = parser.parse_line("MATCH,DIRECT").unwrap();
        assert_eq!(rule.rule_type(), RuleType::Match);
    }

    #[test]
    fn test_parse_line_errors() {
        let parser = RuleParser::new();
        assert!(matches!(
            parser.parse_line("GEOSITE,cn,DIRECT"),
            Err(RuleError::UnsupportedType(_))
        ));
        assert!(matches!(
            parser.parse_line("DOMAIN,a.com"),
            Err(RuleError::InvalidFormat(_))
        ));
        assert!(matches!(
            parser.parse_line("SUB-RULE,(NETWORK,TCP),sub"),
            Err(RuleError::SubRulesUnavailable)
        ));
        assert!(matches!(
            parser.parse_line("RULE-SET,ads,REJECT"),
            Err(RuleError::ProviderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sub_rule_walks_named_list() {
        let graph = Arc::new(SubRuleGraph::new());
        let parser = RuleParser::new().with_sub_rules(&graph);

        let mut subs = SubRules::new();
        subs.insert(
            "tcp-rules".into(),
            parser
                .parse_lines(&["DST-PORT,443,https-proxy", "MATCH,tcp-default"])
                .unwrap(),
        );
        let main = parser
            .parse_lines(&["SUB-RULE,(NETWORK,TCP),tcp-rules", "MATCH,DIRECT"])
            .unwrap();
        verify_sub_rules(&subs, &main).unwrap();
        graph.set(subs).unwrap();

        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Tcp).with_host("a.com");
        m.dst_port = 443;
        assert_eq!(main[0].matches(&mut m, &helper).await.as_deref(), Some("https-proxy"));
        m.dst_port = 80;
        assert_eq!(main[0].matches(&mut m, &helper).await.as_deref(), Some("tcp-default"));

        let mut udp = Metadata::new(Network::Udp);
        assert!(main[0].matches(&mut udp, &helper).await.is_none());
    }

    #[test]
    fn test_verify_missing_sub_rule() {
        let graph = Arc::new(SubRuleGraph::new());
        let parser = RuleParser::new().with_sub_rules(&graph);
        let main = parser.parse_lines(&["SUB-RULE,(NETWORK,TCP),nope"]).unwrap();
        assert!(matches!(
            verify_sub_rules(&SubRules::new(), &main),
            Err(RuleError::SubRuleNotFound(ref n)) if n == "nope"
        ));
    }

    #[test]
    fn test_verify_sub_rule_loop() {
        let graph = Arc::new(SubRuleGraph::new());
        let parser = RuleParser::new().with_sub_rules(&graph);
        let mut subs = SubRules::new();
        subs.insert("a".into(), parser.parse_lines(&["SUB-RULE,(NETWORK,TCP),b"]).unwrap());
        subs.insert("b".into(), parser.parse_lines(&["SUB-RULE,(NETWORK,UDP),a"]).unwrap());
        assert!(matches!(verify_sub_rules(&subs, &[]), Err(RuleError::SubRuleLoop(_))));
    }
}
