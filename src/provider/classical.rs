//! `classical` rule provider strategy
//!
//! Holds rule lines without targets (`DOMAIN-SUFFIX,example.com`,
//! `AND,((NETWORK,UDP),(DST-PORT,443))`) in insertion order. The set matches
//! when any rule matches; [`ClassicalStrategy::first_match`] reports which.
//!
//! `RULE-SET` and `SUB-RULE` lines are not accepted, so providers cannot
//! reference each other.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{RuleBehavior, RuleStrategy};
use crate::metadata::Metadata;
use crate::rules::{parse_rule_payload, Rule, RuleMatchHelper, RuleParser, RuleType};

/// Ordered rule list, first match wins
#[derive(Debug, Default)]
pub struct ClassicalStrategy {
    rules: Vec<Arc<dyn Rule>>,
    parser: RuleParser,
    should_resolve_ip: bool,
    should_find_process: bool,
}

impl ClassicalStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already built rule
    pub fn push_rule(&mut self, rule: Arc<dyn Rule>) {
        self.rules.push(rule);
    }

    /// First rule, in insertion order, that matches
    pub async fn first_match(
        &self,
        metadata: &mut Metadata,
        helper: &RuleMatchHelper<'_>,
    ) -> Option<Arc<dyn Rule>> {
        for rule in &self.rules {
            if rule.matches(metadata, helper).await.is_some() {
                return Some(Arc::clone(rule));
            }
        }
        None
    }

    /// Rules in insertion order
    #[must_use]
    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }
}

#[async_trait]
impl RuleStrategy for ClassicalStrategy {
    fn behavior(&self) -> RuleBehavior {
        RuleBehavior::Classical
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> bool {
        self.first_match(metadata, helper).await.is_some()
    }

    fn insert(&mut self, line: &str) {
        let parsed = parse_rule_payload(line, false);
        if matches!(
            RuleType::parse(&parsed.rule_type),
            Some(RuleType::RuleSet | RuleType::SubRule)
        ) {
            warn!(line = %line, "rule type not allowed in a rule provider, skipped");
            return;
        }
        match self
            .parser
            .parse(&parsed.rule_type, &parsed.payload, "", &parsed.params)
        {
            Ok(rule) => self.rules.push(rule),
            Err(e) => warn!(line = %line, error = %e, "invalid rule in rule provider, skipped"),
        }
    }

    fn finish_insert(&mut self) {
        self.should_resolve_ip = self.rules.iter().any(|r| r.should_resolve_ip());
        self.should_find_process = self.rules.iter().any(|r| r.should_find_process());
    }

    fn reset(&mut self) {
        self.rules.clear();
        self.should_resolve_ip = false;
        self.should_find_process = false;
    }

    fn count(&self) -> usize {
        self.rules.len()
    }

    fn should_resolve_ip(&self) -> bool {
        self.should_resolve_ip
    }

    fn should_find_process(&self) -> bool {
        self.should_find_process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;

    fn strategy(lines: &[&str]) -> ClassicalStrategy {
        let mut s = ClassicalStrategy::new();
        s.reset();
        for line in lines {
            s.insert(line);
        }
        s.finish_insert();
        s
    }

    #[tokio::test]
    async fn test_first_match_in_insertion_order() {
        let s = strategy(&[
            "DOMAIN-KEYWORD,google",
            "DST-PORT,8080",
            "DOMAIN-SUFFIX,google.com",
        ]);
        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Tcp).with_host("www.google.com");
        m.dst_port = 443;
        let hit = s.first_match(&mut m, &helper).await.unwrap();
        assert_eq!(hit.rule_type(), RuleType::DomainKeyword);
        assert_eq!(hit.payload(), "google");
        assert_eq!(hit.adapter(), "");
    }

    #[test]
    fn test_bad_lines_skipped() {
        let s = strategy(&[
            "DOMAIN,a.com",
            "IP-CIDR,not-an-ip",
            "RULE-SET,other",
            "SUB-RULE,(NETWORK,TCP)",
            "GEOIP,CN",
            "AND,((NETWORK,UDP),(DST-PORT,443))",
        ]);
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn test_side_effect_flags() {
        let s = strategy(&["DOMAIN,a.com"]);
        assert!(!s.should_resolve_ip());
        let s = strategy(&["DOMAIN,a.com", "IP-CIDR,10.0.0.0/8"]);
        assert!(s.should_resolve_ip());
        let s = strategy(&["IP-CIDR,10.0.0.0/8,no-resolve", "PROCESS-NAME,curl"]);
        assert!(!s.should_resolve_ip());
        assert!(s.should_find_process());
    }

    #[tokio::test]
    async fn test_reset_clears() {
        let mut s = strategy(&["NETWORK,udp"]);
        let helper = RuleMatchHelper::empty();
        assert!(s.matches(&mut Metadata::new(Network::Udp), &helper).await);
        s.reset();
        s.finish_insert();
        assert_eq!(s.count(), 0);
        assert!(!s.matches(&mut Metadata::new(Network::Udp), &helper).await);
    }
}
