//! Rule engine integration tests
//!
//! Logic combinators, rule sets over every provider behavior and named
//! sub-rule lists, all matched through [`RuleEngine`].

use std::sync::Arc;

use meta_router::dns::Resolver;
use meta_router::provider::{CidrSet, RuleBehavior, RuleProvider, RuleProviderRegistry};
use meta_router::rules::{RuleEngine, RuleSnapshot, RuleType};
use meta_router::{Metadata, Network, RuleError};

use super::support::CountingResolver;

fn accept_all(_: &str, _: &Metadata) -> bool {
    true
}

fn engine(rules: &[&str]) -> RuleEngine {
    RuleEngine::new(RuleSnapshot::builder().rules(rules).build().unwrap())
}

fn engine_with(rules: &[&str], providers: Arc<RuleProviderRegistry>) -> RuleEngine {
    RuleEngine::new(
        RuleSnapshot::builder()
            .rules(rules)
            .providers(providers)
            .build()
            .unwrap(),
    )
}

fn provider(name: &str, behavior: RuleBehavior, text: &str) -> Arc<RuleProvider> {
    let provider = RuleProvider::new(name, behavior);
    provider.update_from_text(text);
    Arc::new(provider)
}

#[tokio::test]
async fn test_and_short_circuits_before_resolving() {
    let counting = CountingResolver::new("intra.example", "10.1.2.3");
    let resolver: &dyn Resolver = &counting;

    let engine = engine(&["AND,((NETWORK,UDP),(IP-CIDR,10.0.0.0/8)),REJECT", "MATCH,DIRECT"]);
    let mut m = Metadata::new(Network::Tcp).with_host("intra.example");
    m.dst_port = 443;
    let outcome = engine.match_metadata(&mut m, Some(resolver), None, &accept_all).await;
    assert_eq!(outcome.adapter, "DIRECT");
    assert_eq!(counting.calls(), 0);
    assert!(m.dst_ip.is_none());
}

#[tokio::test]
async fn test_and_resolves_once_when_ip_operand_comes_first() {
    let counting = CountingResolver::new("intra.example", "10.1.2.3");
    let resolver: &dyn Resolver = &counting;

    let engine = engine(&[
        "AND,((IP-CIDR,10.0.0.0/8),(NETWORK,UDP)),REJECT",
        "IP-CIDR,10.0.0.0/8,DIRECT",
        "MATCH,GLOBAL",
    ]);
    let mut m = Metadata::new(Network::Tcp).with_host("intra.example");
    m.dst_port = 443;
    let outcome = engine.match_metadata(&mut m, Some(resolver), None, &accept_all).await;
    assert_eq!(outcome.adapter, "DIRECT");
    assert_eq!(outcome.rule.unwrap().rule_type(), RuleType::IpCidr);
    assert_eq!(counting.calls(), 1);
    assert_eq!(m.dst_ip, Some("10.1.2.3".parse().unwrap()));

    let mut m = Metadata::new(Network::Udp).with_host("intra.example");
    let outcome = engine.match_metadata(&mut m, Some(resolver), None, &accept_all).await;
    assert_eq!(outcome.adapter, "REJECT");
    assert_eq!(counting.calls(), 2);
}

#[tokio::test]
async fn test_or_and_not() {
    let engine = engine(&[
        "NOT,((DST-PORT,80-443)),REJECT",
        "OR,((DOMAIN,a.example),(DOMAIN-SUFFIX,b.example)),proxy",
        "MATCH,DIRECT",
    ]);

    let mut m = Metadata::new(Network::Tcp).with_host("x.b.example");
    m.dst_port = 443;
    let outcome = engine.match_metadata(&mut m, None, None, &accept_all).await;
    assert_eq!(outcome.adapter, "proxy");
    assert_eq!(outcome.rule.unwrap().rule_type(), RuleType::Or);

    m.dst_port = 8080;
    let outcome = engine.match_metadata(&mut m, None, None, &accept_all).await;
    assert_eq!(outcome.adapter, "REJECT");

    let mut m = Metadata::new(Network::Tcp).with_host("c.example");
    m.dst_port = 80;
    let outcome = engine.match_metadata(&mut m, None, None, &accept_all).await;
    assert!(outcome.rule.unwrap().rule_type() == RuleType::Match);
}

#[tokio::test]
async fn test_nested_logic_line() {
    let engine = engine(&[
        "AND,((DOMAIN,baidu.com),(NETWORK,TCP),(NOT,((DST-PORT,80)))),DIRECT",
        "MATCH,REJECT",
    ]);
    let mut m = Metadata::new(Network::Tcp).with_host("baidu.com");
    m.dst_port = 443;
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept_all).await.adapter, "DIRECT");
    m.dst_port = 80;
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept_all).await.adapter, "REJECT");
}

#[test]
fn test_malformed_logic_line_fails_snapshot() {
    let err = RuleSnapshot::builder()
        .rules(&["AND,(DOMAIN,baidu.com),(NETWORK,TCP)),DIRECT"])
        .build()
        .unwrap_err();
    assert!(matches!(err, RuleError::InvalidFormat(_) | RuleError::LogicFormat(_)));
}

#[tokio::test]
async fn test_rule_set_over_each_behavior() {
    let registry = Arc::new(RuleProviderRegistry::new());
    registry.insert(provider(
        "corp",
        RuleBehavior::Classical,
        "# corp services\nDOMAIN-SUFFIX,corp.example\nAND,((NETWORK,UDP),(DST-PORT,500))\n",
    ));
    registry.insert(provider("lan", RuleBehavior::IpCidr, "10.0.0.0/8\n192.168.0.0/16\n"));
    registry.insert(provider("ads", RuleBehavior::Domain, "+.ads.example\ntracker.example\n"));

    let engine = engine_with(
        &[
            "RULE-SET,ads,REJECT",
            "RULE-SET,corp,corp-vpn",
            "RULE-SET,lan,DIRECT,no-resolve",
            "MATCH,proxy",
        ],
        registry,
    );

    let cases = [
        (Metadata::new(Network::Tcp).with_host("x.ads.example"), "REJECT"),
        (Metadata::new(Network::Tcp).with_host("tracker.example"), "REJECT"),
        (Metadata::new(Network::Tcp).with_host("sub.tracker.example"), "proxy"),
        (Metadata::new(Network::Tcp).with_host("git.corp.example"), "corp-vpn"),
        (Metadata::new(Network::Udp).with_dst("203.0.113.1".parse().unwrap(), 500), "corp-vpn"),
        (Metadata::new(Network::Tcp).with_dst("192.168.1.1".parse().unwrap(), 22), "DIRECT"),
        (Metadata::new(Network::Tcp).with_host("lan.example"), "proxy"),
    ];
    for (mut m, expected) in cases {
        let outcome = engine.match_metadata(&mut m, None, None, &accept_all).await;
        assert_eq!(outcome.adapter, expected, "metadata {m}");
    }
}

#[tokio::test]
async fn test_rule_set_refresh_is_seen_by_engine() {
    let registry = Arc::new(RuleProviderRegistry::new());
    let ads = provider("ads", RuleBehavior::Domain, "+.ads.example\n");
    registry.insert(Arc::clone(&ads));
    let engine = engine_with(&["RULE-SET,ads,REJECT", "MATCH,DIRECT"], registry);

    let mut m = Metadata::new(Network::Tcp).with_host("new.tracker.example");
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept_all).await.adapter, "DIRECT");

    assert_eq!(ads.update_from_text("+.ads.example\n+.tracker.example\n"), 2);
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept_all).await.adapter, "REJECT");
}

#[test]
fn test_cidr_set_merges_overlaps() {
    let mut set = CidrSet::new();
    for net in ["10.0.0.0/9", "10.128.0.0/9", "10.1.0.0/16", "192.168.0.0/24", "192.168.1.0/24"] {
        set.insert(net.parse().unwrap());
    }
    set.insert("2001:db8::/32".parse().unwrap());
    set.merge();
    assert_eq!(set.range_count(), 3);
    assert!(set.contains("10.255.255.255".parse().unwrap()));
    assert!(set.contains("192.168.1.200".parse().unwrap()));
    assert!(!set.contains("192.168.2.1".parse().unwrap()));
    assert!(set.contains("::ffff:10.0.0.1".parse().unwrap()));
}

#[tokio::test]
async fn test_sub_rule_dispatch() {
    let snapshot = RuleSnapshot::builder()
        .rules(&[
            "SUB-RULE,(NETWORK,UDP),udp-rules",
            "DOMAIN-SUFFIX,example.com,tcp-proxy",
            "MATCH,DIRECT",
        ])
        .sub_rule("udp-rules", &["DST-PORT,53,dns-out", "SUB-RULE,(DST-PORT,443),quic"])
        .sub_rule("quic", &["DOMAIN-SUFFIX,example.com,quic-proxy"])
        .build()
        .unwrap();
    let engine = RuleEngine::new(snapshot);

    let mut m = Metadata::new(Network::Udp).with_host("www.example.com");
    m.dst_port = 53;
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept_all).await.adapter, "dns-out");

    m.dst_port = 443;
    let outcome = engine.match_metadata(&mut m, None, None, &accept_all).await;
    assert_eq!(outcome.adapter, "quic-proxy");
    assert_eq!(outcome.rule.unwrap().rule_type(), RuleType::SubRule);

    // No sub-rule matches: the top-level list continues.
    m.dst_port = 8443;
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept_all).await.adapter, "tcp-proxy");

    let mut m = Metadata::new(Network::Tcp).with_host("www.example.com");
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept_all).await.adapter, "tcp-proxy");
}

#[test]
fn test_sub_rule_loop_is_rejected() {
    let err = RuleSnapshot::builder()
        .rules(&["SUB-RULE,(NETWORK,TCP),a", "MATCH,DIRECT"])
        .sub_rule("a", &["SUB-RULE,(DST-PORT,80),b"])
        .sub_rule("b", &["SUB-RULE,(DST-PORT,80),a"])
        .build()
        .unwrap_err();
    assert!(matches!(err, RuleError::SubRuleLoop(_)));
}

#[tokio::test]
async fn test_rejected_adapter_falls_through() {
    let engine = engine(&["DOMAIN,a.example,udp-less", "MATCH,DIRECT"]);
    let accept = |adapter: &str, m: &Metadata| !(adapter == "udp-less" && m.network == Network::Udp);

    let mut m = Metadata::new(Network::Udp).with_host("a.example");
    let outcome = engine.match_metadata(&mut m, None, None, &accept).await;
    assert_eq!(outcome.adapter, "DIRECT");

    let mut m = Metadata::new(Network::Tcp).with_host("a.example");
    assert_eq!(engine.match_metadata(&mut m, None, None, &accept).await.adapter, "udp-less");
}
