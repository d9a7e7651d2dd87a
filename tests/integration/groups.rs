//! Proxy group integration tests

use std::sync::Arc;
use std::time::Duration;

use meta_router::adapter::Proxy;
use meta_router::group::{new_group, GroupBase, GroupOptions, UrlTest};
use meta_router::provider::healthcheck::HealthCheckOptions;
use meta_router::provider::{CompatibleProvider, HealthCheck, ProxyProvider};
use meta_router::{GroupError, GroupKind, Metadata, Network, ProxyGroup};

use super::support::MockAdapter;

const URL: &str = "https://www.gstatic.com/generate_204";

fn members(names: &[&str]) -> Vec<Arc<Proxy>> {
    names.iter().map(|n| MockAdapter::proxy(n)).collect()
}

fn providers(group: &str, proxies: Vec<Arc<Proxy>>) -> Vec<Arc<dyn ProxyProvider>> {
    vec![Arc::new(
        CompatibleProvider::new(group, proxies, HealthCheckOptions::default()).unwrap(),
    )]
}

fn group(kind: GroupKind, options: GroupOptions, proxies: Vec<Arc<Proxy>>) -> Arc<dyn ProxyGroup> {
    let name = options.name.clone();
    new_group(kind, options, providers(&name, proxies), 0, "").unwrap().0
}

fn names(group: &dyn ProxyGroup) -> Vec<String> {
    group.all().iter().map(|p| p.name().to_string()).collect()
}

#[test]
fn test_selector_rejects_unknown_member() {
    let selector = group(GroupKind::Selector, GroupOptions::new("select"), members(&["a", "b"]));
    assert_eq!(selector.now(), "a");

    let err = selector.set("ghost").unwrap_err();
    assert!(matches!(err, GroupError::ProxyNotExist(_)));
    assert_eq!(err.to_string(), "proxy not exist: ghost");
    assert_eq!(selector.now(), "a");

    selector.set("b").unwrap();
    assert_eq!(selector.now(), "b");
}

#[test]
fn test_filters_select_members() {
    let mut options = GroupOptions::new("hk");
    options.filter = "^hk".to_string();
    options.exclude_filter = "2$".to_string();
    let hk = group(GroupKind::Selector, options, members(&["hk-1", "us-1", "hk-2", "hk-3"]));
    assert_eq!(names(hk.as_ref()), vec!["hk-1", "hk-3"]);
}

#[test]
fn test_fallback_skips_dead_members() {
    let proxies = members(&["a", "b", "c"]);
    let fallback = group(GroupKind::Fallback, GroupOptions::new("auto"), proxies.clone());
    assert_eq!(fallback.now(), "a");

    proxies[0].record(URL, None);
    assert_eq!(fallback.now(), "b");

    fallback.set("c").unwrap();
    assert_eq!(fallback.now(), "c");

    proxies[2].record(URL, None);
    assert_eq!(fallback.now(), "b");

    proxies[0].record(URL, Some(80));
    assert_eq!(fallback.now(), "a");
}

#[test]
fn test_url_test_prefers_fastest_within_tolerance() {
    let proxies = members(&["a", "b", "c"]);
    proxies[0].record(URL, Some(300));
    proxies[1].record(URL, Some(100));
    proxies[2].record(URL, Some(120));

    let base = GroupBase::new(GroupOptions::new("fast"), providers("fast", proxies.clone())).unwrap();
    let url_test = UrlTest::new(base, 50);
    assert_eq!(url_test.now(), "b");

    // Slower but within tolerance of the new fastest: keep the current pick.
    proxies[1].record(URL, Some(140));
    url_test.reset();
    assert_eq!(url_test.now(), "b");

    proxies[1].record(URL, None);
    url_test.reset();
    assert_eq!(url_test.now(), "c");
}

#[test]
fn test_group_unwraps_to_member() {
    let proxies = members(&["a", "b"]);
    let (select, adapter) = new_group(
        GroupKind::Selector,
        GroupOptions::new("select"),
        providers("select", proxies),
        0,
        "",
    )
    .unwrap();
    select.set("b").unwrap();

    let proxy = Proxy::new(adapter);
    let m = Metadata::new(Network::Tcp).with_host("example.com");
    assert_eq!(proxy.unwrap(&m, false).unwrap().name(), "b");
    assert!(proxy.adapter_type().is_group());
}

#[tokio::test(start_paused = true)]
async fn test_lazy_health_check_skips_recently_used() {
    let options = HealthCheckOptions {
        interval: Duration::from_secs(30),
        lazy: true,
        ..HealthCheckOptions::default()
    };
    let hc = HealthCheck::new(members(&["a"]), options);
    assert!(hc.should_check_at(tokio::time::Instant::now()));

    hc.touch();
    assert!(!hc.should_check_at(tokio::time::Instant::now()));

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(!hc.should_check_at(tokio::time::Instant::now()));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(hc.should_check_at(tokio::time::Instant::now()));
}

#[tokio::test(start_paused = true)]
async fn test_eager_health_check_always_due() {
    let options = HealthCheckOptions {
        interval: Duration::from_secs(30),
        lazy: false,
        ..HealthCheckOptions::default()
    };
    let hc = HealthCheck::new(members(&["a"]), options);
    hc.touch();
    assert!(hc.should_check_at(tokio::time::Instant::now()));
}
