//! End-to-end dispatch tests
//!
//! A [`RouterState`] is built from JSON and fed TCP streams and UDP packets
//! aimed at loopback echo servers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use meta_router::adapter::BuiltinFactory;
use meta_router::config::load_config_str;
use meta_router::dns::StaticResolver;
use meta_router::metadata::DnsMode;
use meta_router::nat::UdpPacket;
use meta_router::{AdapterError, Metadata, Mode, Network, RouterError, RouterState};

use super::support::{spawn_tcp_echo, spawn_udp_echo, TestPacket};

const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

fn router(json: &str) -> RouterState {
    let config = load_config_str(json).unwrap();
    let resolver = StaticResolver::new()
        .with_host("svc.echo.test", LOOPBACK)
        .with_host("game.echo.test", LOOPBACK);
    RouterState::init(&config, &BuiltinFactory::new(), Arc::new(resolver), None).unwrap()
}

const CONFIG: &str = r#"{
    "proxy_groups": [
        { "name": "out", "type": "select", "proxies": ["DIRECT", "REJECT"] }
    ],
    "rules": [
        "DOMAIN-SUFFIX,blocked.test,REJECT",
        "AND,((NETWORK,UDP),(DOMAIN-SUFFIX,echo.test)),out",
        "IP-CIDR,127.0.0.0/8,out",
        "MATCH,REJECT"
    ]
}"#;

#[tokio::test]
async fn test_tcp_routed_by_resolved_ip() {
    let state = router(CONFIG);
    let echo = spawn_tcp_echo().await;

    let (mut client, inbound) = tokio::io::duplex(1024);
    let mut metadata = Metadata::new(Network::Tcp)
        .with_src("192.168.1.20".parse().unwrap(), 51000)
        .with_host("svc.echo.test");
    metadata.dst_port = echo.port();

    let tunnel = Arc::clone(state.tunnel());
    let relay = tokio::spawn(async move { tunnel.handle_tcp(inbound, metadata).await });

    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"ping");

    let (up, down) = relay.await.unwrap().unwrap();
    assert_eq!((up, down), (4, 4));
    let stats = state.tunnel().stats().snapshot();
    assert_eq!(stats.tcp, 1);
    assert_eq!(stats.upload, 4);
    state.shutdown().await;
}

#[tokio::test]
async fn test_tcp_rejected_by_rule_and_by_selection() {
    let state = router(CONFIG);

    let (_client, inbound) = tokio::io::duplex(64);
    let mut metadata = Metadata::new(Network::Tcp).with_host("ads.blocked.test");
    metadata.dst_port = 443;
    let err = state.tunnel().handle_tcp(inbound, metadata).await.unwrap_err();
    assert!(matches!(err, RouterError::Adapter(AdapterError::Rejected(_))));

    state.select("out", "REJECT").unwrap();
    let (_client, inbound) = tokio::io::duplex(64);
    let metadata = Metadata::new(Network::Tcp).with_dst(LOOPBACK, 9);
    let err = state.tunnel().handle_tcp(inbound, metadata).await.unwrap_err();
    assert!(matches!(err, RouterError::Adapter(AdapterError::Rejected(_))));

    assert_eq!(state.tunnel().stats().snapshot().failed, 2);
    state.shutdown().await;
}

#[tokio::test]
async fn test_direct_mode_bypasses_rules() {
    let state = router(CONFIG);
    state.tunnel().set_mode(Mode::Direct);

    let mut metadata = Metadata::new(Network::Tcp).with_host("ads.blocked.test");
    metadata.dst_port = 443;
    let route = state.tunnel().resolve_proxy(&mut metadata).await.unwrap();
    assert_eq!(route.proxy.name(), "DIRECT");
    assert!(route.rule.is_none());
    state.shutdown().await;
}

#[tokio::test]
async fn test_udp_flow_with_fake_ip_destination() {
    let state = router(CONFIG);
    let echo = spawn_udp_echo().await;

    let fake: IpAddr = "198.18.0.9".parse().unwrap();
    let mut metadata = Metadata::new(Network::Udp)
        .with_src("192.168.1.20".parse().unwrap(), 40000)
        .with_dst(fake, echo.port())
        .with_host("game.echo.test");
    metadata.dns_mode = DnsMode::FakeIp;

    // Replies follow the most recent packet of the flow.
    for payload in [&b"first"[..], b"second"] {
        let (packet, mut replies) = TestPacket::new(payload);
        state
            .tunnel()
            .handle_udp_packet(packet as Arc<dyn UdpPacket>, metadata.clone());
        let (data, from) = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .expect("reply in time")
            .expect("reply channel open");
        assert_eq!(data, payload);
        assert_eq!(from, SocketAddr::new(fake, echo.port()));
    }

    assert_eq!(state.tunnel().nat().len(), 1);
    assert_eq!(state.tunnel().stats().snapshot().udp_flows, 1);

    state.shutdown().await;
    assert!(state.tunnel().nat().is_empty());
}
