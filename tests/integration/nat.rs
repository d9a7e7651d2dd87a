//! UDP NAT integration tests
//!
//! Flows run over real loopback sockets: a [`DirectPacketConn`] talks to an
//! echo server while the reply loop writes back into a [`TestPacket`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meta_router::adapter::builtin::DirectPacketConn;
use meta_router::adapter::PacketConn;
use meta_router::dns::{Resolver, StaticResolver};
use meta_router::metadata::DnsMode;
use meta_router::nat::{handle_udp_to_local, PacketAdapter, PacketSender, Table, UdpPacket, WriteBack, WriteBackProxy};
use meta_router::{Metadata, Network};

use super::support::{spawn_udp_echo, TestPacket};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_flows_share_one_sender() {
    let table = Arc::new(Table::new());
    let created = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..64 {
        let table = Arc::clone(&table);
        let created = Arc::clone(&created);
        handles.push(tokio::spawn(async move {
            let key = format!("127.0.0.1:7874-10.0.0.{}:53", i % 4);
            let (sender, existed) = table.get_or_create(&key, || {
                created.fetch_add(1, Ordering::SeqCst);
                Arc::new(PacketSender::new())
            });
            (key, sender, existed)
        }));
    }

    let mut fresh = 0;
    for handle in handles {
        let (key, sender, existed) = handle.await.unwrap();
        if !existed {
            fresh += 1;
        }
        assert!(Arc::ptr_eq(&sender, &table.get(&key).unwrap()));
    }
    assert_eq!(created.load(Ordering::SeqCst), 4);
    assert_eq!(fresh, 4);
    assert_eq!(table.len(), 4);
}

#[test]
fn test_send_after_close_releases_packet() {
    let sender = PacketSender::new();
    sender.close();
    assert!(sender.is_closed());

    let (packet, _replies) = TestPacket::new(b"late");
    let metadata = Metadata::new(Network::Udp).with_dst("10.0.0.1".parse().unwrap(), 53);
    sender.send(PacketAdapter::new(Arc::clone(&packet) as Arc<dyn UdpPacket>, metadata));
    assert_eq!(packet.released(), 1);
}

#[tokio::test]
async fn test_dnat_round_trip_restores_fake_ip() {
    let echo = spawn_udp_echo().await;
    let resolver: Arc<dyn Resolver> =
        Arc::new(StaticResolver::new().with_host("game.example", echo.ip()));

    let mut origin = Metadata::new(Network::Udp)
        .with_src("192.168.1.20".parse().unwrap(), 40000)
        .with_dst("198.18.0.7".parse().unwrap(), echo.port())
        .with_host("game.example");
    origin.dns_mode = DnsMode::FakeIp;

    let (packet, mut replies) = TestPacket::new(b"hello");
    let packet: Arc<dyn UdpPacket> = packet;
    let adapter = PacketAdapter::new(Arc::clone(&packet), origin.clone());
    let key = adapter.key();

    let table = Arc::new(Table::new());
    let (sender, existed) = table.get_or_create(&key, || Arc::new(PacketSender::new()));
    assert!(!existed);

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pc: Arc<dyn PacketConn> = Arc::new(DirectPacketConn::new(socket));
    let write_back = Arc::new(WriteBackProxy::new(Arc::clone(&packet)));
    let reply_sink: Arc<dyn WriteBack> = Arc::clone(&write_back) as Arc<dyn WriteBack>;

    tokio::spawn(handle_udp_to_local(
        reply_sink,
        Arc::clone(&pc),
        Arc::clone(&sender),
        Arc::clone(&table),
        key.clone(),
        origin.udp_addr(),
        Duration::from_secs(5),
    ));
    {
        let sender = Arc::clone(&sender);
        let pc = Arc::clone(&pc);
        tokio::spawn(async move { sender.process(pc, Some(write_back), resolver).await });
    }

    sender.send(adapter);
    let (data, from) = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("reply in time")
        .expect("reply channel open");
    assert_eq!(data, b"hello");
    assert_eq!(from, SocketAddr::new("198.18.0.7".parse().unwrap(), echo.port()));
    assert_eq!(sender.target_for(&origin), Some(echo.ip()));

    sender.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while table.get(&key).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flow torn down");
}

#[tokio::test(start_paused = true)]
async fn test_idle_flow_is_removed() {
    let table = Arc::new(Table::new());
    let (sender, _) = table.get_or_create("idle", || Arc::new(PacketSender::new()));
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pc: Arc<dyn PacketConn> = Arc::new(DirectPacketConn::new(socket));
    let (packet, _replies) = TestPacket::new(b"");

    let task = tokio::spawn(handle_udp_to_local(
        packet,
        pc,
        Arc::clone(&sender),
        Arc::clone(&table),
        "idle".to_string(),
        None,
        Duration::from_secs(60),
    ));
    tokio::time::advance(Duration::from_secs(61)).await;
    task.await.unwrap();

    assert!(sender.is_closed());
    assert!(table.is_empty());
}
