//! Shared fixtures

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use meta_router::adapter::{AdapterType, Conn, PacketConn, Proxy, ProxyAdapter};
use meta_router::dns::{Resolver, StaticResolver};
use meta_router::nat::{UdpPacket, WriteBack};
use meta_router::{AdapterError, Metadata};

/// Resolver that counts lookups
#[derive(Debug, Default)]
pub struct CountingResolver {
    inner: StaticResolver,
    calls: AtomicUsize,
}

impl CountingResolver {
    pub fn new(host: &str, ip: &str) -> Self {
        Self {
            inner: StaticResolver::new().with_host(host, ip.parse().unwrap()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve_ip(&self, host: &str) -> io::Result<IpAddr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve_ip(host).await
    }
}

/// Protocol adapter that counts dials and never connects anywhere
#[derive(Debug)]
pub struct MockAdapter {
    pub name: String,
    pub dials: AtomicUsize,
}

impl MockAdapter {
    pub fn proxy(name: &str) -> Arc<Proxy> {
        Arc::new(Proxy::new(Arc::new(Self {
            name: name.to_string(),
            dials: AtomicUsize::new(0),
        })))
    }
}

#[async_trait]
impl ProxyAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Protocol("Mock".into())
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial(&self, _metadata: &Metadata) -> Result<Conn, AdapterError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, _server) = tokio::io::duplex(64);
        Ok(Box::new(client))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        Err(AdapterError::UdpUnsupported(self.name.clone()))
    }
}

/// Inbound datagram whose replies land in a channel
pub struct TestPacket {
    data: Vec<u8>,
    local: SocketAddr,
    replies: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    releases: Arc<AtomicUsize>,
}

impl TestPacket {
    pub fn new(data: &[u8]) -> (Arc<Self>, mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let packet = Arc::new(Self {
            data: data.to_vec(),
            local: "127.0.0.1:7874".parse().unwrap(),
            replies: tx,
            releases: Arc::new(AtomicUsize::new(0)),
        });
        (packet, rx)
    }

    pub fn released(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WriteBack for TestPacket {
    async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize> {
        self.replies
            .send((buf.to_vec(), from))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))?;
        Ok(buf.len())
    }
}

impl UdpPacket for TestPacket {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// UDP socket on loopback that echoes every datagram back
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// TCP listener on loopback that echoes one connection
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        }
    });
    addr
}
