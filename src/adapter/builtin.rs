//! Built-in adapters
//!
//! - [`Direct`]: connects to the destination itself
//! - [`Reject`]: refuses every connection
//! - [`RejectDrop`]: holds the connection attempt, then refuses it
//! - [`Compatible`]: stand-in for a group with no members
//! - [`Pass`]: tells the rule engine to keep matching

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AdapterType, Conn, PacketAddr, PacketConn, ProxyAdapter};
use crate::error::AdapterError;
use crate::metadata::{unmap, Metadata};

/// Default TCP connect timeout of [`Direct`]
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`RejectDrop`] holds a connection attempt
pub const DROP_DELAY: Duration = Duration::from_secs(30);

/// Connects directly to the destination
#[derive(Debug, Clone)]
pub struct Direct {
    name: String,
    connect_timeout: Duration,
    udp: bool,
}

impl Direct {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp: true,
        }
    }

    /// Enable or disable UDP
    #[must_use]
    pub const fn with_udp(mut self, udp: bool) -> Self {
        self.udp = udp;
        self
    }

    /// Set the TCP connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl ProxyAdapter for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Direct
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError> {
        let remote = metadata.remote_address();
        let connect = async {
            match metadata.udp_addr() {
                Some(addr) => TcpStream::connect(addr).await,
                None if !metadata.host.is_empty() => {
                    TcpStream::connect((metadata.host.as_str(), metadata.dst_port)).await
                }
                None => Err(io::Error::new(io::ErrorKind::InvalidInput, "no destination")),
            }
        };
        let stream = timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| AdapterError::Timeout {
                proxy: self.name.clone(),
                timeout_ms: u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|e| AdapterError::dial(&self.name, &remote, e))?;
        // Best effort; the connection works without it.
        let _ = stream.set_nodelay(true);
        debug!(proxy = %self.name, remote = %remote, "direct connection established");
        Ok(Box::new(stream))
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        if !self.udp {
            return Err(AdapterError::UdpUnsupported(self.name.clone()));
        }
        let bind: SocketAddr = match metadata.dst_ip {
            Some(ip) if ip.is_ipv6() => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| AdapterError::dial(&self.name, metadata.remote_address(), e))?;
        Ok(Arc::new(DirectPacketConn::new(socket)))
    }
}

/// Plain UDP socket; `close` wakes a pending read
#[derive(Debug)]
pub struct DirectPacketConn {
    socket: UdpSocket,
    closed: CancellationToken,
}

impl DirectPacketConn {
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: CancellationToken::new(),
        }
    }

    /// Local address of the socket
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "packet conn closed")
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, PacketAddr)> {
        tokio::select! {
            () = self.closed.cancelled() => Err(closed_error()),
            res = self.socket.recv_from(buf) => {
                let (n, from) = res?;
                Ok((n, PacketAddr::Udp(SocketAddr::new(unmap(from.ip()), from.port()))))
            }
        }
    }

    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.socket.send_to(buf, addr).await
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Datagram sink that never produces replies
#[derive(Debug, Default)]
pub struct NopPacketConn {
    closed: CancellationToken,
}

#[async_trait]
impl PacketConn for NopPacketConn {
    async fn read_from(&self, _buf: &mut [u8]) -> io::Result<(usize, PacketAddr)> {
        self.closed.cancelled().await;
        Err(closed_error())
    }

    async fn write_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Refuses every connection
#[derive(Debug, Clone)]
pub struct Reject {
    name: String,
}

impl Reject {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ProxyAdapter for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Reject
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial(&self, _metadata: &Metadata) -> Result<Conn, AdapterError> {
        Err(AdapterError::Rejected(self.name.clone()))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        Ok(Arc::new(NopPacketConn::default()))
    }
}

/// Holds a connection attempt for [`DROP_DELAY`], then refuses it
#[derive(Debug, Clone)]
pub struct RejectDrop {
    name: String,
    delay: Duration,
}

impl RejectDrop {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: DROP_DELAY,
        }
    }

    /// Override the hold time
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ProxyAdapter for RejectDrop {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::RejectDrop
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial(&self, _metadata: &Metadata) -> Result<Conn, AdapterError> {
        tokio::time::sleep(self.delay).await;
        Err(AdapterError::Rejected(self.name.clone()))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        Ok(Arc::new(NopPacketConn::default()))
    }
}

/// Placeholder member of a group whose providers are all empty
#[derive(Debug, Clone)]
pub struct Compatible {
    name: String,
}

impl Compatible {
    /// Name used for the shared placeholder
    pub const NAME: &'static str = "COMPATIBLE";

    #[must_use]
    pub fn new() -> Self {
        Self {
            name: Self::NAME.to_string(),
        }
    }
}

impl Default for Compatible {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyAdapter for Compatible {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Compatible
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial(&self, _metadata: &Metadata) -> Result<Conn, AdapterError> {
        Err(AdapterError::Rejected(self.name.clone()))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        Err(AdapterError::UdpUnsupported(self.name.clone()))
    }
}

/// Marker adapter: a rule targeting it does not end matching
#[derive(Debug, Clone)]
pub struct Pass {
    name: String,
}

impl Pass {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ProxyAdapter for Pass {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Pass
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial(&self, _metadata: &Metadata) -> Result<Conn, AdapterError> {
        Err(AdapterError::Unsupported {
            proxy: self.name.clone(),
            op: "dial",
        })
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        Err(AdapterError::Unsupported {
            proxy: self.name.clone(),
            op: "listen_packet",
        })
    }
}
