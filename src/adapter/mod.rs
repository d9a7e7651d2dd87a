//! Outbound adapter definitions
//!
//! This module defines the `ProxyAdapter` trait every outbound (built-in,
//! protocol-specific or group) implements, plus the UDP `PacketConn`
//! abstraction the NAT layer drives. Wire codecs live outside this crate and
//! plug in by implementing these traits.

pub mod builtin;
pub mod factory;
pub mod probe;
pub mod proxy;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::dns::Resolver;
use crate::error::AdapterError;
use crate::metadata::{unmap, Metadata};

pub use builtin::{Compatible, Direct, Pass, Reject, RejectDrop};
pub use factory::{AdapterFactory, BuiltinFactory};
pub use proxy::{DelayHistory, Proxy};

/// Byte stream returned by a dial
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed outbound stream
pub type Conn = Box<dyn AsyncStream>;

/// Adapter kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AdapterType {
    Direct,
    Reject,
    RejectDrop,
    Compatible,
    Pass,
    Relay,
    Selector,
    Fallback,
    UrlTest,
    LoadBalance,
    /// Protocol adapter provided by the embedder (`vmess`, `trojan`, ...)
    Protocol(String),
}

impl AdapterType {
    /// Get the type name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "Direct",
            Self::Reject => "Reject",
            Self::RejectDrop => "RejectDrop",
            Self::Compatible => "Compatible",
            Self::Pass => "Pass",
            Self::Relay => "Relay",
            Self::Selector => "Selector",
            Self::Fallback => "Fallback",
            Self::UrlTest => "URLTest",
            Self::LoadBalance => "LoadBalance",
            Self::Protocol(name) => name,
        }
    }

    /// Whether this is a proxy group
    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(
            self,
            Self::Relay | Self::Selector | Self::Fallback | Self::UrlTest | Self::LoadBalance
        )
    }

    /// Case-insensitive comparison with a type name, as used by `exclude-type`
    #[must_use]
    pub fn eq_name(&self, name: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a datagram read from a `PacketConn`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketAddr {
    /// Concrete socket address
    Udp(SocketAddr),
    /// Host name reported by a proxy that does not resolve replies
    Domain(String, u16),
    /// Proxy did not report a source
    Unknown,
}

/// Datagram socket opened through an adapter
///
/// Read deadlines are expressed by the caller wrapping `read_from` in a
/// timeout; `close` must be idempotent.
#[async_trait]
pub trait PacketConn: Send + Sync + fmt::Debug {
    /// Read one datagram
    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, PacketAddr)>;

    /// Write one datagram to `addr`
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Fill the destination IP of `metadata` before a write
    async fn resolve_udp(&self, metadata: &mut Metadata, resolver: &dyn Resolver) -> io::Result<()> {
        resolve_udp_metadata(metadata, resolver).await
    }

    /// Close the socket
    async fn close(&self) -> io::Result<()>;
}

/// Resolve `metadata.host` into `dst_ip` when the IP is not yet known
///
/// # Errors
///
/// Returns the resolver's error.
pub async fn resolve_udp_metadata(metadata: &mut Metadata, resolver: &dyn Resolver) -> io::Result<()> {
    if metadata.resolved() || metadata.host.is_empty() {
        return Ok(());
    }
    let ip = resolver.resolve_ip(&metadata.host).await?;
    metadata.dst_ip = Some(unmap(ip));
    Ok(())
}

/// Core trait for outbound implementations
#[async_trait]
pub trait ProxyAdapter: Send + Sync + fmt::Debug {
    /// Unique adapter name
    fn name(&self) -> &str;

    /// Adapter kind
    fn adapter_type(&self) -> AdapterType;

    /// Whether UDP sessions can be opened
    fn support_udp(&self) -> bool;

    /// Open a stream to `metadata`'s destination
    ///
    /// # Errors
    ///
    /// Returns an `AdapterError` if the connection cannot be established.
    async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError>;

    /// Open a datagram session for `metadata`
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::UdpUnsupported` if the adapter has no UDP.
    async fn listen_packet(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError>;

    /// Fill `metadata.dst_ip` the way this adapter needs it for UDP
    ///
    /// # Errors
    ///
    /// Returns an `AdapterError` if the host does not resolve.
    async fn resolve_udp(&self, metadata: &mut Metadata, resolver: &dyn Resolver) -> Result<(), AdapterError> {
        resolve_udp_metadata(metadata, resolver)
            .await
            .map_err(|e| AdapterError::dial(self.name(), metadata.remote_address(), e))
    }

    /// Server address of a protocol adapter, used as the hop target in a relay
    fn addr(&self) -> Option<String> {
        None
    }

    /// Run this adapter's protocol over an existing stream
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Unsupported` unless the adapter wraps streams.
    async fn stream_conn(&self, _conn: Conn, _metadata: &Metadata) -> Result<Conn, AdapterError> {
        Err(AdapterError::Unsupported {
            proxy: self.name().to_string(),
            op: "stream_conn",
        })
    }

    /// Concrete member selected for `metadata`; groups only
    fn unwrap(&self, _metadata: &Metadata, _touch: bool) -> Option<Arc<Proxy>> {
        None
    }

    /// Release adapter resources
    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
