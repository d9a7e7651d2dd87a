//! UDP NAT
//!
//! Each UDP flow (inbound local address plus destination) owns one entry in
//! the [`Table`]. The entry's [`PacketSender`] is the single consumer that
//! writes the flow's packets to the outbound [`PacketConn`](crate::adapter::PacketConn)
//! in order; [`handle_udp_to_local`] is the reverse loop that carries replies
//! back to the inbound client and tears the entry down when the flow goes
//! idle.
//!
//! Destination NAT: when a packet addressed to a host name (or a mapped
//! fake IP) is resolved to a real IP, the sender remembers both directions so
//! replies appear to come from the address the client originally sent to.

pub mod sender;
pub mod table;
pub mod udp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::metadata::Metadata;

pub use sender::{PacketSender, SENDER_CAPACITY};
pub use table::{LocalConn, LocalConnLock, Table};
pub use udp::{handle_udp_to_local, DEFAULT_UDP_TIMEOUT};

/// Sink for replies going back to the inbound client
#[async_trait]
pub trait WriteBack: Send + Sync {
    /// Send `buf` to the client as if it came from `from`
    async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize>;
}

/// One datagram read by an inbound listener
pub trait UdpPacket: WriteBack {
    /// Payload
    fn data(&self) -> &[u8];

    /// Inbound address the packet arrived on
    fn local_addr(&self) -> SocketAddr;

    /// Return the packet's buffer to its pool
    fn release(&self) {}
}

/// A packet and the metadata it was routed with
///
/// Dropping the adapter releases the packet's buffer, whichever path
/// consumed it.
pub struct PacketAdapter {
    packet: Arc<dyn UdpPacket>,
    metadata: Metadata,
}

impl PacketAdapter {
    #[must_use]
    pub fn new(packet: Arc<dyn UdpPacket>, metadata: Metadata) -> Self {
        Self { packet, metadata }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.packet.data()
    }

    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn packet(&self) -> &Arc<dyn UdpPacket> {
        &self.packet
    }

    /// Flow key: inbound address plus destination
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}-{}", self.packet.local_addr(), self.metadata.remote_address())
    }
}

impl Drop for PacketAdapter {
    fn drop(&mut self) {
        self.packet.release();
    }
}

impl fmt::Debug for PacketAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketAdapter")
            .field("local_addr", &self.packet.local_addr())
            .field("len", &self.packet.data().len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Write-back target that follows the most recent packet of a flow
///
/// Clients that roam keep their flow; replies go to wherever the last packet
/// came from.
pub struct WriteBackProxy {
    current: RwLock<Arc<dyn UdpPacket>>,
}

impl WriteBackProxy {
    #[must_use]
    pub fn new(packet: Arc<dyn UdpPacket>) -> Self {
        Self {
            current: RwLock::new(packet),
        }
    }

    /// Point replies at `packet`'s sender
    pub fn update(&self, packet: &Arc<dyn UdpPacket>) {
        *self.current.write() = Arc::clone(packet);
    }
}

#[async_trait]
impl WriteBack for WriteBackProxy {
    async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize> {
        let current = Arc::clone(&self.current.read());
        current.write_back(buf, from).await
    }
}

impl fmt::Debug for WriteBackProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBackProxy")
            .field("local_addr", &self.current.read().local_addr())
            .finish()
    }
}
