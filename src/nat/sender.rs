//! Per-flow packet sender
//!
//! `send` never blocks the inbound read loop: a packet that finds the queue
//! full, or the sender closed, is dropped (its buffer released). `process` is
//! the only consumer, so a flow's packets reach the outbound socket in the
//! order they were queued and each distinct origin is resolved at most once.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{PacketAdapter, WriteBackProxy};
use crate::adapter::PacketConn;
use crate::dns::Resolver;
use crate::error::NatError;
use crate::metadata::{DnsMode, Metadata};

/// Queued packets per flow
pub const SENDER_CAPACITY: usize = 64;

/// Single-consumer queue in front of one outbound `PacketConn`
pub struct PacketSender {
    tx: mpsc::Sender<PacketAdapter>,
    rx: Mutex<Option<mpsc::Receiver<PacketAdapter>>>,
    cancel: CancellationToken,
    /// Origin metadata key to resolved destination IP
    origin_to_target: DashMap<String, IpAddr>,
    /// Resolved destination IP back to the IP the client sent to
    target_to_origin: DashMap<IpAddr, IpAddr>,
    last_write: Mutex<Option<Instant>>,
}

impl PacketSender {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(SENDER_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            origin_to_target: DashMap::new(),
            target_to_origin: DashMap::new(),
            last_write: Mutex::new(None),
        }
    }

    /// Queue a packet; drops it if the queue is full or the sender closed
    pub fn send(&self, packet: PacketAdapter) {
        if self.cancel.is_cancelled() {
            trace!(key = %packet.key(), "sender closed, packet dropped");
            return;
        }
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                debug!(key = %packet.key(), "sender queue full, packet dropped");
            }
            Err(TrySendError::Closed(packet)) => {
                trace!(key = %packet.key(), "sender closed, packet dropped");
            }
        }
    }

    /// Remember that `origin` was sent to `target`
    ///
    /// The first mapping for an origin, and for a target IP, wins.
    pub fn add_mapping(&self, origin: &Metadata, target: &Metadata) {
        let Some(target_ip) = target.dst_ip else {
            return;
        };
        self.origin_to_target.entry(origin.to_string()).or_insert(target_ip);
        if let Some(origin_ip) = origin.dst_ip {
            self.target_to_origin.entry(target_ip).or_insert(origin_ip);
        }
    }

    /// IP the client originally sent to, for a reply from `addr`
    #[must_use]
    pub fn restore_read_from(&self, addr: IpAddr) -> IpAddr {
        self.target_to_origin.get(&addr).map_or(addr, |origin| *origin)
    }

    /// Resolved target remembered for `origin`
    #[must_use]
    pub fn target_for(&self, origin: &Metadata) -> Option<IpAddr> {
        self.origin_to_target.get(&origin.to_string()).map(|ip| *ip)
    }

    /// When a packet last reached the outbound socket
    #[must_use]
    pub fn last_write(&self) -> Option<Instant> {
        *self.last_write.lock()
    }

    /// Write queued packets to `pc` until closed
    ///
    /// Only the first call consumes the queue; later calls return at once. A
    /// write error closes the sender, which ends the flow.
    pub async fn process(
        &self,
        pc: Arc<dyn PacketConn>,
        write_back: Option<Arc<WriteBackProxy>>,
        resolver: Arc<dyn Resolver>,
    ) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        loop {
            let packet = tokio::select! {
                () = self.cancel.cancelled() => break,
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            if let Some(write_back) = &write_back {
                write_back.update(packet.packet());
            }
            match self.process_packet(pc.as_ref(), &packet, resolver.as_ref()).await {
                Ok(()) => {}
                Err(NatError::Io(e)) => {
                    warn!(key = %packet.key(), error = %e, "udp write failed, closing flow");
                    self.close();
                }
                Err(e) => {
                    debug!(key = %packet.key(), error = %e, "udp packet dropped");
                }
            }
        }
        rx.close();
        while rx.try_recv().is_ok() {}
    }

    async fn process_packet(
        &self,
        pc: &dyn PacketConn,
        packet: &PacketAdapter,
        resolver: &dyn Resolver,
    ) -> Result<(), NatError> {
        let origin = packet.metadata();
        let mut target = origin.pure();
        if target.dns_mode == DnsMode::FakeIp && !target.host.is_empty() {
            // Fake-IP destinations are synthetic; dial the real host.
            target.dst_ip = None;
        }
        if let Some(ip) = self.target_for(origin) {
            target.dst_ip = Some(ip);
        } else {
            if !target.host.is_empty() {
                pc.resolve_udp(&mut target, resolver)
                    .await
                    .map_err(|e| NatError::Resolve {
                        host: target.host.clone(),
                        reason: e.to_string(),
                    })?;
            }
            if target.dst_ip.is_none() {
                return Err(NatError::InvalidDestination(target.remote_address()));
            }
            self.add_mapping(origin, &target);
        }
        let addr = target
            .udp_addr()
            .ok_or_else(|| NatError::InvalidDestination(target.remote_address()))?;
        pc.write_to(packet.data(), addr).await?;
        *self.last_write.lock() = Some(Instant::now());
        Ok(())
    }

    /// Stop the sender and drop anything still queued; idempotent
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(rx) = self.rx.lock().as_mut() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the sender is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl Default for PacketSender {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketSender")
            .field("closed", &self.is_closed())
            .field("mappings", &self.origin_to_target.len())
            .finish_non_exhaustive()
    }
}
