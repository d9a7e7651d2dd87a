//! Reverse path of a UDP flow

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::{PacketSender, Table, WriteBack};
use crate::adapter::{PacketAddr, PacketConn};
use crate::metadata::unmap;

/// Idle time after which a flow is torn down
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest datagram read from the outbound side
const MAX_DATAGRAM: usize = 65_535;

/// Copy replies from `pc` back to the client until the flow ends
///
/// The idle deadline is `timeout` after the later of the last reply read and
/// the last packet the sender wrote. A reply's source is mapped back through
/// the sender's destination NAT so the client sees the address it sent to; a
/// source that is not a socket address is replaced by `origin`. The flow ends
/// on a read or write-back error, on timeout, or when the sender closes, and
/// every exit tears down the sender, the socket, the flow's local sockets and
/// its table entry.
pub async fn handle_udp_to_local(
    write_back: Arc<dyn WriteBack>,
    pc: Arc<dyn PacketConn>,
    sender: Arc<PacketSender>,
    table: Arc<Table>,
    key: String,
    origin: Option<SocketAddr>,
    timeout: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let idle = tokio::time::sleep(timeout);
    tokio::pin!(idle);
    loop {
        let read = tokio::select! {
            () = sender.closed() => break,
            () = &mut idle => {
                match sender.last_write().map(|at| at + timeout) {
                    Some(deadline) if deadline > Instant::now() => {
                        idle.as_mut().reset(deadline);
                        continue;
                    }
                    _ => {
                        debug!(key = %key, "udp flow idle");
                        break;
                    }
                }
            }
            read = pc.read_from(&mut buf) => read,
        };
        let (n, from) = match read {
            Ok(read) => read,
            Err(e) => {
                debug!(key = %key, error = %e, "udp read ended");
                break;
            }
        };
        idle.as_mut().reset(Instant::now() + timeout);

        let from = match (from, origin) {
            (PacketAddr::Udp(addr), _) => addr,
            (other, Some(origin)) => {
                warn!(key = %key, from = ?other, replaced = %origin, "reply source is not a socket address");
                origin
            }
            (other, None) => {
                warn!(key = %key, from = ?other, "reply source is not a socket address, dropped");
                continue;
            }
        };
        let from = SocketAddr::new(unmap(sender.restore_read_from(from.ip())), from.port());

        if let Err(e) = write_back.write_back(&buf[..n], from).await {
            debug!(key = %key, error = %e, "udp write back failed");
            break;
        }
    }

    sender.close();
    if let Err(e) = pc.close().await {
        debug!(key = %key, error = %e, "udp close failed");
    }
    table.close_local_conns(&key);
    table.delete(&key);
}

#[cfg(test)]
mod tests {
    use super::super::testutil::TestPacket;
    use super::*;
    use crate::dns::{Resolver, StaticResolver};
    use crate::metadata::{Metadata, Network};
    use crate::nat::PacketAdapter;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Outbound socket fed from a channel
    #[derive(Debug)]
    struct ScriptedConn {
        replies: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, PacketAddr)>>,
        writes: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl PacketConn for ScriptedConn {
        async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, PacketAddr)> {
            match self.replies.lock().await.recv().await {
                Some((data, from)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), from))
                }
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed")),
            }
        }
        async fn write_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(buf.len())
        }
        async fn close(&self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scripted() -> (mpsc::Sender<(Vec<u8>, PacketAddr)>, Arc<ScriptedConn>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Arc::new(ScriptedConn {
            replies: tokio::sync::Mutex::new(rx),
            writes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        (tx, conn)
    }

    fn flow(table: &Table, key: &str) -> Arc<PacketSender> {
        table.get_or_create(key, || Arc::new(PacketSender::new())).0
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_restored_then_idle_teardown() {
        let table = Arc::new(Table::new());
        let sender = flow(&table, "flow");
        let origin = crate::metadata::Metadata::new(crate::metadata::Network::Udp)
            .with_host("game.example")
            .with_dst("198.18.0.9".parse().unwrap(), 3074);
        let target = crate::metadata::Metadata::new(crate::metadata::Network::Udp)
            .with_dst("203.0.113.7".parse().unwrap(), 3074);
        sender.add_mapping(&origin, &target);

        let packet = Arc::new(TestPacket::new(b""));
        let (tx, conn) = scripted();
        tx.send((b"pong".to_vec(), PacketAddr::Udp("203.0.113.7:3074".parse().unwrap())))
            .await
            .unwrap();
        tx.send((b"other".to_vec(), PacketAddr::Udp("[::ffff:1.2.3.4]:9".parse().unwrap())))
            .await
            .unwrap();

        let task = tokio::spawn(handle_udp_to_local(
            packet.clone(),
            conn.clone(),
            Arc::clone(&sender),
            Arc::clone(&table),
            "flow".to_string(),
            None,
            Duration::from_secs(60),
        ));
        task.await.unwrap();

        let replies = packet.replies.lock();
        assert_eq!(replies[0], (b"pong".to_vec(), "198.18.0.9:3074".parse().unwrap()));
        assert_eq!(replies[1].1, "1.2.3.4:9".parse().unwrap());
        assert!(sender.is_closed());
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
        assert!(table.get("flow").is_none());
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_writes_keep_flow_alive() {
        let table = Arc::new(Table::new());
        let sender = flow(&table, "flow");
        let (tx, conn) = scripted();
        let pc: Arc<dyn PacketConn> = conn.clone();

        let task = tokio::spawn(handle_udp_to_local(
            Arc::new(TestPacket::new(b"")),
            Arc::clone(&pc),
            Arc::clone(&sender),
            Arc::clone(&table),
            "flow".to_string(),
            None,
            Duration::from_secs(1),
        ));
        {
            let sender = Arc::clone(&sender);
            let resolver: Arc<dyn Resolver> = Arc::new(StaticResolver::new());
            tokio::spawn(async move { sender.process(pc, None, resolver).await });
        }

        // No replies ever arrive; only the outbound side is active.
        let target = Metadata::new(Network::Udp).with_dst("203.0.113.7".parse().unwrap(), 3074);
        for _ in 0..6 {
            sender.send(PacketAdapter::new(Arc::new(TestPacket::new(b"ping")), target.clone()));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(conn.writes.load(Ordering::SeqCst), 6);
        assert!(table.get("flow").is_some());
        assert!(!sender.is_closed());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        task.await.unwrap();
        assert!(sender.is_closed());
        assert!(table.get("flow").is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn test_non_socket_source_replaced() {
        let table = Arc::new(Table::new());
        let sender = flow(&table, "flow");
        let packet = Arc::new(TestPacket::new(b""));
        let (tx, conn) = scripted();
        tx.send((b"a".to_vec(), PacketAddr::Domain("dns.example".into(), 53)))
            .await
            .unwrap();
        drop(tx);
        let origin: SocketAddr = "9.9.9.9:53".parse().unwrap();
        handle_udp_to_local(
            packet.clone(),
            conn,
            sender,
            Arc::clone(&table),
            "flow".to_string(),
            Some(origin),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(packet.replies.lock()[0].1, origin);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_sender_close_ends_flow() {
        let table = Arc::new(Table::new());
        let sender = flow(&table, "flow");
        let (tx, conn) = scripted();
        let task = tokio::spawn(handle_udp_to_local(
            Arc::new(TestPacket::new(b"")),
            conn,
            Arc::clone(&sender),
            Arc::clone(&table),
            "flow".to_string(),
            None,
            Duration::from_secs(3600),
        ));
        sender.close();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(table.is_empty());
        drop(tx);
    }
}
