//! NAT table: flow key to packet sender
//!
//! Besides the sender, an entry keeps the local sockets used to answer the
//! client from arbitrary source addresses (transparent proxying), with a
//! per-address creation lock so only one task binds each socket.

use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::PacketSender;

/// Local socket answering the client as a given remote address
pub type LocalConn = Arc<UdpSocket>;

/// Outcome of [`Table::get_or_create_lock_for_local_conn`]
#[derive(Debug)]
pub enum LocalConnLock {
    /// Caller creates the socket and drops the guard once it is added
    Created(OwnedMutexGuard<()>),
    /// Another task is creating it; lock this, then look the socket up
    Existing(Arc<Mutex<()>>),
}

#[derive(Debug)]
struct Entry {
    sender: Arc<PacketSender>,
    local_conns: DashMap<String, LocalConn>,
    local_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Entry {
    fn new(sender: Arc<PacketSender>) -> Self {
        Self {
            sender,
            local_conns: DashMap::new(),
            local_locks: DashMap::new(),
        }
    }
}

/// Concurrent map of UDP flows
#[derive(Debug, Default)]
pub struct Table {
    entries: DashMap<String, Arc<Entry>>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender of an existing flow
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<PacketSender>> {
        self.entries.get(key).map(|e| Arc::clone(&e.sender))
    }

    /// Sender for `key`, calling `maker` only if the flow is new
    ///
    /// Concurrent callers for the same key run `maker` once between them and
    /// all get the same sender. The flag is `true` if the flow existed.
    pub fn get_or_create<F>(&self, key: &str, maker: F) -> (Arc<PacketSender>, bool)
    where
        F: FnOnce() -> Arc<PacketSender>,
    {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(e) => (Arc::clone(&e.get().sender), true),
            MapEntry::Vacant(v) => {
                let sender = maker();
                v.insert(Arc::new(Entry::new(Arc::clone(&sender))));
                debug!(key = %key, "nat entry created");
                (sender, false)
            }
        }
    }

    /// Remove a flow
    pub fn delete(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            debug!(key = %key, "nat entry removed");
        }
    }

    /// Close and remove every flow
    pub fn close_all(&self) {
        let senders: Vec<Arc<PacketSender>> = self
            .entries
            .iter()
            .map(|e| Arc::clone(&e.sender))
            .collect();
        self.entries.clear();
        for sender in senders {
            sender.close();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Creation lock for the local socket `key` of flow `l_addr`
    ///
    /// Returns `None` if the flow does not exist.
    pub fn get_or_create_lock_for_local_conn(&self, l_addr: &str, key: &str) -> Option<LocalConnLock> {
        let entry = self.entries.get(l_addr).map(|e| Arc::clone(&e))?;
        let lock = match entry.local_locks.entry(key.to_string()) {
            MapEntry::Occupied(e) => LocalConnLock::Existing(Arc::clone(e.get())),
            MapEntry::Vacant(v) => {
                let lock = Arc::new(Mutex::new(()));
                let guard = Arc::clone(&lock).try_lock_owned().ok()?;
                v.insert(lock);
                LocalConnLock::Created(guard)
            }
        };
        Some(lock)
    }

    /// Local socket `key` of flow `l_addr`
    #[must_use]
    pub fn get_for_local_conn(&self, l_addr: &str, key: &str) -> Option<LocalConn> {
        let entry = self.entries.get(l_addr)?;
        let conn = entry.local_conns.get(key).map(|c| Arc::clone(&c));
        conn
    }

    /// Record a local socket; `false` if the flow does not exist
    pub fn add_for_local_conn(&self, l_addr: &str, key: &str, conn: LocalConn) -> bool {
        let Some(entry) = self.entries.get(l_addr) else {
            return false;
        };
        entry.local_conns.insert(key.to_string(), conn);
        true
    }

    /// Visit the local sockets of flow `l_addr` until `f` returns `false`
    pub fn range_for_local_conn<F>(&self, l_addr: &str, mut f: F)
    where
        F: FnMut(&str, &LocalConn) -> bool,
    {
        let Some(entry) = self.entries.get(l_addr).map(|e| Arc::clone(&e)) else {
            return;
        };
        for item in &entry.local_conns {
            if !f(item.key(), item.value()) {
                break;
            }
        }
    }

    /// Drop the creation lock for local socket `key`
    pub fn delete_lock_for_local_conn(&self, l_addr: &str, key: &str) {
        if let Some(entry) = self.entries.get(l_addr) {
            entry.local_locks.remove(key);
        }
    }

    /// Drop every local socket of flow `l_addr`
    pub fn close_local_conns(&self, l_addr: &str) {
        if let Some(entry) = self.entries.get(l_addr) {
            entry.local_conns.clear();
        }
    }
}
