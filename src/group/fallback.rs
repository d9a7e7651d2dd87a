//! Fallback group: the first member that passes its health check

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{GroupBase, GroupKind, ProxyGroup};
use crate::adapter::{AdapterType, Conn, PacketConn, Proxy, ProxyAdapter};
use crate::error::{AdapterError, GroupError};
use crate::metadata::Metadata;

/// Routes through the first alive member
///
/// A member pinned with [`ProxyGroup::set`] wins while it stays alive; once it
/// fails a check the pin is cleared. If nothing is alive the first member is
/// used anyway.
#[derive(Debug)]
pub struct Fallback {
    base: GroupBase,
    selected: RwLock<String>,
}

impl Fallback {
    #[must_use]
    pub fn new(base: GroupBase) -> Self {
        Self {
            base,
            selected: RwLock::new(String::new()),
        }
    }

    fn find_alive_proxy(&self, touch: bool) -> Arc<Proxy> {
        let proxies = self.base.get_proxies(touch);
        let url = self.base.test_url();

        let pinned = self.selected.read().clone();
        if !pinned.is_empty() {
            if let Some(p) = proxies.iter().find(|p| p.name() == pinned) {
                if p.alive_for_test_url(url) {
                    return Arc::clone(p);
                }
                debug!(group = %self.base.name(), proxy = %pinned, "pinned member is down, unpinning");
                self.selected.write().clear();
            }
        }

        proxies
            .iter()
            .find(|p| p.alive_for_test_url(url))
            .or_else(|| proxies.first())
            .cloned()
            .unwrap_or_else(|| self.base.compatible())
    }
}

impl ProxyGroup for Fallback {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn kind(&self) -> GroupKind {
        GroupKind::Fallback
    }

    fn now(&self) -> String {
        self.find_alive_proxy(false).name().to_string()
    }

    fn set(&self, name: &str) -> Result<(), GroupError> {
        if !self.base.get_proxies(false).iter().any(|p| p.name() == name) {
            return Err(GroupError::ProxyNotExist(name.to_string()));
        }
        *self.selected.write() = name.to_string();
        Ok(())
    }

    fn force_set(&self, name: &str) {
        *self.selected.write() = name.to_string();
    }
}

#[async_trait]
impl ProxyAdapter for Fallback {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Fallback
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp() && self.find_alive_proxy(false).support_udp()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError> {
        let proxy = self.find_alive_proxy(true);
        match proxy.dial(metadata).await {
            Ok(conn) => {
                self.base.on_dial_success();
                Ok(conn)
            }
            Err(e) => {
                self.base.on_dial_failed(&proxy.adapter_type(), &e);
                Err(e)
            }
        }
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        self.find_alive_proxy(true).listen_packet(metadata).await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        Some(self.find_alive_proxy(touch))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.base.close();
        Ok(())
    }
}
