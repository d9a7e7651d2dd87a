//! Manually selected group

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use super::{GroupBase, GroupKind, ProxyGroup};
use crate::adapter::{AdapterType, Conn, PacketConn, Proxy, ProxyAdapter};
use crate::error::{AdapterError, GroupError};
use crate::metadata::Metadata;

/// Routes through the member chosen with [`ProxyGroup::set`]
///
/// Until a member is chosen, or if the chosen one disappears from the
/// providers, the first member is used.
#[derive(Debug)]
pub struct Selector {
    base: GroupBase,
    selected: RwLock<String>,
}

impl Selector {
    #[must_use]
    pub fn new(base: GroupBase) -> Self {
        Self {
            base,
            selected: RwLock::new(String::new()),
        }
    }

    fn selected_proxy(&self, touch: bool) -> Arc<Proxy> {
        let proxies = self.base.get_proxies(touch);
        let selected = self.selected.read();
        proxies
            .iter()
            .find(|p| p.name() == selected.as_str())
            .or_else(|| proxies.first())
            .cloned()
            .unwrap_or_else(|| self.base.compatible())
    }
}

impl ProxyGroup for Selector {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn kind(&self) -> GroupKind {
        GroupKind::Selector
    }

    fn now(&self) -> String {
        self.selected_proxy(false).name().to_string()
    }

    fn set(&self, name: &str) -> Result<(), GroupError> {
        if !self.base.get_proxies(false).iter().any(|p| p.name() == name) {
            return Err(GroupError::ProxyNotExist(name.to_string()));
        }
        info!(group = %self.base.name(), proxy = %name, "selector switched");
        *self.selected.write() = name.to_string();
        Ok(())
    }

    fn force_set(&self, name: &str) {
        *self.selected.write() = name.to_string();
    }
}

#[async_trait]
impl ProxyAdapter for Selector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Selector
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp() && self.selected_proxy(false).support_udp()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError> {
        self.selected_proxy(true).dial(metadata).await
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        self.selected_proxy(true).listen_packet(metadata).await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        Some(self.selected_proxy(touch))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.base.close();
        Ok(())
    }
}
