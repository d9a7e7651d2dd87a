//! URL-test group: the fastest alive member

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use super::{GroupBase, GroupKind, ProxyGroup};
use crate::adapter::{AdapterType, Conn, PacketConn, Proxy, ProxyAdapter};
use crate::common::IntRanges;
use crate::error::{AdapterError, GroupError};
use crate::metadata::Metadata;

/// How long a fastest-member choice is reused
pub const FAST_CACHE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct FastState {
    node: Option<Arc<Proxy>>,
    computed_at: Option<Instant>,
}

/// Routes through the member with the lowest last delay
///
/// The current choice is kept until another member beats it by more than
/// `tolerance` milliseconds, or until it dies or leaves the group. The choice
/// is recomputed at most once per [`FAST_CACHE_WINDOW`]; concurrent callers
/// share one computation.
#[derive(Debug)]
pub struct UrlTest {
    base: GroupBase,
    tolerance: u16,
    selected: RwLock<String>,
    fast: Mutex<FastState>,
}

impl UrlTest {
    #[must_use]
    pub fn new(base: GroupBase, tolerance: u16) -> Self {
        Self {
            base,
            tolerance,
            selected: RwLock::new(String::new()),
            fast: Mutex::new(FastState::default()),
        }
    }

    #[must_use]
    pub const fn tolerance(&self) -> u16 {
        self.tolerance
    }

    /// Drop the cached choice so the next pick recomputes it
    pub fn reset(&self) {
        self.fast.lock().computed_at = None;
    }

    fn fast(&self, touch: bool) -> Arc<Proxy> {
        let mut state = self.fast.lock();
        if let (Some(node), Some(at)) = (&state.node, state.computed_at) {
            if at.elapsed() < FAST_CACHE_WINDOW {
                let node = Arc::clone(node);
                drop(state);
                if touch {
                    self.base.touch();
                }
                return node;
            }
        }

        let proxies = self.base.get_proxies(touch);
        let url = self.base.test_url();

        let pinned = self.selected.read().clone();
        if !pinned.is_empty() {
            if let Some(p) = proxies
                .iter()
                .find(|p| p.name() == pinned && p.alive_for_test_url(url))
            {
                state.node = Some(Arc::clone(p));
                state.computed_at = Some(Instant::now());
                return Arc::clone(p);
            }
        }

        let Some(mut fastest) = proxies.first().cloned() else {
            return self.base.compatible();
        };
        let mut min_delay = fastest.last_delay_for_test_url(url);
        for p in proxies.iter().skip(1) {
            if !p.alive_for_test_url(url) {
                continue;
            }
            let delay = p.last_delay_for_test_url(url);
            if delay < min_delay {
                fastest = Arc::clone(p);
                min_delay = delay;
            }
        }

        let keep_current = state.node.as_ref().is_some_and(|current| {
            proxies.iter().any(|p| Arc::ptr_eq(p, current))
                && current.alive_for_test_url(url)
                && current.last_delay_for_test_url(url)
                    <= min_delay.saturating_add(self.tolerance)
        });
        if !keep_current {
            debug!(group = %self.base.name(), proxy = %fastest.name(), delay = min_delay, "fastest member changed");
            state.node = Some(fastest);
        }
        state.computed_at = Some(Instant::now());
        state.node.clone().unwrap_or_else(|| self.base.compatible())
    }
}

#[async_trait]
impl ProxyGroup for UrlTest {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn kind(&self) -> GroupKind {
        GroupKind::UrlTest
    }

    fn now(&self) -> String {
        self.fast(false).name().to_string()
    }

    fn set(&self, name: &str) -> Result<(), GroupError> {
        if !self.base.get_proxies(false).iter().any(|p| p.name() == name) {
            return Err(GroupError::ProxyNotExist(name.to_string()));
        }
        *self.selected.write() = name.to_string();
        self.reset();
        Ok(())
    }

    fn force_set(&self, name: &str) {
        *self.selected.write() = name.to_string();
        self.reset();
    }

    async fn url_test(&self, url: &str, expected: &IntRanges<u16>) -> HashMap<String, u16> {
        let delays = self.base.url_test(url, expected).await;
        self.reset();
        delays
    }
}

#[async_trait]
impl ProxyAdapter for UrlTest {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::UrlTest
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp() && self.fast(false).support_udp()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError> {
        let proxy = self.fast(true);
        match proxy.dial(metadata).await {
            Ok(conn) => {
                self.base.on_dial_success();
                Ok(conn)
            }
            Err(e) => {
                if self.base.on_dial_failed(&proxy.adapter_type(), &e) {
                    self.reset();
                }
                Err(e)
            }
        }
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        self.fast(true).listen_packet(metadata).await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        Some(self.fast(touch))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.base.close();
        Ok(())
    }
}
