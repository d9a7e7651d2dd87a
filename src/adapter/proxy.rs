//! `Proxy`: an adapter plus its health record
//!
//! Health is tracked per test URL. Each URL keeps an alive flag and the last
//! [`MAX_HISTORY`] delay samples; a failed probe records a zero delay and marks
//! the proxy dead for that URL. URLs never probed fall back to the proxy-wide
//! alive flag, which starts out `true`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::{probe, AdapterType, Conn, PacketConn, ProxyAdapter};
use crate::common::IntRanges;
use crate::error::AdapterError;
use crate::metadata::Metadata;

/// Delay samples kept per test URL
pub const MAX_HISTORY: usize = 10;

/// Delay reported for a dead or never-tested proxy
pub const UNREACHABLE_DELAY: u16 = u16::MAX;

/// One URL test result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelayHistory {
    pub time: SystemTime,
    /// Milliseconds; zero for a failed test
    pub delay: u16,
}

#[derive(Debug, Default)]
struct TestState {
    alive: bool,
    history: VecDeque<DelayHistory>,
}

/// Adapter with per-URL health
pub struct Proxy {
    adapter: Arc<dyn ProxyAdapter>,
    alive: AtomicBool,
    states: DashMap<String, TestState>,
}

impl Proxy {
    /// Wrap an adapter
    #[must_use]
    pub fn new(adapter: Arc<dyn ProxyAdapter>) -> Self {
        Self {
            adapter,
            alive: AtomicBool::new(true),
            states: DashMap::new(),
        }
    }

    /// Adapter name
    #[must_use]
    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    /// Adapter kind
    #[must_use]
    pub fn adapter_type(&self) -> AdapterType {
        self.adapter.adapter_type()
    }

    /// Wrapped adapter
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn ProxyAdapter> {
        &self.adapter
    }

    #[must_use]
    pub fn support_udp(&self) -> bool {
        self.adapter.support_udp()
    }

    /// Result of the most recent test on any URL
    #[must_use]
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the last test of `url` succeeded
    #[must_use]
    pub fn alive_for_test_url(&self, url: &str) -> bool {
        self.states.get(url).map_or_else(|| self.alive(), |s| s.alive)
    }

    /// Last successful delay for `url`, [`UNREACHABLE_DELAY`] if dead or untested
    #[must_use]
    pub fn last_delay_for_test_url(&self, url: &str) -> u16 {
        let Some(state) = self.states.get(url) else {
            return UNREACHABLE_DELAY;
        };
        if !state.alive {
            return UNREACHABLE_DELAY;
        }
        match state.history.back() {
            Some(h) if h.delay > 0 => h.delay,
            _ => UNREACHABLE_DELAY,
        }
    }

    /// Delay samples for `url`, oldest first
    #[must_use]
    pub fn delay_history_for_test_url(&self, url: &str) -> Vec<DelayHistory> {
        self.states
            .get(url)
            .map(|s| s.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Delay samples of every tested URL
    #[must_use]
    pub fn delay_histories(&self) -> HashMap<String, Vec<DelayHistory>> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), e.history.iter().copied().collect()))
            .collect()
    }

    /// Record a test result; `None` marks a failure
    pub fn record(&self, url: &str, delay: Option<u16>) {
        let alive = delay.is_some();
        self.alive.store(alive, Ordering::Release);
        let mut state = self.states.entry(url.to_string()).or_default();
        state.alive = alive;
        state.history.push_back(DelayHistory {
            time: SystemTime::now(),
            delay: delay.unwrap_or(0),
        });
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }
    }

    /// Probe `url` through this proxy and record the result
    ///
    /// The delay is the time to dial and receive the response headers.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Timeout`, the probe failure, or
    /// `AdapterError::UnexpectedStatus` when the status is outside `expected`.
    pub async fn url_test(
        &self,
        url: &str,
        expected: &IntRanges<u16>,
        timeout: Duration,
    ) -> Result<u16, AdapterError> {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, probe::head(self.adapter.as_ref(), url)).await {
            Err(_) => Err(AdapterError::Timeout {
                proxy: self.name().to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(status)) if !expected.check(status) => Err(AdapterError::UnexpectedStatus(status)),
            Ok(Ok(_)) => Ok(u16::try_from(started.elapsed().as_millis())
                .unwrap_or(UNREACHABLE_DELAY - 1)
                .max(1)),
        };
        match &outcome {
            Ok(delay) => {
                debug!(proxy = %self.name(), url = %url, delay, "url test ok");
                self.record(url, Some(*delay));
            }
            Err(e) => {
                debug!(proxy = %self.name(), url = %url, error = %e, "url test failed");
                self.record(url, None);
            }
        }
        outcome
    }

    /// Dial through the adapter
    ///
    /// # Errors
    ///
    /// Returns the adapter's error.
    pub async fn dial(&self, metadata: &Metadata) -> Result<Conn, AdapterError> {
        self.adapter.dial(metadata).await
    }

    /// Open a UDP session through the adapter
    ///
    /// # Errors
    ///
    /// Returns the adapter's error.
    pub async fn listen_packet(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, AdapterError> {
        self.adapter.listen_packet(metadata).await
    }

    /// Member a group adapter selects for `metadata`
    #[must_use]
    pub fn unwrap(&self, metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        self.adapter.unwrap(metadata, touch)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name())
            .field("type", &self.adapter_type())
            .field("alive", &self.alive())
            .finish_non_exhaustive()
    }
}
