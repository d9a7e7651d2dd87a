//! Proxy groups
//!
//! A group is an adapter whose connections are carried by one of its members.
//! Members come from proxy providers; the group's own `proxies` list is
//! wrapped in a [`CompatibleProvider`](crate::provider::CompatibleProvider).
//!
//! | Group         | Picks                                             |
//! |---------------|---------------------------------------------------|
//! | [`Selector`]    | the member chosen by name, else the first         |
//! | [`Fallback`]    | the pinned member if alive, else the first alive  |
//! | [`UrlTest`]     | the fastest alive member, with tolerance          |
//! | [`LoadBalance`] | a member per connection by strategy               |
//! | [`Relay`]       | every member, chained                             |
//!
//! Shared behaviour lives in [`GroupBase`]: member filtering, a proxy list
//! cached by provider versions, the `COMPATIBLE` stand-in for an empty group,
//! and dial-failure counting that triggers an early health check.

pub mod fallback;
pub mod loadbalance;
pub mod relay;
pub mod selector;
pub mod urltest;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::{AdapterType, Compatible, Proxy, ProxyAdapter};
use crate::common::IntRanges;
use crate::error::{AdapterError, GroupError};
use crate::provider::{ProxyProvider, VehicleType};

pub use fallback::Fallback;
pub use loadbalance::{LoadBalance, Strategy};
pub use relay::Relay;
pub use selector::Selector;
pub use urltest::UrlTest;

/// Dial failures tolerated before an early health check
pub const DEFAULT_MAX_FAILED_TIMES: u32 = 5;

/// Window for counting dial failures when the group sets no timeout
pub const DEFAULT_FAILED_WINDOW: Duration = Duration::from_millis(5000);

/// Group kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Selector,
    Fallback,
    UrlTest,
    LoadBalance,
    Relay,
}

impl GroupKind {
    /// Parse a group type name
    ///
    /// # Errors
    ///
    /// Returns `GroupError::UnsupportedType` for other names.
    pub fn parse(s: &str) -> Result<Self, GroupError> {
        match s.to_ascii_lowercase().as_str() {
            "select" | "selector" => Ok(Self::Selector),
            "fallback" => Ok(Self::Fallback),
            "url-test" | "urltest" => Ok(Self::UrlTest),
            "load-balance" | "loadbalance" => Ok(Self::LoadBalance),
            "relay" => Ok(Self::Relay),
            _ => Err(GroupError::UnsupportedType(s.to_string())),
        }
    }
}

/// Options shared by every group kind
#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub name: String,
    /// Backtick-separated regexes; members must match one
    pub filter: String,
    /// Backtick-separated regexes; members matching one are dropped
    pub exclude_filter: String,
    /// `|`-separated adapter type names to drop
    pub exclude_type: String,
    /// URL whose health decides aliveness
    pub test_url: String,
    pub expected_status: IntRanges<u16>,
    /// Probe timeout, also the dial-failure counting window
    pub timeout: Duration,
    pub max_failed_times: u32,
    pub disable_udp: bool,
}

impl GroupOptions {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: String::new(),
            exclude_filter: String::new(),
            exclude_type: String::new(),
            test_url: "https://www.gstatic.com/generate_204".to_string(),
            expected_status: IntRanges::default(),
            timeout: DEFAULT_FAILED_WINDOW,
            max_failed_times: DEFAULT_MAX_FAILED_TIMES,
            disable_udp: false,
        }
    }
}

#[derive(Default)]
struct ProxyCache {
    versions: Vec<u32>,
    proxies: Vec<Arc<Proxy>>,
}

#[derive(Default)]
struct FailState {
    times: u32,
    first: Option<Instant>,
}

/// State and behaviour shared by all groups
pub struct GroupBase {
    name: String,
    providers: Vec<Arc<dyn ProxyProvider>>,
    filters: Vec<Regex>,
    exclude_filters: Vec<Regex>,
    exclude_types: Vec<String>,
    test_url: String,
    expected_status: IntRanges<u16>,
    timeout: Duration,
    max_failed_times: u32,
    disable_udp: bool,
    cache: Mutex<Option<ProxyCache>>,
    failed: Mutex<FailState>,
    compatible: Arc<Proxy>,
}

fn compile_filters(group: &str, expr: &str) -> Result<Vec<Regex>, GroupError> {
    expr.split('`')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| {
            Regex::new(f).map_err(|_| GroupError::InvalidFilter {
                group: group.to_string(),
                pattern: f.to_string(),
            })
        })
        .collect()
}

impl GroupBase {
    /// # Errors
    ///
    /// Returns `GroupError::InvalidFilter` for a bad regex.
    pub fn new(options: GroupOptions, providers: Vec<Arc<dyn ProxyProvider>>) -> Result<Self, GroupError> {
        let filters = compile_filters(&options.name, &options.filter)?;
        let exclude_filters = compile_filters(&options.name, &options.exclude_filter)?;
        let exclude_types = options
            .exclude_type
            .split('|')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let timeout = if options.timeout.is_zero() {
            DEFAULT_FAILED_WINDOW
        } else {
            options.timeout
        };
        let max_failed_times = if options.max_failed_times == 0 {
            DEFAULT_MAX_FAILED_TIMES
        } else {
            options.max_failed_times
        };
        Ok(Self {
            name: options.name,
            providers,
            filters,
            exclude_filters,
            exclude_types,
            test_url: options.test_url,
            expected_status: options.expected_status,
            timeout,
            max_failed_times,
            disable_udp: options.disable_udp,
            cache: Mutex::new(None),
            failed: Mutex::new(FailState::default()),
            compatible: Arc::new(Proxy::new(Arc::new(Compatible::new()))),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn test_url(&self) -> &str {
        &self.test_url
    }

    #[must_use]
    pub const fn expected_status(&self) -> &IntRanges<u16> {
        &self.expected_status
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn disable_udp(&self) -> bool {
        self.disable_udp
    }

    #[must_use]
    pub fn providers(&self) -> &[Arc<dyn ProxyProvider>] {
        &self.providers
    }

    /// Stand-in used when no member survives filtering
    #[must_use]
    pub fn compatible(&self) -> Arc<Proxy> {
        Arc::clone(&self.compatible)
    }

    /// Current members; never empty
    ///
    /// With `touch` the providers are marked as used. The filtered list is
    /// rebuilt only when a provider's version changes.
    pub fn get_proxies(&self, touch: bool) -> Vec<Arc<Proxy>> {
        let versions: Vec<u32> = self
            .providers
            .iter()
            .map(|p| {
                if touch {
                    p.touch();
                }
                p.version()
            })
            .collect();

        let mut cache = self.cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.versions == versions {
                return cached.proxies.clone();
            }
        }
        let mut proxies = self.collect_proxies();
        if proxies.is_empty() {
            proxies.push(self.compatible());
        }
        debug!(group = %self.name, members = proxies.len(), "group members rebuilt");
        *cache = Some(ProxyCache {
            versions,
            proxies: proxies.clone(),
        });
        proxies
    }

    fn collect_proxies(&self) -> Vec<Arc<Proxy>> {
        let mut seen = HashSet::new();
        let mut proxies = Vec::new();
        let mut push = |p: &Arc<Proxy>, proxies: &mut Vec<Arc<Proxy>>| {
            if seen.insert(p.name().to_string()) {
                proxies.push(Arc::clone(p));
            }
        };

        let mut filtered: Vec<Vec<Arc<Proxy>>> = Vec::new();
        for provider in &self.providers {
            let members = provider.proxies();
            if self.filters.is_empty() || provider.vehicle_type() == VehicleType::Compatible {
                for p in &members {
                    push(p, &mut proxies);
                }
            } else {
                filtered.push(members);
            }
        }
        // Filter order wins over provider order.
        for filter in &self.filters {
            for members in &filtered {
                for p in members.iter().filter(|p| filter.is_match(p.name())) {
                    push(p, &mut proxies);
                }
            }
        }

        proxies.retain(|p| {
            !self.exclude_filters.iter().any(|re| re.is_match(p.name()))
                && !self.exclude_types.iter().any(|t| p.adapter_type().eq_name(t))
        });
        proxies
    }

    /// Mark every provider as used
    pub fn touch(&self) {
        for provider in &self.providers {
            provider.touch();
        }
    }

    /// Count a failed dial through `proxy_type`
    ///
    /// Built-in adapters and unsupported operations do not count. Reaching
    /// `max_failed_times` within `timeout` of the first failure starts a
    /// health check of every provider. Returns whether one was started.
    pub fn on_dial_failed(&self, proxy_type: &AdapterType, err: &AdapterError) -> bool {
        if matches!(
            proxy_type,
            AdapterType::Direct
                | AdapterType::Compatible
                | AdapterType::Reject
                | AdapterType::RejectDrop
                | AdapterType::Pass
        ) || matches!(err, AdapterError::Unsupported { .. } | AdapterError::UdpUnsupported(_))
        {
            return false;
        }

        let mut failed = self.failed.lock();
        failed.times += 1;
        let now = Instant::now();
        match failed.first {
            Some(first) if failed.times > 1 => {
                if now.saturating_duration_since(first) > self.timeout {
                    *failed = FailState::default();
                    return false;
                }
            }
            _ => failed.first = Some(now),
        }
        debug!(group = %self.name, times = failed.times, error = %err, "group dial failed");
        if failed.times < self.max_failed_times {
            return false;
        }
        *failed = FailState::default();
        drop(failed);

        warn!(group = %self.name, "dial failed repeatedly, starting health check");
        for provider in &self.providers {
            let provider = Arc::clone(provider);
            tokio::spawn(async move { provider.check().await });
        }
        true
    }

    /// Reset the failure count after a successful dial
    pub fn on_dial_success(&self) {
        *self.failed.lock() = FailState::default();
    }

    /// Probe every member with `url` and return the delays of live ones
    pub async fn url_test(&self, url: &str, expected: &IntRanges<u16>) -> HashMap<String, u16> {
        let mut set = JoinSet::new();
        for proxy in self.get_proxies(false) {
            let url = url.to_string();
            let expected = expected.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let delay = proxy.url_test(&url, &expected, timeout).await.ok();
                (proxy.name().to_string(), delay)
            });
        }
        let mut delays = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((name, Some(delay))) = joined {
                delays.insert(name, delay);
            }
        }
        delays
    }

    /// Stop every provider's health check
    pub fn close(&self) {
        for provider in &self.providers {
            provider.close();
        }
    }
}

impl fmt::Debug for GroupBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupBase")
            .field("name", &self.name)
            .field("providers", &self.providers.len())
            .field("test_url", &self.test_url)
            .finish_non_exhaustive()
    }
}

/// Group-level operations on top of [`ProxyAdapter`]
#[async_trait]
pub trait ProxyGroup: Send + Sync + fmt::Debug {
    fn base(&self) -> &GroupBase;

    fn kind(&self) -> GroupKind;

    /// Name of the member currently in use
    fn now(&self) -> String;

    fn name(&self) -> &str {
        self.base().name()
    }

    /// Current members
    fn all(&self) -> Vec<Arc<Proxy>> {
        self.base().get_proxies(false)
    }

    /// Choose a member by name
    ///
    /// # Errors
    ///
    /// Returns `GroupError::ProxyNotExist` if no member has that name, or
    /// `GroupError::UnsupportedType` for groups without manual selection.
    fn set(&self, _name: &str) -> Result<(), GroupError> {
        Err(GroupError::UnsupportedType(format!("{:?} has no manual selection", self.kind())))
    }

    /// Choose a member by name without checking it exists
    fn force_set(&self, _name: &str) {}

    /// Mark the group's providers as used
    fn touch(&self) {
        self.base().touch();
    }

    /// Probe every member now
    async fn url_test(&self, url: &str, expected: &IntRanges<u16>) -> HashMap<String, u16> {
        self.base().url_test(url, expected).await
    }

    /// Stop the group's health checks
    fn close(&self) {
        self.base().close();
    }
}

/// Build a group of `kind`, returning its group and adapter views
///
/// # Errors
///
/// Returns `GroupError` for invalid filters or strategy names.
pub fn new_group(
    kind: GroupKind,
    options: GroupOptions,
    providers: Vec<Arc<dyn ProxyProvider>>,
    tolerance: u16,
    strategy: &str,
) -> Result<(Arc<dyn ProxyGroup>, Arc<dyn ProxyAdapter>), GroupError> {
    fn views<G: ProxyGroup + ProxyAdapter + 'static>(
        group: G,
    ) -> (Arc<dyn ProxyGroup>, Arc<dyn ProxyAdapter>) {
        let group = Arc::new(group);
        (Arc::clone(&group) as Arc<dyn ProxyGroup>, group as Arc<dyn ProxyAdapter>)
    }

    let base = GroupBase::new(options, providers)?;
    Ok(match kind {
        GroupKind::Selector => views(Selector::new(base)),
        GroupKind::Fallback => views(Fallback::new(base)),
        GroupKind::UrlTest => views(UrlTest::new(base, tolerance)),
        GroupKind::LoadBalance => views(LoadBalance::new(base, Strategy::parse(strategy)?)),
        GroupKind::Relay => views(Relay::new(base)),
    })
}
