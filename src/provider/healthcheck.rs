//! Background health checking
//!
//! A [`HealthCheck`] belongs to one proxy provider (or a group's compatible
//! provider) and probes that provider's proxies:
//!
//! - every `interval`, unless `lazy` and the owner was touched within the last
//!   `interval`;
//! - once when the loop starts;
//! - on demand through [`HealthCheck::check`].
//!
//! Overlapping triggers collapse into one pass through a [`SingleDo`] with a
//! one-second window. A pass probes the primary URL against every proxy and
//! each extra URL registered through
//! [`HealthCheck::register_health_check_task`] against the proxies its
//! filters select, at most [`MAX_CONCURRENT_PROBES`] at a time. Results land
//! in each [`Proxy`]'s per-URL history; nothing is returned to readers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::Proxy;
use crate::common::{IntRanges, SingleDo};

/// Probe timeout when the owner configures none
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Window in which repeated check triggers share one pass
pub const CHECK_DEDUP_WINDOW: Duration = Duration::from_secs(1);

/// Probes in flight per pass
pub const MAX_CONCURRENT_PROBES: usize = 10;

/// Construction options of a [`HealthCheck`]
#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    pub url: String,
    /// Zero disables the periodic loop
    pub interval: Duration,
    /// Zero means [`DEFAULT_TIMEOUT`]
    pub timeout: Duration,
    pub lazy: bool,
    pub expected_status: IntRanges<u16>,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            url: "https://www.gstatic.com/generate_204".to_string(),
            interval: Duration::ZERO,
            timeout: DEFAULT_TIMEOUT,
            lazy: true,
            expected_status: IntRanges::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ExtraOption {
    filters: BTreeSet<String>,
    expected_status: IntRanges<u16>,
}

impl ExtraOption {
    fn filter_regex(&self) -> Option<Regex> {
        if self.filters.is_empty() {
            return None;
        }
        let joined = self
            .filters
            .iter()
            .map(|f| format!("(?:{f})"))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&joined).ok()
    }
}

struct ProbeTask {
    url: String,
    expected_status: IntRanges<u16>,
    filter: Option<Regex>,
}

/// Periodic and on-demand prober of a proxy set
pub struct HealthCheck {
    url: String,
    expected_status: IntRanges<u16>,
    timeout: Duration,
    lazy: bool,
    interval_ms: AtomicU64,
    extra: RwLock<HashMap<String, ExtraOption>>,
    proxies: RwLock<Vec<Arc<Proxy>>>,
    last_touch: Mutex<Option<Instant>>,
    single_do: SingleDo<()>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl HealthCheck {
    /// Create a health check over `proxies`
    #[must_use]
    pub fn new(proxies: Vec<Arc<Proxy>>, options: HealthCheckOptions) -> Self {
        let timeout = if options.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            options.timeout
        };
        Self {
            url: options.url.trim().to_string(),
            expected_status: options.expected_status,
            timeout,
            lazy: options.lazy,
            interval_ms: AtomicU64::new(duration_ms(options.interval)),
            extra: RwLock::new(HashMap::new()),
            proxies: RwLock::new(proxies),
            last_touch: Mutex::new(None),
            single_do: SingleDo::new(CHECK_DEDUP_WINDOW),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Primary test URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Status codes counted as success on the primary URL
    #[must_use]
    pub const fn expected_status(&self) -> &IntRanges<u16> {
        &self.expected_status
    }

    /// Per-probe timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn lazy(&self) -> bool {
        self.lazy
    }

    /// Current check interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    /// Whether the periodic loop is enabled
    #[must_use]
    pub fn auto(&self) -> bool {
        !self.interval().is_zero()
    }

    /// Replace the probed proxy set
    pub fn set_proxies(&self, proxies: Vec<Arc<Proxy>>) {
        *self.proxies.write() = proxies;
    }

    /// Probed proxy set
    #[must_use]
    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.read().clone()
    }

    /// Mark the owner as used
    pub fn touch(&self) {
        *self.last_touch.lock() = Some(Instant::now());
    }

    /// Whether a periodic tick at `now` should probe
    ///
    /// Lazy checks skip ticks while the owner was touched within the last
    /// interval; a never touched owner is always due.
    #[must_use]
    pub fn should_check_at(&self, now: Instant) -> bool {
        if !self.lazy {
            return true;
        }
        match *self.last_touch.lock() {
            Some(touched) => now.saturating_duration_since(touched) >= self.interval(),
            None => true,
        }
    }

    /// Add an extra test URL, or extend the filters of a registered one
    ///
    /// The primary URL and blank URLs are ignored. `filter` holds
    /// backtick-separated regexes; invalid ones are skipped. A smaller
    /// non-zero `interval` shortens the check interval of an auto check.
    pub fn register_health_check_task(
        &self,
        url: &str,
        expected_status: IntRanges<u16>,
        filter: &str,
        interval: Duration,
    ) {
        let url = url.trim();
        if url.is_empty() || url == self.url {
            debug!(url = %url, "ignore health check url");
            return;
        }

        let mut extra = self.extra.write();
        let option = extra.entry(url.to_string()).or_insert_with(|| {
            if self.auto() && !interval.is_zero() && interval < self.interval() {
                self.interval_ms.store(duration_ms(interval), Ordering::Release);
            }
            ExtraOption {
                filters: BTreeSet::new(),
                expected_status,
            }
        });
        for f in filter.split('`').map(str::trim).filter(|f| !f.is_empty()) {
            if Regex::new(f).is_err() {
                warn!(url = %url, filter = %f, "invalid health check filter, skipped");
                continue;
            }
            option.filters.insert(f.to_string());
        }
    }

    /// Registered extra URLs
    #[must_use]
    pub fn extra_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.extra.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Start the periodic loop once; `None` if already started or not auto
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.auto() || self.started.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(tokio::spawn(Arc::clone(self).process()))
    }

    /// Periodic loop; returns on [`close`](Self::close)
    pub async fn process(self: Arc<Self>) {
        if !self.auto() {
            return;
        }
        {
            let hc = Arc::clone(&self);
            tokio::spawn(async move { hc.check().await });
        }
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval()) => {
                    if self.should_check_at(Instant::now()) {
                        self.check().await;
                    } else {
                        debug!(url = %self.url, "skip health check, owner is idle");
                    }
                }
            }
        }
        debug!(url = %self.url, "health check stopped");
    }

    /// Run a pass, or join the one in flight; returns when it has finished
    pub async fn check(self: &Arc<Self>) {
        if self.proxies.read().is_empty() {
            return;
        }
        let hc = Arc::clone(self);
        let ((), shared) = self.single_do.run(move || async move { hc.execute().await }).await;
        if shared {
            debug!(url = %self.url, "health check shared with a concurrent pass");
        }
    }

    async fn execute(&self) {
        let id = Uuid::new_v4();
        let proxies = self.proxies();
        let mut tasks = vec![ProbeTask {
            url: self.url.clone(),
            expected_status: self.expected_status.clone(),
            filter: None,
        }];
        tasks.extend(self.extra.read().iter().map(|(url, option)| ProbeTask {
            url: url.clone(),
            expected_status: option.expected_status.clone(),
            filter: option.filter_regex(),
        }));

        debug!(id = %id, proxies = proxies.len(), urls = tasks.len(), "health check start");
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut set = JoinSet::new();
        for task in &tasks {
            let expected = Arc::new(task.expected_status.clone());
            for proxy in &proxies {
                if let Some(filter) = &task.filter {
                    if !filter.is_match(proxy.name()) {
                        continue;
                    }
                }
                let proxy = Arc::clone(proxy);
                let url = task.url.clone();
                let expected = Arc::clone(&expected);
                let semaphore = Arc::clone(&semaphore);
                let timeout = self.timeout;
                let cancel = self.cancel.clone();
                set.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        _ = proxy.url_test(&url, &expected, timeout) => {}
                    }
                });
            }
        }
        while set.join_next().await.is_some() {}
        debug!(id = %id, "health check finished");
    }

    /// Stop the periodic loop and in-flight probes; idempotent
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether [`close`](Self::close) was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck")
            .field("url", &self.url)
            .field("interval", &self.interval())
            .field("lazy", &self.lazy)
            .field("timeout", &self.timeout)
            .field("extra", &self.extra_urls())
            .finish_non_exhaustive()
    }
}
