//! Rule and proxy providers
//!
//! A rule provider is a named, independently reloadable rule set consumed by
//! `RULE-SET` rules. Its matching backend is a [`RuleStrategy`]:
//!
//! - [`classical`]: ordered rule lines, first match wins
//! - [`ipcidr`]: merged CIDR set with a binary form
//! - [`domain`]: domain set backed by Aho-Corasick
//!
//! A reload builds a fresh strategy (`reset`, `insert` every line,
//! `finish_insert`) and swaps it in atomically, so matching never observes a
//! half-loaded set.
//!
//! Proxy providers and the health-check actor live in [`proxy`] and
//! [`healthcheck`].

pub mod classical;
pub mod domain;
pub mod healthcheck;
pub mod ipcidr;
pub mod overrides;
pub mod proxy;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::metadata::Metadata;
use crate::rules::RuleMatchHelper;

pub use classical::ClassicalStrategy;
pub use domain::DomainStrategy;
pub use healthcheck::HealthCheck;
pub use ipcidr::{CidrSet, IpCidrStrategy};
pub use proxy::{CompatibleProvider, InlineProvider, ProxyProvider, VehicleType};

/// How a rule provider interprets its lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleBehavior {
    /// Rule lines without a target
    Classical,
    /// CIDR literals
    IpCidr,
    /// Domain patterns
    Domain,
}

impl RuleBehavior {
    /// Parse a behavior name
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::UnknownBehavior` for other names.
    pub fn parse(s: &str) -> Result<Self, ProviderError> {
        match s.to_ascii_lowercase().as_str() {
            "classical" => Ok(Self::Classical),
            "ipcidr" => Ok(Self::IpCidr),
            "domain" => Ok(Self::Domain),
            _ => Err(ProviderError::UnknownBehavior(s.to_string())),
        }
    }

    /// Get the behavior name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Classical => "classical",
            Self::IpCidr => "ipcidr",
            Self::Domain => "domain",
        }
    }
}

impl fmt::Display for RuleBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk format of a rule provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleFormat {
    /// One entry per line
    #[default]
    Text,
    /// Serialized `CidrSet`
    Binary,
}

impl RuleFormat {
    /// Parse a format name
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::UnknownFormat` for other names.
    pub fn parse(s: &str) -> Result<Self, ProviderError> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "binary" => Ok(Self::Binary),
            _ => Err(ProviderError::UnknownFormat(s.to_string())),
        }
    }
}

/// Matching backend of a rule provider
///
/// `insert` calls happen before `finish_insert`; `reset` clears everything.
#[async_trait]
pub trait RuleStrategy: Send + Sync + fmt::Debug {
    /// Behavior this strategy implements
    fn behavior(&self) -> RuleBehavior;

    /// Whether `metadata` belongs to the set
    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> bool;

    /// Add one line; malformed lines are logged and skipped
    fn insert(&mut self, line: &str);

    /// Freeze inserted lines for matching
    fn finish_insert(&mut self);

    /// Drop all state
    fn reset(&mut self);

    /// Number of successfully inserted entries
    fn count(&self) -> usize;

    /// Whether matching may resolve the destination host
    fn should_resolve_ip(&self) -> bool {
        false
    }

    /// Whether matching needs the owning process
    fn should_find_process(&self) -> bool {
        false
    }

    /// Binary form of the loaded set, if the strategy has one
    fn to_binary(&self) -> Option<Bytes> {
        None
    }
}

fn new_strategy(behavior: RuleBehavior) -> Box<dyn RuleStrategy> {
    match behavior {
        RuleBehavior::Classical => Box::new(ClassicalStrategy::new()),
        RuleBehavior::IpCidr => Box::new(IpCidrStrategy::new()),
        RuleBehavior::Domain => Box::new(DomainStrategy::new()),
    }
}

#[derive(Debug, Clone)]
struct FileSource {
    path: PathBuf,
    format: RuleFormat,
}

/// Named, reloadable rule set
pub struct RuleProvider {
    name: String,
    behavior: RuleBehavior,
    strategy: ArcSwap<Box<dyn RuleStrategy>>,
    version: AtomicU64,
    source: Option<FileSource>,
    interval: Duration,
    updated_at: Mutex<Option<SystemTime>>,
}

impl RuleProvider {
    /// Create an empty provider
    #[must_use]
    pub fn new(name: impl Into<String>, behavior: RuleBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            strategy: ArcSwap::from_pointee(new_strategy(behavior)),
            version: AtomicU64::new(0),
            source: None,
            interval: Duration::ZERO,
            updated_at: Mutex::new(None),
        }
    }

    /// Back the provider with a file, refreshed every `interval` (zero = never)
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>, format: RuleFormat, interval: Duration) -> Self {
        self.source = Some(FileSource {
            path: path.into(),
            format,
        });
        self.interval = interval;
        self
    }

    /// Provider name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider behavior
    #[must_use]
    pub const fn behavior(&self) -> RuleBehavior {
        self.behavior
    }

    /// Incremented on every successful load
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Entries in the current set
    #[must_use]
    pub fn count(&self) -> usize {
        self.strategy.load().count()
    }

    /// Time of the last successful load
    #[must_use]
    pub fn updated_at(&self) -> Option<SystemTime> {
        *self.updated_at.lock()
    }

    /// Replace the set with the lines of `text`
    ///
    /// Empty lines and `#` comments are ignored. Returns the new entry count.
    pub fn update_from_text(&self, text: &str) -> usize {
        let mut strategy = new_strategy(self.behavior);
        strategy.reset();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            strategy.insert(line);
        }
        strategy.finish_insert();
        self.install(strategy)
    }

    /// Replace the set with a serialized `CidrSet`
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::BinaryUnsupported` unless the behavior is
    /// `ipcidr`, or `ProviderError::InvalidBinary` for a corrupt blob.
    pub fn update_from_binary(&self, data: &[u8]) -> Result<usize, ProviderError> {
        if self.behavior != RuleBehavior::IpCidr {
            return Err(ProviderError::BinaryUnsupported(self.behavior.to_string()));
        }
        let strategy = IpCidrStrategy::from_binary(data)?;
        Ok(self.install(Box::new(strategy)))
    }

    /// Serialized form of the current set (`ipcidr` only)
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::BinaryUnsupported` for other behaviors.
    pub fn to_binary(&self) -> Result<Bytes, ProviderError> {
        self.strategy
            .load()
            .to_binary()
            .ok_or_else(|| ProviderError::BinaryUnsupported(self.behavior.to_string()))
    }

    fn install(&self, strategy: Box<dyn RuleStrategy>) -> usize {
        let count = strategy.count();
        self.strategy.store(Arc::new(strategy));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        *self.updated_at.lock() = Some(SystemTime::now());
        debug!(provider = %self.name, behavior = %self.behavior, count, version, "rule provider updated");
        count
    }

    /// Load `path` in the given format
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Io` if the file cannot be read, or a binary
    /// format error.
    pub fn load_file(&self, path: &Path, format: RuleFormat) -> Result<usize, ProviderError> {
        let data = std::fs::read(path)?;
        self.load_bytes(&data, format)
    }

    fn load_bytes(&self, data: &[u8], format: RuleFormat) -> Result<usize, ProviderError> {
        match format {
            RuleFormat::Text => Ok(self.update_from_text(&String::from_utf8_lossy(data))),
            RuleFormat::Binary => self.update_from_binary(data),
        }
    }

    /// Reload from the configured file
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NoSource` if the provider is not file-backed.
    pub async fn refresh(&self) -> Result<usize, ProviderError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| ProviderError::NoSource(self.name.clone()))?;
        let data = tokio::fs::read(&source.path).await?;
        self.load_bytes(&data, source.format)
    }

    /// Periodically reload a file-backed provider until `cancel` fires
    ///
    /// Returns `None` when there is no file or no interval.
    pub fn spawn_refresher(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.source.is_none() || self.interval.is_zero() {
            return None;
        }
        let provider = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(provider.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match provider.refresh().await {
                            Ok(count) => info!(provider = %provider.name, count, "rule provider refreshed"),
                            Err(e) => warn!(provider = %provider.name, error = %e, "rule provider refresh failed"),
                        }
                    }
                }
            }
            debug!(provider = %provider.name, "rule provider refresher stopped");
        }))
    }

    /// Whether `metadata` belongs to the current set
    pub async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> bool {
        let strategy = self.strategy.load_full();
        strategy.matches(metadata, helper).await
    }

    /// Whether matching may resolve the destination host
    #[must_use]
    pub fn should_resolve_ip(&self) -> bool {
        self.strategy.load().should_resolve_ip()
    }

    /// Whether matching needs the owning process
    #[must_use]
    pub fn should_find_process(&self) -> bool {
        self.strategy.load().should_find_process()
    }
}

impl fmt::Debug for RuleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleProvider")
            .field("name", &self.name)
            .field("behavior", &self.behavior)
            .field("count", &self.count())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

/// Rule providers by name
#[derive(Debug, Default)]
pub struct RuleProviderRegistry {
    providers: DashMap<String, Arc<RuleProvider>>,
}

impl RuleProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing one with the same name
    pub fn insert(&self, provider: Arc<RuleProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RuleProvider>> {
        self.providers.get(name).map(|p| Arc::clone(p.value()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered provider names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Every registered provider
    #[must_use]
    pub fn all(&self) -> Vec<Arc<RuleProvider>> {
        self.providers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
