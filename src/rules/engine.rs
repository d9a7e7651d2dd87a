//! Hot-reloadable rule engine.
//!
//! The engine holds an immutable [`RuleSnapshot`] (ordered rules, the sub-rule
//! graph and the rule provider registry) behind an `ArcSwap`, so matching never
//! takes a lock and a reload is a single atomic swap.
//!
//! ```text
//! Metadata -> RuleEngine::match_metadata() -> ArcSwap::load_full() -> RuleSnapshot
//!                                                   |
//!                                            (lock-free read)
//!
//! Reload -> RuleEngine::reload() -> ArcSwap::store() -> old snapshot dropped
//!                                                       when readers finish
//! ```
//!
//! # Example
//!
//! ```
//! use meta_router::metadata::{Metadata, Network};
//! use meta_router::rules::{RuleEngine, RuleSnapshot};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let snapshot = RuleSnapshot::builder()
//!     .rules(&["DOMAIN-SUFFIX,google.com,proxy", "MATCH,DIRECT"])
//!     .build()
//!     .unwrap();
//! let engine = RuleEngine::new(snapshot);
//!
//! let mut m = Metadata::new(Network::Tcp).with_host("www.google.com");
//! let outcome = engine.match_metadata(&mut m, None, None, &|_, _| true).await;
//! assert_eq!(outcome.adapter, "proxy");
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, trace};

use super::logic::{SubRuleGraph, SubRules};
use super::parser::{verify_sub_rules, RuleParser};
use super::{Rule, RuleMatchHelper};
use crate::dns::Resolver;
use crate::error::RuleError;
use crate::metadata::Metadata;
use crate::process::ProcessFinder;
use crate::provider::RuleProviderRegistry;

/// Adapter used when no rule matches
pub const DEFAULT_ADAPTER: &str = "DIRECT";

/// Decides whether a matched adapter may carry a connection
pub type AdapterFilter = dyn Fn(&str, &Metadata) -> bool + Send + Sync;

/// Result of matching one connection
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Adapter to use
    pub adapter: String,
    /// Matching rule, `None` when the default was used
    pub rule: Option<Arc<dyn Rule>>,
}

impl MatchOutcome {
    /// Check if this result used the default adapter
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.rule.is_none()
    }
}

/// Immutable rule configuration
pub struct RuleSnapshot {
    rules: Vec<Arc<dyn Rule>>,
    sub_rules: Arc<SubRuleGraph>,
    providers: Arc<RuleProviderRegistry>,
    version: u64,
}

impl RuleSnapshot {
    /// Start building a snapshot
    #[must_use]
    pub fn builder() -> RuleSnapshotBuilder {
        RuleSnapshotBuilder::default()
    }

    /// Snapshot without rules
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            sub_rules: Arc::new(SubRuleGraph::new()),
            providers: Arc::new(RuleProviderRegistry::new()),
            version: 0,
        }
    }

    /// Ordered top-level rules
    #[must_use]
    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    /// Named sub-rule lists
    #[must_use]
    pub fn sub_rules(&self) -> Option<&SubRules> {
        self.sub_rules.get()
    }

    /// Rule provider registry
    #[must_use]
    pub fn providers(&self) -> &Arc<RuleProviderRegistry> {
        &self.providers
    }

    /// Configuration version
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }
}

impl fmt::Debug for RuleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSnapshot")
            .field("rules", &self.rules.len())
            .field("sub_rules", &self.sub_rules.get().map_or(0, HashMap::len))
            .field("providers", &self.providers.len())
            .field("version", &self.version)
            .finish()
    }
}

/// Builder for [`RuleSnapshot`]
#[derive(Default)]
pub struct RuleSnapshotBuilder {
    rules: Vec<String>,
    sub_rules: Vec<(String, Vec<String>)>,
    providers: Option<Arc<RuleProviderRegistry>>,
    version: u64,
}

impl RuleSnapshotBuilder {
    /// Top-level rule lines, in order
    #[must_use]
    pub fn rules<S: AsRef<str>>(mut self, lines: &[S]) -> Self {
        self.rules = lines.iter().map(|l| l.as_ref().to_string()).collect();
        self
    }

    /// Add a named sub-rule list
    #[must_use]
    pub fn sub_rule<S: AsRef<str>>(mut self, name: impl Into<String>, lines: &[S]) -> Self {
        self.sub_rules.push((
            name.into(),
            lines.iter().map(|l| l.as_ref().to_string()).collect(),
        ));
        self
    }

    /// Provider registry for `RULE-SET`
    #[must_use]
    pub fn providers(mut self, providers: Arc<RuleProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Configuration version
    #[must_use]
    pub const fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Parse everything into a snapshot
    ///
    /// Sub-rule lists are parsed first, checked for missing targets and
    /// loops, then frozen before the top-level rules are parsed.
    ///
    /// # Errors
    ///
    /// Returns the first `RuleError` encountered.
    pub fn build(self) -> Result<RuleSnapshot, RuleError> {
        let providers = self
            .providers
            .unwrap_or_else(|| Arc::new(RuleProviderRegistry::new()));
        let graph = Arc::new(SubRuleGraph::new());
        let parser = RuleParser::new()
            .with_sub_rules(&graph)
            .with_providers(Arc::clone(&providers));

        let mut sub_rules = SubRules::new();
        for (name, lines) in &self.sub_rules {
            sub_rules.insert(name.clone(), parser.parse_lines(lines)?);
        }
        let rules = parser.parse_lines(&self.rules)?;
        verify_sub_rules(&sub_rules, &rules)?;
        // Freshly created graph; the set cannot fail.
        let _ = graph.set(sub_rules);

        Ok(RuleSnapshot {
            rules,
            sub_rules: graph,
            providers,
            version: self.version,
        })
    }
}

/// Hot-reloadable rule engine.
pub struct RuleEngine {
    snapshot: ArcSwap<RuleSnapshot>,
}

impl RuleEngine {
    /// Create a new rule engine with an initial snapshot.
    #[must_use]
    pub fn new(snapshot: RuleSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn load(&self) -> Arc<RuleSnapshot> {
        self.snapshot.load_full()
    }

    /// Swap in a new snapshot
    pub fn reload(&self, snapshot: RuleSnapshot) {
        debug!(
            version = snapshot.version,
            rules = snapshot.rules.len(),
            "rule snapshot reloaded"
        );
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Current snapshot version
    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Match against the top-level rules
    ///
    /// Each matching rule's adapter is offered to `accept`; a rejected adapter
    /// (unknown, or unable to carry this network) lets matching continue. When
    /// nothing is accepted the result is [`DEFAULT_ADAPTER`].
    pub async fn match_metadata(
        &self,
        metadata: &mut Metadata,
        resolver: Option<&dyn Resolver>,
        process_finder: Option<&dyn ProcessFinder>,
        accept: &AdapterFilter,
    ) -> MatchOutcome {
        let snapshot = self.load();
        match_rules(snapshot.rules(), metadata, resolver, process_finder, accept).await
    }

    /// Match against a named sub-rule list instead of the top-level rules
    pub async fn match_sub_rules(
        &self,
        name: &str,
        metadata: &mut Metadata,
        resolver: Option<&dyn Resolver>,
        process_finder: Option<&dyn ProcessFinder>,
        accept: &AdapterFilter,
    ) -> MatchOutcome {
        let snapshot = self.load();
        let rules = snapshot
            .sub_rules()
            .and_then(|s| s.get(name))
            .map_or(&[][..], Vec::as_slice);
        match_rules(rules, metadata, resolver, process_finder, accept).await
    }
}

async fn match_rules(
    rules: &[Arc<dyn Rule>],
    metadata: &mut Metadata,
    resolver: Option<&dyn Resolver>,
    process_finder: Option<&dyn ProcessFinder>,
    accept: &AdapterFilter,
) -> MatchOutcome {
    let helper = RuleMatchHelper::new(resolver, process_finder);
    for rule in rules {
        let Some(adapter) = rule.matches(metadata, &helper).await else {
            continue;
        };
        if !accept(&adapter, metadata) {
            trace!(adapter = %adapter, rule = %rule.rule_type(), "adapter rejected, continue");
            continue;
        }
        return MatchOutcome {
            adapter,
            rule: Some(Arc::clone(rule)),
        };
    }
    MatchOutcome {
        adapter: DEFAULT_ADAPTER.to_string(),
        rule: None,
    }
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("snapshot", &*self.snapshot.load())
            .finish()
    }
}
