//! Rule matching
//!
//! A rule inspects a connection's [`Metadata`] and, on a match, names the
//! adapter that should carry it. Rules are evaluated in order by the
//! [`RuleEngine`]; the first match wins.
//!
//! - [`common`], [`domain`], [`ip`], [`process`]: leaf predicates
//! - [`logic`]: `AND` / `OR` / `NOT` / `SUB-RULE` combinators
//! - [`ruleset`]: `RULE-SET`, delegating to a named rule provider
//! - [`parser`]: rule lines to rule objects
//! - [`engine`]: hot-reloadable snapshot and the match loop
//!
//! # Side effects
//!
//! Some rules need information that is expensive to obtain: IP rules need the
//! destination IP of a host-only connection, process rules need the owning
//! process. Rules request it through a [`RuleMatchHelper`], which performs each
//! lookup at most once per match attempt and only when a rule asks for it.
//!
//! # Example
//!
//! ```
//! use meta_router::metadata::{Metadata, Network};
//! use meta_router::rules::{RuleMatchHelper, RuleParser};
//!
//! # tokio_test_block(async {
//! let parser = RuleParser::new();
//! let rule = parser
//!     .parse_line("AND,((DOMAIN,baidu.com),(NETWORK,TCP),(DST-PORT,10001-65535)),proxy")
//!     .unwrap();
//!
//! let mut m = Metadata::new(Network::Tcp).with_host("baidu.com");
//! m.dst_port = 20000;
//! let helper = RuleMatchHelper::empty();
//! assert_eq!(rule.matches(&mut m, &helper).await.as_deref(), Some("proxy"));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod common;
pub mod domain;
pub mod engine;
pub mod ip;
pub mod logic;
pub mod parser;
pub mod process;
pub mod ruleset;
pub mod types;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dns::Resolver;
use crate::metadata::{unmap, Metadata};
use crate::process::ProcessFinder;

pub use engine::{MatchOutcome, RuleEngine, RuleSnapshot};
pub use logic::{Logic, SubRules};
pub use parser::RuleParser;
pub use ruleset::RuleSet;
pub use types::{parse_rule_payload, RuleLine, RuleType};

/// A routing rule
///
/// `matches` returns the adapter name on a match. Logic and sub-rule
/// combinators may return an adapter other than their own.
#[async_trait]
pub trait Rule: Send + Sync + fmt::Debug {
    /// Kind of this rule
    fn rule_type(&self) -> RuleType;

    /// Match `metadata`, possibly filling it in through `helper`
    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>)
        -> Option<String>;

    /// Adapter (or sub-rule list, for `SUB-RULE`) named by this rule
    fn adapter(&self) -> &str;

    /// Payload as written, or a normalized form for logic rules
    fn payload(&self) -> &str;

    /// Names of rule providers this rule depends on
    fn provider_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether matching may need the destination IP of a host
    fn should_resolve_ip(&self) -> bool {
        false
    }

    /// Whether matching needs the owning process
    fn should_find_process(&self) -> bool {
        false
    }
}

/// Lazy side effects available to rules during one match attempt
///
/// Each lookup runs at most once per match attempt, and only when a rule
/// asks. Helpers derived with [`without_resolve`](Self::without_resolve)
/// share the process lookup with their parent.
pub struct RuleMatchHelper<'a> {
    resolver: Option<&'a dyn Resolver>,
    process_finder: Option<&'a dyn ProcessFinder>,
    resolve_attempted: AtomicBool,
    process_attempted: Arc<AtomicBool>,
}

impl<'a> RuleMatchHelper<'a> {
    /// Create a helper with the given capabilities
    #[must_use]
    pub fn new(
        resolver: Option<&'a dyn Resolver>,
        process_finder: Option<&'a dyn ProcessFinder>,
    ) -> Self {
        Self {
            resolver,
            process_finder,
            resolve_attempted: AtomicBool::new(false),
            process_attempted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Helper that never resolves and never looks up processes
    #[must_use]
    pub fn empty() -> Self {
        Self::new(None, None)
    }

    /// Same capabilities minus DNS resolution
    #[must_use]
    pub fn without_resolve(&self) -> RuleMatchHelper<'a> {
        RuleMatchHelper {
            resolver: None,
            process_finder: self.process_finder,
            resolve_attempted: AtomicBool::new(true),
            process_attempted: Arc::clone(&self.process_attempted),
        }
    }

    /// Fill `metadata.dst_ip` from its host, at most once
    ///
    /// Failure is logged and leaves the metadata unresolved, so IP rules
    /// simply do not match.
    pub async fn resolve_ip(&self, metadata: &mut Metadata) {
        if metadata.resolved() || metadata.host.is_empty() {
            return;
        }
        let Some(resolver) = self.resolver else {
            return;
        };
        if self.resolve_attempted.swap(true, Ordering::AcqRel) {
            return;
        }
        match resolver.resolve_ip(&metadata.host).await {
            Ok(ip) => {
                debug!(host = %metadata.host, ip = %ip, "resolved for rule matching");
                metadata.dst_ip = Some(unmap(ip));
            }
            Err(e) => debug!(host = %metadata.host, error = %e, "rule resolve failed"),
        }
    }

    /// Fill the process fields of `metadata`, at most once
    pub fn find_process(&self, metadata: &mut Metadata) {
        if !metadata.process.is_empty() {
            return;
        }
        let (Some(finder), Some(src_ip)) = (self.process_finder, metadata.src_ip) else {
            return;
        };
        if self.process_attempted.swap(true, Ordering::AcqRel) {
            return;
        }
        match finder.find_process(metadata.network, src_ip, metadata.src_port) {
            Some(info) => {
                metadata.process = info.name().to_string();
                metadata.process_path = info.path.clone();
                metadata.uid = info.uid;
            }
            None => debug!(source = %metadata.source_address(), "process not found"),
        }
    }
}

impl fmt::Debug for RuleMatchHelper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleMatchHelper")
            .field("resolver", &self.resolver.is_some())
            .field("process_finder", &self.process_finder.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use crate::metadata::Network;
    use crate::process::ProcessInfo;
    use std::io;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver(AtomicUsize);

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn resolve_ip(&self, _host: &str) -> io::Result<IpAddr> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::NotFound, "nx"))
        }
    }

    struct FixedFinder;

    impl ProcessFinder for FixedFinder {
        fn find_process(&self, _: Network, _: IpAddr, _: u16) -> Option<ProcessInfo> {
            Some(ProcessInfo {
                path: "/usr/bin/curl".into(),
                uid: Some(1000),
            })
        }
    }

    #[tokio::test]
    async fn test_resolve_fills_dst_ip() {
        let resolver = StaticResolver::new().with_host("a.com", "1.2.3.4".parse().unwrap());
        let helper = RuleMatchHelper::new(Some(&resolver), None);
        let mut m = Metadata::new(Network::Tcp).with_host("a.com");
        helper.resolve_ip(&mut m).await;
        assert_eq!(m.dst_ip, Some("1.2.3.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_resolve_attempted_once() {
        let resolver = CountingResolver(AtomicUsize::new(0));
        let helper = RuleMatchHelper::new(Some(&resolver), None);
        let mut m = Metadata::new(Network::Tcp).with_host("nx.example");
        helper.resolve_ip(&mut m).await;
        helper.resolve_ip(&mut m).await;
        assert_eq!(resolver.0.load(Ordering::SeqCst), 1);
        assert!(!m.resolved());
    }

    #[tokio::test]
    async fn test_without_resolve_skips_dns() {
        let resolver = CountingResolver(AtomicUsize::new(0));
        let helper = RuleMatchHelper::new(Some(&resolver), None);
        let inner = helper.without_resolve();
        let mut m = Metadata::new(Network::Tcp).with_host("a.com");
        inner.resolve_ip(&mut m).await;
        assert_eq!(resolver.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_find_process() {
        let finder = FixedFinder;
        let helper = RuleMatchHelper::new(None, Some(&finder));
        let mut m = Metadata::new(Network::Tcp).with_src("127.0.0.1".parse().unwrap(), 4000);
        helper.find_process(&mut m);
        assert_eq!(m.process, "curl");
        assert_eq!(m.process_path, "/usr/bin/curl");
        assert_eq!(m.uid, Some(1000));
    }
}
