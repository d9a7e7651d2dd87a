//! Process-wide router state
//!
//! [`RouterState`] owns everything built from one configuration: adapters,
//! proxy and rule providers, proxy groups, the rule engine and the tunnel.
//! It is built once at startup and torn down with [`RouterState::shutdown`],
//! which stops every background task it started.
//!
//! Build order:
//!
//! 1. built-in adapters (`DIRECT`, `REJECT`, `REJECT-DROP`, `PASS`, `COMPATIBLE`)
//! 2. top-level `proxies`
//! 3. proxy providers
//! 4. proxy groups, members before the groups that contain them
//! 5. `GLOBAL`, a selector over everything above
//! 6. rule providers and rules

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterFactory, Compatible, Direct, Pass, Proxy, ProxyAdapter, Reject, RejectDrop};
use crate::config::{Config, ProxyGroupConfig, RuleProviderConfig};
use crate::dns::Resolver;
use crate::error::{ConfigError, GroupError, ProviderError, RouterError};
use crate::group::{new_group, GroupKind, GroupOptions, ProxyGroup};
use crate::process::ProcessFinder;
use crate::provider::healthcheck::HealthCheckOptions;
use crate::provider::{CompatibleProvider, InlineProvider, ProxyProvider, RuleProvider, RuleProviderRegistry};
use crate::rules::{RuleEngine, RuleSnapshot, RuleType};
use crate::tunnel::{Tunnel, DIRECT, GLOBAL};

/// Everything built from one configuration
pub struct RouterState {
    tunnel: Arc<Tunnel>,
    groups: HashMap<String, Arc<dyn ProxyGroup>>,
    proxy_providers: HashMap<String, Arc<dyn ProxyProvider>>,
    rule_providers: Arc<RuleProviderRegistry>,
    cancel: CancellationToken,
    refreshers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl RouterState {
    /// Build the router from `config`
    ///
    /// Must be called inside a tokio runtime: health checks and rule provider
    /// refreshers are spawned here.
    ///
    /// # Errors
    ///
    /// Returns the first error found while building adapters, providers,
    /// groups or rules. Nothing is left running on error.
    pub fn init(
        config: &Config,
        factory: &dyn AdapterFactory,
        resolver: Arc<dyn Resolver>,
        process_finder: Option<Arc<dyn ProcessFinder>>,
    ) -> Result<Self, RouterError> {
        config.validate()?;

        let mut proxies = builtin_proxies();
        let mut order: Vec<String> = vec![DIRECT.to_string(), "REJECT".to_string()];

        for options in &config.proxies {
            let adapter = factory.build(options)?;
            let name = adapter.name().to_string();
            debug!(proxy = %name, kind = %adapter.adapter_type(), "proxy built");
            proxies.insert(name.clone(), Arc::new(Proxy::new(adapter)));
            order.push(name);
        }

        let mut proxy_providers: HashMap<String, Arc<dyn ProxyProvider>> = HashMap::new();
        for (name, provider) in &config.proxy_providers {
            let inline = InlineProvider::new(
                name.clone(),
                &provider.payload,
                &provider.overrides,
                factory,
                provider.health_check.options()?,
            )?;
            proxy_providers.insert(name.clone(), Arc::new(inline));
        }

        let mut groups: HashMap<String, Arc<dyn ProxyGroup>> = HashMap::new();
        if let Err(e) = build_groups(config, &mut proxies, &proxy_providers, &mut groups) {
            close_all(&groups, &proxy_providers);
            return Err(e);
        }
        order.extend(config.proxy_groups.iter().map(|g| g.name.clone()));

        let (global, global_adapter) = global_group(&order, &proxies)?;
        proxies.insert(GLOBAL.to_string(), Arc::new(Proxy::new(global_adapter)));
        groups.insert(GLOBAL.to_string(), global);

        let cancel = CancellationToken::new();
        let rule_providers = Arc::new(RuleProviderRegistry::new());
        let mut refreshers = Vec::new();
        let snapshot = load_rule_providers(config, &rule_providers, &cancel, &mut refreshers)
            .and_then(|()| build_rules(config, &rule_providers, &proxies, 0));
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                cancel.cancel();
                close_all(&groups, &proxy_providers);
                return Err(e);
            }
        };

        for provider in proxy_providers.values() {
            provider.initial();
        }
        for group in groups.values() {
            for provider in group.base().providers() {
                provider.initial();
            }
        }

        let mut tunnel = Tunnel::new(Arc::new(RuleEngine::new(snapshot)), proxies, resolver)
            .with_mode(config.mode)
            .with_udp_timeout(config.udp_timeout());
        if let Some(finder) = process_finder {
            tunnel = tunnel.with_process_finder(finder);
        }

        info!(
            proxies = tunnel.proxies().len(),
            groups = groups.len(),
            rules = config.rules.len(),
            rule_providers = rule_providers.len(),
            mode = %config.mode,
            "router state initialized"
        );

        Ok(Self {
            tunnel: Arc::new(tunnel),
            groups,
            proxy_providers,
            rule_providers,
            cancel,
            refreshers: Mutex::new(refreshers),
            shutting_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Group by name
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&Arc<dyn ProxyGroup>> {
        self.groups.get(name)
    }

    /// Group names, sorted
    #[must_use]
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn proxy_provider(&self, name: &str) -> Option<&Arc<dyn ProxyProvider>> {
        self.proxy_providers.get(name)
    }

    #[must_use]
    pub fn rule_providers(&self) -> &Arc<RuleProviderRegistry> {
        &self.rule_providers
    }

    /// Select `member` in group `group`
    ///
    /// # Errors
    ///
    /// Returns `GroupError::ProxyNotExist` for an unknown group or member.
    pub fn select(&self, group: &str, member: &str) -> Result<(), GroupError> {
        self.groups
            .get(group)
            .ok_or_else(|| GroupError::ProxyNotExist(group.to_string()))?
            .set(member)
    }

    /// Replace the rules and sub-rules, keeping providers and proxies
    ///
    /// # Errors
    ///
    /// Returns the parse error and keeps the current rules if `config`'s
    /// rules are invalid.
    pub fn reload_rules(&self, config: &Config) -> Result<(), RouterError> {
        let engine = self.tunnel.rules();
        let snapshot = build_rules(
            config,
            &self.rule_providers,
            &self.tunnel.proxies(),
            engine.version() + 1,
        )?;
        engine.reload(snapshot);
        Ok(())
    }

    /// Stop health checks, provider refreshers and every UDP flow
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!("Shutting down router state");
        self.cancel.cancel();
        close_all(&self.groups, &self.proxy_providers);
        self.tunnel.nat().close_all();

        let refreshers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.refreshers.lock());
        for handle in refreshers {
            if let Err(e) = handle.await {
                warn!(error = %e, "rule provider refresher failed");
            }
        }
        debug!("Router state shut down");
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterState")
            .field("tunnel", &self.tunnel)
            .field("groups", &self.group_names())
            .field("rule_providers", &self.rule_providers.names())
            .finish_non_exhaustive()
    }
}

fn builtin_proxies() -> HashMap<String, Arc<Proxy>> {
    let adapters: [Arc<dyn ProxyAdapter>; 5] = [
        Arc::new(Direct::new(DIRECT)),
        Arc::new(Reject::new("REJECT")),
        Arc::new(RejectDrop::new("REJECT-DROP")),
        Arc::new(Pass::new("PASS")),
        Arc::new(Compatible::new()),
    ];
    adapters
        .into_iter()
        .map(|a| (a.name().to_string(), Arc::new(Proxy::new(a))))
        .collect()
}

fn close_all(groups: &HashMap<String, Arc<dyn ProxyGroup>>, providers: &HashMap<String, Arc<dyn ProxyProvider>>) {
    for group in groups.values() {
        group.close();
    }
    for provider in providers.values() {
        provider.close();
    }
}

/// Group indices ordered so every group comes after the groups it contains
fn group_order(groups: &[ProxyGroupConfig], proxies: &HashMap<String, Arc<Proxy>>) -> Result<Vec<usize>, GroupError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        New,
        Visiting,
        Done,
    }

    fn visit(
        index: usize,
        groups: &[ProxyGroupConfig],
        by_name: &HashMap<&str, usize>,
        proxies: &HashMap<String, Arc<Proxy>>,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> Result<(), GroupError> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::Visiting => return Err(GroupError::DependencyLoop(groups[index].name.clone())),
            Mark::New => {}
        }
        marks[index] = Mark::Visiting;
        for member in &groups[index].proxies {
            if let Some(&next) = by_name.get(member.as_str()) {
                visit(next, groups, by_name, proxies, marks, order)?;
            } else if !proxies.contains_key(member) {
                return Err(GroupError::UnknownMember {
                    group: groups[index].name.clone(),
                    member: member.clone(),
                });
            }
        }
        marks[index] = Mark::Done;
        order.push(index);
        Ok(())
    }

    let by_name: HashMap<&str, usize> = groups.iter().enumerate().map(|(i, g)| (g.name.as_str(), i)).collect();
    let mut marks = vec![Mark::New; groups.len()];
    let mut order = Vec::with_capacity(groups.len());
    for index in 0..groups.len() {
        visit(index, groups, &by_name, proxies, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn build_groups(
    config: &Config,
    proxies: &mut HashMap<String, Arc<Proxy>>,
    proxy_providers: &HashMap<String, Arc<dyn ProxyProvider>>,
    groups: &mut HashMap<String, Arc<dyn ProxyGroup>>,
) -> Result<(), RouterError> {
    for index in group_order(&config.proxy_groups, proxies)? {
        let group_config = &config.proxy_groups[index];
        let (group, adapter) = build_group(group_config, proxies, proxy_providers)?;
        info!(group = %group_config.name, kind = ?group.kind(), "proxy group built");
        proxies.insert(group_config.name.clone(), Arc::new(Proxy::new(adapter)));
        groups.insert(group_config.name.clone(), group);
    }
    Ok(())
}

fn build_group(
    config: &ProxyGroupConfig,
    proxies: &HashMap<String, Arc<Proxy>>,
    proxy_providers: &HashMap<String, Arc<dyn ProxyProvider>>,
) -> Result<(Arc<dyn ProxyGroup>, Arc<dyn ProxyAdapter>), RouterError> {
    let kind = config.group_kind()?;
    let health_check = config.health_check()?;

    let mut providers: Vec<Arc<dyn ProxyProvider>> = Vec::new();
    if !config.proxies.is_empty() {
        let members = config
            .proxies
            .iter()
            .map(|name| {
                proxies.get(name).cloned().ok_or_else(|| GroupError::UnknownMember {
                    group: config.name.clone(),
                    member: name.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        providers.push(Arc::new(CompatibleProvider::new(
            config.name.clone(),
            members,
            health_check.clone(),
        )?));
    }
    for name in &config.use_providers {
        let provider = proxy_providers
            .get(name)
            .ok_or_else(|| ProviderError::NotFound(name.clone()))?;
        if config.url.is_some() {
            provider.register_health_check_task(
                &health_check.url,
                health_check.expected_status.clone(),
                &config.filter,
                health_check.interval,
            );
        }
        providers.push(Arc::clone(provider));
    }

    let options = GroupOptions {
        filter: config.filter.clone(),
        exclude_filter: config.exclude_filter.clone(),
        exclude_type: config.exclude_type.clone(),
        test_url: health_check.url,
        expected_status: health_check.expected_status,
        timeout: Duration::from_millis(config.timeout),
        max_failed_times: config.max_failed_times,
        disable_udp: config.disable_udp,
        ..GroupOptions::new(config.name.clone())
    };
    Ok(new_group(kind, options, providers, config.tolerance, &config.strategy)?)
}

fn global_group(
    order: &[String],
    proxies: &HashMap<String, Arc<Proxy>>,
) -> Result<(Arc<dyn ProxyGroup>, Arc<dyn ProxyAdapter>), RouterError> {
    let members: Vec<Arc<Proxy>> = order.iter().filter_map(|name| proxies.get(name).cloned()).collect();
    let provider = CompatibleProvider::new(GLOBAL, members, HealthCheckOptions::default())?;
    Ok(new_group(
        GroupKind::Selector,
        GroupOptions::new(GLOBAL),
        vec![Arc::new(provider)],
        0,
        "",
    )?)
}

fn load_rule_providers(
    config: &Config,
    registry: &RuleProviderRegistry,
    cancel: &CancellationToken,
    refreshers: &mut Vec<JoinHandle<()>>,
) -> Result<(), RouterError> {
    for (name, provider_config) in &config.rule_providers {
        let provider = Arc::new(build_rule_provider(name, provider_config)?);
        if let Some(handle) = provider.spawn_refresher(cancel.child_token()) {
            refreshers.push(handle);
        }
        registry.insert(provider);
    }
    Ok(())
}

fn build_rule_provider(name: &str, config: &RuleProviderConfig) -> Result<RuleProvider, RouterError> {
    let provider = RuleProvider::new(name, config.behavior);
    let (provider, count) = match &config.path {
        Some(path) => {
            let provider = provider.with_file(path.clone(), config.format, Duration::from_secs(config.interval));
            let count = provider.load_file(path, config.format)?;
            (provider, count)
        }
        None => {
            let count = provider.update_from_text(&config.payload.join("\n"));
            (provider, count)
        }
    };
    info!(provider = %name, behavior = %config.behavior, count, "rule provider loaded");
    Ok(provider)
}

fn build_rules(
    config: &Config,
    providers: &Arc<RuleProviderRegistry>,
    proxies: &HashMap<String, Arc<Proxy>>,
    version: u64,
) -> Result<RuleSnapshot, RouterError> {
    let mut builder = RuleSnapshot::builder()
        .rules(&config.rules)
        .providers(Arc::clone(providers))
        .version(version);
    for (name, lines) in &config.sub_rules {
        builder = builder.sub_rule(name.clone(), lines);
    }
    let snapshot = builder.build()?;

    let sub_rules = snapshot.sub_rules().into_iter().flat_map(|s| s.values().flatten());
    for rule in snapshot.rules().iter().chain(sub_rules) {
        if rule.rule_type() != RuleType::SubRule && !proxies.contains_key(rule.adapter()) {
            return Err(ConfigError::ValidationError(format!(
                "rule {},{} targets unknown proxy {}",
                rule.rule_type(),
                rule.payload(),
                rule.adapter()
            ))
            .into());
        }
    }
    Ok(snapshot)
}
