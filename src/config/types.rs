//! Configuration types for meta-router
//!
//! Configuration is loaded from JSON and validated at startup. Shape checks
//! (names, duplicates, enum values) happen here; cross references that need
//! built objects, such as group members and rule targets, are checked when
//! [`RouterState`](crate::state::RouterState) is built.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::IntRanges;
use crate::error::ConfigError;
use crate::group::{GroupKind, Strategy};
use crate::provider::healthcheck::{HealthCheckOptions, DEFAULT_TIMEOUT};
use crate::provider::overrides::{OverrideSchema, ProxyOptions};
use crate::provider::{RuleBehavior, RuleFormat};
use crate::tunnel::Mode;

/// Names that always exist and cannot be redefined
pub const RESERVED_NAMES: [&str; 6] = ["DIRECT", "REJECT", "REJECT-DROP", "PASS", "COMPATIBLE", "GLOBAL"];

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Routing mode
    #[serde(default)]
    pub mode: Mode,

    /// Idle timeout of a UDP flow in seconds
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,

    /// Proxy option maps (`{"name": .., "type": .., ..}`)
    #[serde(default)]
    pub proxies: Vec<ProxyOptions>,

    /// Named proxy providers
    #[serde(default)]
    pub proxy_providers: BTreeMap<String, ProxyProviderConfig>,

    /// Proxy groups, in declaration order
    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroupConfig>,

    /// Named rule providers for `RULE-SET`
    #[serde(default)]
    pub rule_providers: BTreeMap<String, RuleProviderConfig>,

    /// Rule lines `TYPE,PAYLOAD,TARGET[,PARAMS]`
    #[serde(default)]
    pub rules: Vec<String>,

    /// Named rule lists for `SUB-RULE`
    #[serde(default)]
    pub sub_rules: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;

        if self.udp_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "udp_timeout_secs must be greater than 0".into(),
            ));
        }

        let mut names: HashSet<&str> = HashSet::new();
        for options in &self.proxies {
            let name = match options.get("name").and_then(serde_json::Value::as_str) {
                Some(name) if !name.is_empty() => name,
                _ => return Err(ConfigError::ValidationError("proxy without a name".into())),
            };
            if !options.get("type").is_some_and(serde_json::Value::is_string) {
                return Err(ConfigError::ValidationError(format!("proxy {name} has no type")));
            }
            check_name(&mut names, name, "proxy")?;
        }

        for group in &self.proxy_groups {
            group.validate()?;
            check_name(&mut names, &group.name, "proxy group")?;
            for provider in &group.use_providers {
                if !self.proxy_providers.contains_key(provider) {
                    return Err(ConfigError::ValidationError(format!(
                        "proxy group {} uses unknown provider {provider}",
                        group.name
                    )));
                }
            }
        }

        for (name, provider) in &self.proxy_providers {
            provider.validate(name)?;
        }

        for (name, provider) in &self.rule_providers {
            provider.validate(name)?;
        }

        for (name, lines) in &self.sub_rules {
            if name.is_empty() {
                return Err(ConfigError::ValidationError("sub-rule without a name".into()));
            }
            if lines.is_empty() {
                return Err(ConfigError::ValidationError(format!("sub-rule {name} is empty")));
            }
        }

        Ok(())
    }

    /// Idle timeout of a UDP flow
    #[must_use]
    pub const fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            udp_timeout_secs: default_udp_timeout_secs(),
            rules: vec!["MATCH,DIRECT".into()],
            ..Self::default()
        }
    }
}

fn check_name<'a>(names: &mut HashSet<&'a str>, name: &'a str, what: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::ValidationError(format!("{what} without a name")));
    }
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(ConfigError::ValidationError(format!("{what} name {name} is reserved")));
    }
    if !names.insert(name) {
        return Err(ConfigError::ValidationError(format!("Duplicate proxy name: {name}")));
    }
    Ok(())
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format: {}",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Health-check section of a proxy provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Run the periodic check
    #[serde(default)]
    pub enable: bool,

    /// Test URL
    #[serde(default = "default_test_url")]
    pub url: String,

    /// Seconds between checks
    #[serde(default)]
    pub interval: u64,

    /// Probe timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,

    /// Skip checks while the provider is unused
    #[serde(default = "default_true")]
    pub lazy: bool,

    /// Accepted status codes, e.g. `"200/204/300-399"`
    #[serde(default)]
    pub expected_status: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enable: false,
            url: default_test_url(),
            interval: 0,
            timeout: default_timeout_ms(),
            lazy: true,
            expected_status: String::new(),
        }
    }
}

impl HealthCheckConfig {
    /// Options for the provider's [`HealthCheck`](crate::provider::HealthCheck)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a malformed status list.
    pub fn options(&self) -> Result<HealthCheckOptions, ConfigError> {
        Ok(HealthCheckOptions {
            url: self.url.clone(),
            interval: if self.enable {
                Duration::from_secs(self.interval)
            } else {
                Duration::ZERO
            },
            timeout: Duration::from_millis(self.timeout),
            lazy: self.lazy,
            expected_status: parse_expected_status(&self.expected_status)?,
        })
    }
}

/// Inline proxy provider
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyProviderConfig {
    /// Proxy option maps
    #[serde(default)]
    pub payload: Vec<ProxyOptions>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Fields rewritten on every proxy before it is built
    #[serde(default, rename = "override")]
    pub overrides: OverrideSchema,
}

impl ProxyProviderConfig {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.payload.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "proxy provider {name} has no payload"
            )));
        }
        self.health_check.options().map(|_| ())
    }
}

/// One proxy group
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyGroupConfig {
    pub name: String,

    /// `select`, `fallback`, `url-test`, `load-balance` or `relay`
    #[serde(rename = "type")]
    pub kind: String,

    /// Member proxies or groups, in order
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Proxy providers whose proxies are members too
    #[serde(default, rename = "use")]
    pub use_providers: Vec<String>,

    /// Test URL, defaults to the provider's
    #[serde(default)]
    pub url: Option<String>,

    /// Seconds between checks; zero disables the periodic check
    #[serde(default)]
    pub interval: u64,

    /// Probe timeout and failure window in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,

    #[serde(default = "default_true")]
    pub lazy: bool,

    #[serde(default)]
    pub expected_status: String,

    /// Backtick-separated regexes selecting provider proxies
    #[serde(default)]
    pub filter: String,

    #[serde(default)]
    pub exclude_filter: String,

    /// `|`-separated adapter types to drop
    #[serde(default)]
    pub exclude_type: String,

    /// Load-balance strategy
    #[serde(default)]
    pub strategy: String,

    /// URL-test hysteresis in milliseconds
    #[serde(default)]
    pub tolerance: u16,

    #[serde(default)]
    pub max_failed_times: u32,

    #[serde(default)]
    pub disable_udp: bool,
}

impl ProxyGroupConfig {
    /// Group kind
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown type.
    pub fn group_kind(&self) -> Result<GroupKind, ConfigError> {
        GroupKind::parse(&self.kind).map_err(|e| ConfigError::ValidationError(format!("{}: {e}", self.name)))
    }

    /// Options of the group's own health check
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a malformed status list.
    pub fn health_check(&self) -> Result<HealthCheckOptions, ConfigError> {
        Ok(HealthCheckOptions {
            url: self.test_url(),
            interval: Duration::from_secs(self.interval),
            timeout: Duration::from_millis(self.timeout),
            lazy: self.lazy,
            expected_status: parse_expected_status(&self.expected_status)?,
        })
    }

    /// Test URL of the group
    #[must_use]
    pub fn test_url(&self) -> String {
        self.url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map_or_else(default_test_url, str::to_string)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.group_kind()?;
        if self.proxies.is_empty() && self.use_providers.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "proxy group {} has neither proxies nor use",
                self.name
            )));
        }
        if kind == GroupKind::LoadBalance {
            Strategy::parse(&self.strategy)
                .map_err(|e| ConfigError::ValidationError(format!("{}: {e}", self.name)))?;
        }
        parse_expected_status(&self.expected_status)?;
        Ok(())
    }
}

/// One rule provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleProviderConfig {
    pub behavior: RuleBehavior,

    #[serde(default)]
    pub format: RuleFormat,

    /// File to load, relative paths resolved against the working directory
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Inline lines, used when there is no path
    #[serde(default)]
    pub payload: Vec<String>,

    /// Seconds between reloads of `path`; zero disables reloading
    #[serde(default)]
    pub interval: u64,
}

impl RuleProviderConfig {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.path.is_none() && self.payload.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "rule provider {name} needs a path or a payload"
            )));
        }
        if self.format == RuleFormat::Binary {
            if self.behavior != RuleBehavior::IpCidr {
                return Err(ConfigError::ValidationError(format!(
                    "rule provider {name}: behavior {} does not support the binary format",
                    self.behavior
                )));
            }
            if self.path.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "rule provider {name}: binary format needs a path"
                )));
            }
        }
        Ok(())
    }
}

fn parse_expected_status(expr: &str) -> Result<IntRanges<u16>, ConfigError> {
    IntRanges::parse(expr)
        .map_err(|e| ConfigError::ValidationError(format!("Invalid expected_status {expr:?}: {e}")))
}

const fn default_true() -> bool {
    true
}

const fn default_udp_timeout_secs() -> u64 {
    60
}

#[allow(clippy::cast_possible_truncation)]
const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_test_url() -> String {
    HealthCheckOptions::default().url
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
