//! Reading router configuration
//!
//! A configuration comes from a JSON file or string and is validated before
//! it is returned; [`load_config_with_env`] additionally applies the
//! `META_ROUTER_*` overrides listed on it.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;
use crate::tunnel::Mode;

const ENV_LOG_LEVEL: &str = "META_ROUTER_LOG_LEVEL";
const ENV_UDP_TIMEOUT: &str = "META_ROUTER_UDP_TIMEOUT_SECS";
const ENV_MODE: &str = "META_ROUTER_MODE";

/// Read, parse and validate the configuration at `path`
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` for a missing file, `ParseError` for
/// malformed JSON (the message names the file) and `ValidationError` for a
/// structurally invalid configuration.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }
    debug!(path = %path.display(), "reading configuration");

    let raw = std::fs::read_to_string(path)?;
    let config = parse(&raw).map_err(|e| match e {
        ConfigError::ParseError(reason) => {
            ConfigError::ParseError(format!("{}: {reason}", path.display()))
        }
        other => other,
    })?;

    info!(
        path = %path.display(),
        proxies = config.proxies.len(),
        proxy_providers = config.proxy_providers.len(),
        groups = config.proxy_groups.len(),
        rules = config.rules.len(),
        sub_rules = config.sub_rules.len(),
        rule_providers = config.rule_providers.len(),
        mode = %config.mode,
        "configuration loaded"
    );
    Ok(config)
}

/// Parse and validate a configuration held in memory
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    parse(json)
}

fn parse(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// [`load_config`], then environment overrides, then validation again
///
/// - `META_ROUTER_LOG_LEVEL`: log level
/// - `META_ROUTER_UDP_TIMEOUT_SECS`: UDP flow idle timeout in seconds
/// - `META_ROUTER_MODE`: routing mode (`rule`, `global`, `direct`)
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for an override that does not parse, or
/// any error of [`load_config`].
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    let invalid = |name: &str, reason: String| ConfigError::EnvError {
        name: name.to_string(),
        reason,
    };

    if let Some(level) = var(ENV_LOG_LEVEL) {
        debug!(from = %config.log.level, to = %level, "log level overridden");
        config.log.level = level;
    }
    if let Some(raw) = var(ENV_UDP_TIMEOUT) {
        let secs = raw
            .trim()
            .parse()
            .map_err(|_| invalid(ENV_UDP_TIMEOUT, format!("not a number of seconds: {raw}")))?;
        debug!(from = config.udp_timeout_secs, to = secs, "udp timeout overridden");
        config.udp_timeout_secs = secs;
    }
    if let Some(raw) = var(ENV_MODE) {
        let mode = Mode::parse(&raw).ok_or_else(|| invalid(ENV_MODE, format!("unknown mode: {raw}")))?;
        debug!(from = %config.mode, to = %mode, "mode overridden");
        config.mode = mode;
    }
    Ok(())
}

/// Write [`Config::default_config`] to `path` as pretty JSON
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&Config::default_config())
        .map_err(|e| ConfigError::ParseError(format!("serializing default configuration: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}
