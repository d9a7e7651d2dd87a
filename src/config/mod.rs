//! Configuration module for meta-router
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use meta_router::config::{load_config, Config};
//!
//! let config = load_config("/etc/meta-router/config.json").unwrap();
//! println!("Rules: {}", config.rules.len());
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, HealthCheckConfig, LogConfig, ProxyGroupConfig, ProxyProviderConfig, RuleProviderConfig,
    RESERVED_NAMES,
};
