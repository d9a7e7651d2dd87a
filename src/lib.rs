//! meta-router: rule-based routing and session dispatch core
//!
//! This crate decides, for every TCP connection and UDP packet an inbound
//! hands it, which outbound adapter carries the traffic, and then carries it.
//!
//! # Features
//!
//! - **Rules**: leaf matchers, `AND`/`OR`/`NOT`/`SUB-RULE` combinators and
//!   `RULE-SET` over classical, ipcidr and domain providers
//! - **Proxy groups**: selector, fallback, url-test, load-balance and relay,
//!   kept fresh by health checks
//! - **UDP NAT**: per-flow packet senders with destination NAT
//! - **Hot reload**: rule snapshots are swapped atomically
//!
//! # Architecture
//!
//! ```text
//! inbound → Tunnel ─┬─ RuleEngine ── RULE-SET → RuleProvider
//!                   ├─ ProxyGroup ── ProxyProvider ── HealthCheck
//!                   └─ nat::Table ── PacketSender / handle_udp_to_local
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use meta_router::adapter::BuiltinFactory;
//! use meta_router::config::load_config;
//! use meta_router::dns::SystemResolver;
//! use meta_router::metadata::{Metadata, Network};
//! use meta_router::state::RouterState;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/meta-router/config.json")?;
//! let state = RouterState::init(&config, &BuiltinFactory::new(), Arc::new(SystemResolver::default()), None)?;
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:1080").await?;
//! let metadata = Metadata::new(Network::Tcp).with_host("example.com");
//! state.tunnel().handle_tcp(stream, metadata).await?;
//!
//! state.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`adapter`]: outbound adapters and the `Proxy` wrapper
//! - [`config`]: configuration types and loading
//! - [`group`]: proxy groups
//! - [`nat`]: UDP NAT table and packet sender
//! - [`provider`]: rule providers, proxy providers, health checks
//! - [`rules`]: rule parsing and matching
//! - [`state`]: everything built from one configuration
//! - [`tunnel`]: connection dispatch

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod adapter;
pub mod common;
pub mod config;
pub mod dns;
pub mod error;
pub mod group;
pub mod metadata;
pub mod nat;
pub mod process;
pub mod provider;
pub mod rules;
pub mod state;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use adapter::{AdapterFactory, AdapterType, BuiltinFactory, Proxy, ProxyAdapter};
pub use config::{load_config, Config};
pub use error::{AdapterError, ConfigError, GroupError, NatError, ProviderError, RouterError, RuleError};
pub use group::{GroupKind, ProxyGroup};
pub use metadata::{Metadata, Network};
pub use nat::{PacketSender, Table};
pub use provider::{RuleProvider, RuleProviderRegistry};
pub use rules::{RuleEngine, RuleParser, RuleSnapshot};
pub use state::RouterState;
pub use tunnel::{Mode, Tunnel};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
