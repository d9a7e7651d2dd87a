//! Proxy providers
//!
//! A proxy provider is a named source of proxies shared by groups. Each owns a
//! [`HealthCheck`] over its proxies; groups touch the provider when they route
//! through it, which is what lazy health checks key off.
//!
//! - [`InlineProvider`]: proxies built from option maps, with overrides
//! - [`CompatibleProvider`]: a group's explicitly listed members

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::healthcheck::{HealthCheck, HealthCheckOptions};
use super::overrides::{OverrideSchema, ProxyOptions};
use crate::adapter::{AdapterFactory, Proxy};
use crate::common::IntRanges;
use crate::error::ProviderError;

/// Where a provider's proxies come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleType {
    Compatible,
    File,
    Inline,
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compatible => "Compatible",
            Self::File => "File",
            Self::Inline => "Inline",
        })
    }
}

/// Named, health-checked set of proxies
#[async_trait]
pub trait ProxyProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Current proxies
    fn proxies(&self) -> Vec<Arc<Proxy>>;

    /// Bumped whenever the proxy list changes
    fn version(&self) -> u32;

    fn vehicle_type(&self) -> VehicleType;

    fn health_check(&self) -> &Arc<HealthCheck>;

    /// Mark the provider as used
    fn touch(&self) {
        self.health_check().touch();
    }

    /// Probe every proxy now
    async fn check(&self) {
        self.health_check().check().await;
    }

    /// Add an extra health-check URL
    fn register_health_check_task(
        &self,
        url: &str,
        expected_status: IntRanges<u16>,
        filter: &str,
        interval: Duration,
    ) {
        self.health_check()
            .register_health_check_task(url, expected_status, filter, interval);
    }

    /// Start the health-check loop
    fn initial(&self) {
        if self.health_check().start().is_some() {
            debug!(provider = %self.name(), "health check started");
        }
    }

    /// Stop the health-check loop
    fn close(&self) {
        self.health_check().close();
    }
}

/// Proxies defined inline in the configuration
pub struct InlineProvider {
    name: String,
    proxies: RwLock<Vec<Arc<Proxy>>>,
    health_check: Arc<HealthCheck>,
    version: AtomicU32,
}

impl InlineProvider {
    /// Build proxies from `payload`, applying `overrides` first
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidProxy` for an option map the factory
    /// rejects.
    pub fn new(
        name: impl Into<String>,
        payload: &[ProxyOptions],
        overrides: &OverrideSchema,
        factory: &dyn AdapterFactory,
        health_check: HealthCheckOptions,
    ) -> Result<Self, ProviderError> {
        let name = name.into();
        let proxies = build_proxies(&name, payload, overrides, factory)?;
        info!(provider = %name, proxies = proxies.len(), "inline provider loaded");
        Ok(Self {
            health_check: Arc::new(HealthCheck::new(proxies.clone(), health_check)),
            proxies: RwLock::new(proxies),
            name,
            version: AtomicU32::new(1),
        })
    }

    /// Replace the proxies
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InvalidProxy` and keeps the old list if any
    /// option map is rejected.
    pub fn update(
        &self,
        payload: &[ProxyOptions],
        overrides: &OverrideSchema,
        factory: &dyn AdapterFactory,
    ) -> Result<(), ProviderError> {
        let proxies = build_proxies(&self.name, payload, overrides, factory)?;
        self.health_check.set_proxies(proxies.clone());
        *self.proxies.write() = proxies;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

fn build_proxies(
    provider: &str,
    payload: &[ProxyOptions],
    overrides: &OverrideSchema,
    factory: &dyn AdapterFactory,
) -> Result<Vec<Arc<Proxy>>, ProviderError> {
    payload
        .iter()
        .map(|options| {
            let mut options = options.clone();
            overrides.apply(&mut options);
            factory
                .build(&options)
                .map(|adapter| Arc::new(Proxy::new(adapter)))
                .map_err(|e| ProviderError::InvalidProxy {
                    provider: provider.to_string(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

impl ProxyProvider for InlineProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.read().clone()
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::Inline
    }

    fn health_check(&self) -> &Arc<HealthCheck> {
        &self.health_check
    }
}

impl fmt::Debug for InlineProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineProvider")
            .field("name", &self.name)
            .field("proxies", &self.proxies.read().len())
            .field("version", &self.version())
            .finish()
    }
}

/// A group's own `proxies` list, wrapped as a provider
pub struct CompatibleProvider {
    name: String,
    proxies: Vec<Arc<Proxy>>,
    health_check: Arc<HealthCheck>,
}

impl CompatibleProvider {
    /// # Errors
    ///
    /// Returns `ProviderError::Empty` when `proxies` is empty.
    pub fn new(
        name: impl Into<String>,
        proxies: Vec<Arc<Proxy>>,
        health_check: HealthCheckOptions,
    ) -> Result<Self, ProviderError> {
        let name = name.into();
        if proxies.is_empty() {
            return Err(ProviderError::Empty(name));
        }
        Ok(Self {
            health_check: Arc::new(HealthCheck::new(proxies.clone(), health_check)),
            proxies,
            name,
        })
    }
}

impl ProxyProvider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.clone()
    }

    fn version(&self) -> u32 {
        1
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::Compatible
    }

    fn health_check(&self) -> &Arc<HealthCheck> {
        &self.health_check
    }
}

impl fmt::Debug for CompatibleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatibleProvider")
            .field("name", &self.name)
            .field("proxies", &self.proxies.len())
            .finish()
    }
}
