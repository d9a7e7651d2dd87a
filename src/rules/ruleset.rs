//! `RULE-SET`: delegate matching to a named rule provider
//!
//! The provider is looked up in the registry on every match, so a provider
//! that is reloaded (or registered late) is picked up without re-parsing rules.
//! With the `src` parameter the provider sees the connection with source and
//! destination swapped; the swap is undone when matching finishes, even if the
//! match future is dropped half-way.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Rule, RuleMatchHelper, RuleType};
use crate::metadata::Metadata;
use crate::provider::RuleProviderRegistry;

/// `RULE-SET,provider,target[,no-resolve][,src]`
#[derive(Debug)]
pub struct RuleSet {
    provider: String,
    adapter: String,
    registry: Arc<RuleProviderRegistry>,
    no_resolve: bool,
    is_src: bool,
}

impl RuleSet {
    #[must_use]
    pub fn new(
        provider: &str,
        adapter: &str,
        registry: Arc<RuleProviderRegistry>,
        no_resolve: bool,
        is_src: bool,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            adapter: adapter.to_string(),
            registry,
            no_resolve,
            is_src,
        }
    }
}

/// Swaps source and destination for as long as it lives
struct SwappedMetadata<'a>(&'a mut Metadata);

impl<'a> SwappedMetadata<'a> {
    fn new(metadata: &'a mut Metadata) -> Self {
        metadata.swap_src_dst();
        Self(metadata)
    }
}

impl Deref for SwappedMetadata<'_> {
    type Target = Metadata;

    fn deref(&self) -> &Metadata {
        self.0
    }
}

impl DerefMut for SwappedMetadata<'_> {
    fn deref_mut(&mut self) -> &mut Metadata {
        self.0
    }
}

impl Drop for SwappedMetadata<'_> {
    fn drop(&mut self) {
        self.0.swap_src_dst();
    }
}

#[async_trait]
impl Rule for RuleSet {
    fn rule_type(&self) -> RuleType {
        RuleType::RuleSet
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> Option<String> {
        let provider = self.registry.get(&self.provider)?;
        let hit = if self.is_src {
            let mut swapped = SwappedMetadata::new(metadata);
            provider.matches(&mut swapped, &helper.without_resolve()).await
        } else if self.no_resolve {
            provider.matches(metadata, &helper.without_resolve()).await
        } else {
            provider.matches(metadata, helper).await
        };
        hit.then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.provider
    }

    fn provider_names(&self) -> Vec<String> {
        vec![self.provider.clone()]
    }

    fn should_resolve_ip(&self) -> bool {
        !self.no_resolve
            && !self.is_src
            && self
                .registry
                .get(&self.provider)
                .is_some_and(|p| p.should_resolve_ip())
    }

    fn should_find_process(&self) -> bool {
        self.registry
            .get(&self.provider)
            .is_some_and(|p| p.should_find_process())
    }
}
