//! The fetch dispatcher.
//!
//! One provider instance exists per configured id; the fetcher looks the
//! id up and delegates. Errors pass through untouched. Providers are
//! internally thread-safe, so concurrent fetches are fine and share the
//! underlying HTTP transport.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use kiln_types::Resource;

use crate::{Provider, ProviderError, ResourceConfig};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Dispatches fetches to named provider instances.
pub struct Fetcher {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Fetcher {
    #[must_use]
    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::default()
    }

    /// Fetch `name` through the provider registered under `provider_id`.
    pub async fn fetch(
        &self,
        name: &str,
        provider_id: &str,
        config: &ResourceConfig,
    ) -> Result<Resource, FetchError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| FetchError::UnknownProvider(provider_id.to_string()))?;
        tracing::debug!(name, provider = provider_id, "fetching resource");
        Ok(provider.fetch(name, config).await?)
    }

    /// Registered provider ids.
    #[must_use]
    pub fn provider_ids(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Builds the per-process provider registry.
#[derive(Default)]
pub struct FetcherBuilder {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl FetcherBuilder {
    #[must_use]
    pub fn register(mut self, id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(id.into(), provider);
        self
    }

    #[must_use]
    pub fn build(self) -> Fetcher {
        Fetcher {
            providers: self.providers,
        }
    }
}
