//! Resource providers.
//!
//! A provider converts a `(name, config)` pair into a [`Resource`]. Two
//! kinds ship by default: [`FileProvider`] reads local files,
//! [`RestProvider`] talks HTTP with retry and pagination. The
//! [`Fetcher`] dispatches fetches to provider instances by id; instances
//! are registered explicitly at startup, one per process.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]

mod fetcher;
mod file;
mod rest;
pub mod retry;

use thiserror::Error;

pub use fetcher::{FetchError, Fetcher, FetcherBuilder};
pub use file::FileProvider;
pub use rest::{RestOptions, RestProvider};

use kiln_types::Resource;

/// Free-form per-resource options; each provider defines its own schema.
pub type ResourceConfig = serde_json::Value;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider's option schema rejected the configuration.
    #[error("invalid provider configuration: {0}")]
    Config(String),

    /// The transport failed before a status line was read.
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    /// The upstream answered with a non-success status, after retries
    /// where the status was retryable.
    #[error("upstream returned status {status} after {attempts} attempt(s)")]
    Status { status: u16, attempts: u32 },

    /// A local file read failed.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A response body could not be decoded for pagination.
    #[error("invalid upstream payload: {0}")]
    Payload(String),
}

/// A named source of resources.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Fetch the resource `name` using the per-resource `config`.
    ///
    /// Cancellation is cooperative: dropping the returned future between
    /// HTTP calls or retry sleeps abandons the fetch.
    async fn fetch(&self, name: &str, config: &ResourceConfig) -> Result<Resource, ProviderError>;
}
