//! File provider: one local file, one segment.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use kiln_types::Resource;

use crate::{Provider, ProviderError, ResourceConfig};

#[derive(Debug, Deserialize)]
struct FileResourceConfig {
    #[serde(default)]
    path: String,
}

/// Reads a resource from the local filesystem.
///
/// Returns a one-segment resource with TTL 0. Fails when the path is
/// empty, unreadable, or names a directory.
#[derive(Debug, Default)]
pub struct FileProvider;

impl FileProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Provider for FileProvider {
    async fn fetch(&self, name: &str, config: &ResourceConfig) -> Result<Resource, ProviderError> {
        let config: FileResourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        if config.path.trim().is_empty() {
            return Err(ProviderError::Config(format!(
                "resource {name}: path must not be empty"
            )));
        }

        let path = Path::new(&config.path);
        let metadata = tokio::fs::metadata(path).await.map_err(|source| {
            ProviderError::Io {
                path: config.path.clone(),
                source,
            }
        })?;
        if metadata.is_dir() {
            return Err(ProviderError::Io {
                path: config.path.clone(),
                source: io::Error::new(io::ErrorKind::IsADirectory, "is a directory"),
            });
        }

        let bytes = tokio::fs::read(path).await.map_err(|source| ProviderError::Io {
            path: config.path.clone(),
            source,
        })?;

        tracing::debug!(name, path = %config.path, bytes = bytes.len(), "file resource read");
        Ok(Resource::single(bytes, Duration::ZERO))
    }
}
