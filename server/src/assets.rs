//! Mtime-tracked index and bundle slots.
//!
//! Before every render the slot stats its file; a newer mtime (or an
//! empty slot) triggers a whole-file read and an atomic swap of bytes
//! plus mtime. Reads happen under the shared lock, swaps under the
//! exclusive one. A missing file fails the render; a read error after a
//! successful stat is transient and leaves the cached bytes in place.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    /// The file cannot be stat'ed; the asset is gone.
    #[error("asset {path} is unavailable: {source}")]
    Unavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The stat succeeded but the read did not. Transient; the slot is
    /// left untouched.
    #[error("asset {path} read failed: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
struct CachedAsset {
    bytes: Bytes,
    mtime: SystemTime,
}

struct AssetSlot {
    path: PathBuf,
    state: RwLock<Option<CachedAsset>>,
}

impl AssetSlot {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(None),
        }
    }

    fn refresh(&self) -> Result<Bytes, AssetError> {
        let metadata = std::fs::metadata(&self.path).map_err(|source| AssetError::Unavailable {
            path: self.path.display().to_string(),
            source,
        })?;
        let mtime = metadata.modified().map_err(|source| AssetError::Unavailable {
            path: self.path.display().to_string(),
            source,
        })?;

        {
            let cached = self
                .state
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(cached) = cached.as_ref()
                && cached.mtime >= mtime
            {
                return Ok(cached.bytes.clone());
            }
        }

        let bytes = std::fs::read(&self.path).map_err(|source| AssetError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        let bytes = Bytes::from(bytes);

        let mut slot = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "asset reloaded");
        *slot = Some(CachedAsset {
            bytes: bytes.clone(),
            mtime,
        });
        Ok(bytes)
    }
}

/// The two per-site asset slots, independently locked.
pub struct AssetCache {
    index: AssetSlot,
    bundle: AssetSlot,
}

impl AssetCache {
    #[must_use]
    pub fn new(index_path: impl AsRef<Path>, bundle_path: impl AsRef<Path>) -> Self {
        Self {
            index: AssetSlot::new(index_path.as_ref()),
            bundle: AssetSlot::new(bundle_path.as_ref()),
        }
    }

    /// Current index bytes, reloading from disk if the file changed.
    pub fn index(&self) -> Result<Bytes, AssetError> {
        self.index.refresh()
    }

    /// Current bundle bytes, reloading from disk if the file changed.
    pub fn bundle(&self) -> Result<Bytes, AssetError> {
        self.bundle.refresh()
    }
}
