//! Resource store: a process-lifetime directory of named resources.
//!
//! The loader writes resources in at startup; the renderer reads them on
//! every request. Readers obtain the stored `Arc`, never a copy, and a
//! resource is immutable once inserted. The default memory
//! implementation has no eviction: entries live as long as the process.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use kiln_types::Resource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No resource under that name. Degrades the response that asked for
    /// it; never fatal.
    #[error("unknown resource: {0}")]
    Missing(String),
}

/// A directory mapping resource names to resources.
///
/// Names are flat UTF-8 strings with no namespace hierarchy. Concurrent
/// reads do not block each other; writers briefly exclude readers.
pub trait Store: Send + Sync {
    fn load(&self, name: &str) -> Result<Arc<Resource>, StoreError>;

    fn put(&self, name: &str, resource: Resource);
}

/// The default in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Arc<Resource>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn load(&self, name: &str) -> Result<Arc<Resource>, StoreError> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Missing(name.to_string()))
    }

    fn put(&self, name: &str, resource: Resource) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries
            .insert(name.to_string(), Arc::new(resource))
            .is_some()
        {
            tracing::debug!(name, "replaced stored resource");
        }
    }
}
