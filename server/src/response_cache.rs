//! LRU cache of fully rendered responses.
//!
//! Keyed by request path, fixed capacity, O(1) operations under one
//! mutex. `get` promotes to most-recently-used; `set` inserts or
//! updates and evicts the least-recently-used entry when full. Expiry
//! is the caller's concern: the renderer checks `expire_at` and drops
//! stale entries, so the cache itself never hands out an expired value
//! to a caller that checks.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;

use crate::renderer::Rendered;

#[derive(Clone)]
pub struct CachedEntry {
    pub response: Arc<Rendered>,
    pub expire_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, CachedEntry>>,
}

impl ResponseCache {
    /// Create a cache holding at most `capacity` entries (> 0).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up and promote. The entry may be expired; see [`Self::get_fresh`].
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedEntry> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Look up, dropping the entry if it has expired.
    #[must_use]
    pub fn get_fresh(&self, key: &str, now: Instant) -> Option<Arc<Rendered>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let looked_up = entries
            .get(key)
            .map(|entry| (entry.expire_at > now).then(|| Arc::clone(&entry.response)));
        match looked_up {
            Some(Some(response)) => Some(response),
            Some(None) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: String, response: Arc<Rendered>, expire_at: Instant) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.put(
            key,
            CachedEntry {
                response,
                expire_at,
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn page(status: u16) -> Arc<Rendered> {
        Arc::new(Rendered::page(
            status,
            Vec::new(),
            bytes::Bytes::from_static(b"<html></html>"),
        ))
    }

    #[test]
    fn get_promotes_and_set_evicts_lru() {
        let cache = ResponseCache::new(2);
        let expire = Instant::now() + Duration::from_secs(60);

        cache.set("a".to_string(), page(200), expire);
        cache.set("b".to_string(), page(200), expire);
        assert!(cache.get("a").is_some());
        cache.set("c".to_string(), page(200), expire);

        // `a` was promoted by the get, so `b` was the LRU victim.
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn fresh_before_expiry_never_after() {
        let cache = ResponseCache::new(2);
        let now = Instant::now();
        cache.set("a".to_string(), page(200), now + Duration::from_millis(50));

        assert!(cache.get_fresh("a", now).is_some());
        assert!(
            cache
                .get_fresh("a", now + Duration::from_millis(50))
                .is_none()
        );
        // The expired entry was dropped outright.
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn set_updates_existing_key() {
        let cache = ResponseCache::new(2);
        let expire = Instant::now() + Duration::from_secs(60);
        cache.set("a".to_string(), page(200), expire);
        cache.set("a".to_string(), page(503), expire);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap().response.status(), 503);
    }
}
