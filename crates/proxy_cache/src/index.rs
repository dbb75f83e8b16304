//! Unbounded TTL cache of parsed index metadata.
//!
//! Same lazy-expiry-on-read shape as [`crate::response::ResponseCache`], but
//! with no aggregate size bound (values are parsed structures, not response
//! bytes) and eviction only ever driven by TTL or an explicit invalidate
//! call — there is no LRU-on-overflow path because there is no bound to
//! overflow.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;

struct Entry<V> {
    value: Arc<V>,
    expires_at: Instant,
}

/// The two cache keys this cache distinguishes: the full `package-list`
/// document, and a single `package:<name>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// The root package list (`/simple/`).
    PackageList,
    /// A single package's file listing (`/simple/<name>/`).
    Package(String),
}

/// TTL-only cache of parsed index metadata, generic over the cached value
/// type so it can hold either the package-list document or a single
/// package's parsed file listing.
pub struct IndexMetadataCache<V> {
    entries: RwLock<HashMap<IndexKey, Entry<V>>>,
    ttl: Duration,
}

impl<V> IndexMetadataCache<V> {
    /// Creates an empty cache with the given per-entry TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Inserts or replaces the cached value for `key`.
    pub fn set(&self, key: IndexKey, value: Arc<V>) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.write().insert(key, Entry { value, expires_at });
    }

    /// Looks up `key`. An expired entry is treated as a miss and removed.
    pub fn get(&self, key: &IndexKey) -> Option<Arc<V>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if entry.expires_at > now {
                    return Some(entry.value.clone());
                }
            } else {
                return None;
            }
        }
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        entries.remove(key);
        None
    }

    /// Removes a single key.
    pub fn invalidate(&self, key: &IndexKey) {
        self.entries.write().remove(key);
    }

    /// Removes the cached package list, if any.
    pub fn invalidate_list(&self) {
        self.invalidate(&IndexKey::PackageList);
    }

    /// Removes the cached file listing for `name`, if any.
    pub fn invalidate_package(&self, name: &str) {
        self.invalidate(&IndexKey::Package(name.to_string()));
    }

    /// Number of entries currently tracked, including not-yet-expired-but-
    /// stale ones that haven't been read since expiring.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
