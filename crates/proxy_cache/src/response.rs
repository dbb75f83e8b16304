//! Bounded, byte-budgeted cache of pre-serialized response bodies.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::RwLock;

struct Entry {
    value: Bytes,
    expires_at: Instant,
    last_accessed: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    total_size: u64,
}

/// A byte-size-bounded, TTL-expiring, LRU-on-overflow cache of response
/// bodies, keyed by an opaque fingerprint (e.g. `"<path>?<accept>"`).
///
/// Reads run in parallel (`RwLock::read`); writes, including the lazy
/// clean-up of an expired entry found during a read, take the write lock.
/// A read first checks under a read lock; only on an expired or missing
/// entry does it escalate to a write lock, so concurrent readers of live
/// entries never contend with each other.
pub struct ResponseCache {
    inner: RwLock<Inner>,
    max_size: u64,
    ttl: Duration,
}

/// A borrowed view of a cached value. Drop has no effect beyond releasing
/// the `Bytes` refcount — the cache itself is never mutated or reclaimed
/// while a borrow is outstanding, since `Bytes` is itself a refcounted,
/// immutable view into the stored buffer.
pub struct CachedResponse {
    bytes: Bytes,
}

impl CachedResponse {
    /// Borrows the cached bytes without copying.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Takes ownership of the underlying `Bytes` (cheap, reference-counted).
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl ResponseCache {
    /// Creates a cache bounded to `max_size` aggregate bytes, with entries
    /// expiring `ttl` after insertion. `ttl == Duration::ZERO` makes every
    /// entry immediately expired on the next read.
    pub fn new(max_size: u64, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                total_size: 0,
            }),
            max_size,
            ttl,
        }
    }

    /// Inserts or replaces `key`. If `value` alone exceeds `max_size`, every
    /// other entry is evicted and `value` is admitted anyway (a cache that
    /// can never hold its single largest expected payload would be useless
    /// for that payload).
    pub fn set(&self, key: String, value: Bytes) {
        let size = value.len() as u64;
        let now = Instant::now();
        let mut inner = self.inner.write();

        if let Some(old) = inner.entries.remove(&key) {
            inner.total_size = inner.total_size.saturating_sub(old.value.len() as u64);
        }

        if size > self.max_size {
            inner.entries.clear();
            inner.total_size = 0;
        } else {
            while inner.total_size + size > self.max_size {
                let Some(oldest_key) = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_accessed)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                if let Some(removed) = inner.entries.remove(&oldest_key) {
                    inner.total_size = inner.total_size.saturating_sub(removed.value.len() as u64);
                }
            }
        }

        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
                last_accessed: now,
            },
        );
        inner.total_size += size;
    }

    /// Looks up `key`. An expired entry is treated as a miss and removed.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        {
            let inner = self.inner.read();
            match inner.entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    return Some(CachedResponse {
                        bytes: entry.value.clone(),
                    });
                }
                Some(_) => {} // expired, fall through to remove under write lock
                None => return None,
            }
        }

        let mut inner = self.inner.write();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                Some(CachedResponse {
                    bytes: entry.value.clone(),
                })
            }
            Some(_) => {
                if let Some(removed) = inner.entries.remove(key) {
                    inner.total_size = inner.total_size.saturating_sub(removed.value.len() as u64);
                }
                None
            }
            None => None,
        }
    }

    /// Removes `key`, if present.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.write();
        if let Some(removed) = inner.entries.remove(key) {
            inner.total_size = inner.total_size.saturating_sub(removed.value.len() as u64);
        }
    }

    /// Current aggregate size of cached entries in bytes.
    pub fn current_size(&self) -> u64 {
        self.inner.read().total_size
    }

    /// Usage statistics, surfaced on the `/health` endpoint.
    pub fn stats(&self) -> ResponseCacheStats {
        let inner = self.inner.read();
        ResponseCacheStats {
            current_size: inner.total_size,
            max_size: self.max_size,
            entry_count: inner.entries.len(),
        }
    }
}

/// Usage statistics for a [`ResponseCache`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResponseCacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub entry_count: usize,
}
