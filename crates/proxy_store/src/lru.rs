//! LRU eviction controller for the local content store.
//!
//! Tracks size and age of entries, evicting expired-first then
//! least-recently-used, either reactively when the tracked size exceeds the
//! budget or periodically to correct drift from out-of-band file deletions.
//! Entries are sorted by `last_accessed` to decide removal order, driven by
//! a dedicated background worker rather than an on-demand sweep.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A single tracked local content-store entry.
#[derive(Debug, Clone)]
pub struct LruEntry {
    pub key: String,
    pub size: u64,
    pub last_accessed: SystemTime,
    pub created_at: SystemTime,
    pub absolute_path: PathBuf,
}

/// Usage statistics, surfaced on the `/health` endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LruStats {
    pub current_size: u64,
    pub max_size: u64,
    pub entry_count: usize,
}

struct Inner {
    entries: DashMap<String, LruEntry>,
    current_size: AtomicU64,
    max_size: u64,
    ttl: Option<Duration>,
    notify: Notify,
    base_dir: PathBuf,
}

/// The LRU eviction controller for one local content-store root directory.
#[derive(Clone)]
pub struct LruController {
    inner: Arc<Inner>,
}

impl LruController {
    /// Constructs an empty controller. `max_size == 0` disables eviction.
    pub fn new(base_dir: PathBuf, max_size: u64, ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                current_size: AtomicU64::new(0),
                max_size,
                ttl,
                notify: Notify::new(),
                base_dir,
            }),
        }
    }

    /// Reconstructs the controller from an on-disk scan of `base_dir`,
    /// using each regular file's modification time as both `created_at` and
    /// `last_accessed`. A scan failure is logged and yields an empty
    /// controller — the system continues, just without warm LRU state.
    pub async fn rebuild(base_dir: PathBuf, max_size: u64, ttl: Option<Duration>) -> Self {
        let controller = Self::new(base_dir.clone(), max_size, ttl);
        match walk_regular_files(&base_dir).await {
            Ok(files) => {
                for (path, size, mtime) in files {
                    let Ok(rel) = path.strip_prefix(&base_dir) else {
                        continue;
                    };
                    let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                    controller.inner.entries.insert(
                        key.clone(),
                        LruEntry {
                            key,
                            size,
                            last_accessed: mtime,
                            created_at: mtime,
                            absolute_path: path,
                        },
                    );
                    controller
                        .inner
                        .current_size
                        .fetch_add(size, Ordering::SeqCst);
                }
                if controller.over_budget() {
                    controller.reactive_evict();
                }
            }
            Err(err) => {
                warn!(error = %err, path = %base_dir.display(), "failed to rebuild LRU state from disk, starting with an empty controller");
            }
        }
        controller
    }

    fn over_budget(&self) -> bool {
        self.inner.max_size > 0
            && self.inner.current_size.load(Ordering::SeqCst) > self.inner.max_size
    }

    /// Promotes `key` to most-recently-used, inserting it if absent.
    /// `absolute_path` is required on first insertion; subsequent calls for
    /// an existing key may pass the same value again.
    pub fn record_access(&self, key: &str, size: u64, absolute_path: PathBuf) {
        let now = SystemTime::now();
        let mut delta: i64 = size as i64;
        if let Some(mut existing) = self.inner.entries.get_mut(key) {
            delta -= existing.size as i64;
            existing.size = size;
            existing.last_accessed = now;
        } else {
            self.inner.entries.insert(
                key.to_string(),
                LruEntry {
                    key: key.to_string(),
                    size,
                    last_accessed: now,
                    created_at: now,
                    absolute_path,
                },
            );
        }
        if delta >= 0 {
            self.inner
                .current_size
                .fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            self.inner
                .current_size
                .fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
        if self.over_budget() {
            self.inner.notify.notify_one();
        }
    }

    /// Removes `key` from tracking, adjusting `current_size`. Does not
    /// touch the filesystem; callers that also want the file removed should
    /// delete it themselves (the content store backend does this).
    pub fn record_delete(&self, key: &str) {
        if let Some((_, entry)) = self.inner.entries.remove(key) {
            self.inner
                .current_size
                .fetch_sub(entry.size, Ordering::SeqCst);
        }
    }

    /// Current usage statistics.
    pub fn stats(&self) -> LruStats {
        LruStats {
            current_size: self.inner.current_size.load(Ordering::SeqCst),
            max_size: self.inner.max_size,
            entry_count: self.inner.entries.len(),
        }
    }

    /// Spawns the dedicated eviction worker for this controller's lifetime:
    /// reacts to the one-slot overflow signal and runs a periodic
    /// stale-entry sweep every `period` (nominally 60s).
    pub fn spawn_eviction_worker(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = controller.inner.notify.notified() => {
                        controller.reactive_evict();
                    }
                    _ = tick.tick() => {
                        controller.periodic_scan().await;
                    }
                }
            }
        })
    }

    fn oldest_first(&self) -> Vec<LruEntry> {
        let mut entries: Vec<LruEntry> =
            self.inner.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.last_accessed);
        entries
    }

    fn evict(&self, key: &str) {
        if let Some((_, entry)) = self.inner.entries.remove(key) {
            self.inner
                .current_size
                .fetch_sub(entry.size, Ordering::SeqCst);
            if let Err(err) = std::fs::remove_file(&entry.absolute_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %err, path = %entry.absolute_path.display(), "failed to remove evicted file");
                }
            } else {
                debug!(key, "evicted from content store");
            }
        }
    }

    /// Two-phase reactive eviction: expired-first, then unconditional LRU.
    fn reactive_evict(&self) {
        if !self.over_budget() {
            return;
        }

        if let Some(ttl) = self.inner.ttl {
            if ttl > Duration::ZERO {
                let now = SystemTime::now();
                for entry in self.oldest_first() {
                    if !self.over_budget() {
                        break;
                    }
                    let age = now
                        .duration_since(entry.created_at)
                        .unwrap_or(Duration::ZERO);
                    if age > ttl {
                        self.evict(&entry.key);
                    }
                }
            }
        }

        if self.over_budget() {
            for entry in self.oldest_first() {
                if !self.over_budget() {
                    break;
                }
                self.evict(&entry.key);
            }
        }
    }

    /// Removes tracking for entries whose backing file has disappeared
    /// out-of-band, correcting drift. Runs at minute granularity and does
    /// not block request handling.
    async fn periodic_scan(&self) {
        let stale: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|e| !e.absolute_path.exists())
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.record_delete(&key);
        }
    }
}

/// Recursively walks `root`, returning `(path, size, modified)` for every
/// regular file found.
async fn walk_regular_files(root: &std::path::Path) -> std::io::Result<Vec<(PathBuf, u64, SystemTime)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let metadata = entry.metadata().await?;
                out.push((path, metadata.len(), metadata.modified()?));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn path_for(dir: &std::path::Path, key: &str) -> PathBuf {
        dir.join(key)
    }

    #[tokio::test]
    async fn evicts_least_recently_used_when_over_budget() {
        let dir = tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), vec![0u8; 400]).unwrap();
        }

        let controller = LruController::new(dir.path().to_path_buf(), 1024, None);
        controller.record_access("a", 400, path_for(dir.path(), "a"));
        controller.record_access("b", 400, path_for(dir.path(), "b"));
        controller.record_access("c", 400, path_for(dir.path(), "c"));

        // promote `a`
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.record_access("a", 400, path_for(dir.path(), "a"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        std::fs::write(dir.path().join("d"), vec![0u8; 400]).unwrap();
        controller.record_access("d", 400, path_for(dir.path(), "d"));

        // Run the eviction synchronously (without the background worker) by
        // invoking the private reactive path through a public round trip:
        // spawn a worker briefly, let it settle, then stop it.
        let handle = controller.spawn_eviction_worker(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let stats = controller.stats();
        assert!(stats.current_size <= 1024, "current_size={}", stats.current_size);
        assert!(!dir.path().join("b").exists());
        assert!(dir.path().join("a").exists());
        assert!(dir.path().join("c").exists());
        assert!(dir.path().join("d").exists());
    }

    #[tokio::test]
    async fn ttl_expired_entries_evicted_before_fresh_ones() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("old"), vec![0u8; 400]).unwrap();
        std::fs::write(dir.path().join("new"), vec![0u8; 400]).unwrap();

        let controller =
            LruController::new(dir.path().to_path_buf(), 500, Some(Duration::from_millis(10)));
        controller.record_access("old", 400, path_for(dir.path(), "old"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.record_access("new", 400, path_for(dir.path(), "new"));

        let handle = controller.spawn_eviction_worker(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(!dir.path().join("old").exists());
        assert!(dir.path().join("new").exists());
    }

    #[tokio::test]
    async fn periodic_scan_drops_entries_whose_file_vanished() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ghost");
        std::fs::write(&path, b"x").unwrap();

        let controller = LruController::new(dir.path().to_path_buf(), 0, None);
        controller.record_access("ghost", 1, path.clone());
        std::fs::remove_file(&path).unwrap();

        controller.periodic_scan().await;
        assert_eq!(controller.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn rebuild_reconstructs_entries_from_disk() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("packages/foo")).unwrap();
        std::fs::write(dir.path().join("packages/foo/file.tar.gz"), vec![0u8; 10]).unwrap();

        let controller = LruController::rebuild(dir.path().to_path_buf(), 0, None).await;
        let stats = controller.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.current_size, 10);
    }

    #[tokio::test]
    async fn zero_max_size_disables_eviction() {
        let dir = tempdir().unwrap();
        let controller = LruController::new(dir.path().to_path_buf(), 0, None);
        for i in 0..5 {
            let key = format!("k{i}");
            std::fs::write(dir.path().join(&key), vec![0u8; 1_000_000]).unwrap();
            controller.record_access(&key, 1_000_000, dir.path().join(&key));
        }
        assert!(!controller.over_budget());
    }
}
