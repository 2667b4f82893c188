//! Memoization of path resolution and stat results
//!
//! Both tables are keyed by normalized logical path and guarded by a single
//! mutex, so readers never observe a torn entry. Any structural change under a
//! path drops that path, every ancestor and every descendant. Writers that
//! computed a value before an invalidation are rejected by the epoch check in
//! [`PathCache::put_resolved`] / [`PathCache::put_stat`].

mod lru;

pub use lru::LruCache;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// One LRU-bounded memo table
pub struct MemoTable<V> {
    entries: HashMap<PathBuf, V>,
    lru: LruCache<PathBuf>,
    max_entries: usize,
}

impl<V: Clone> MemoTable<V> {
    /// Create a table holding at most `max_entries` values (0 = unlimited)
    pub fn new(max_entries: usize) -> Self {
        MemoTable {
            entries: HashMap::new(),
            lru: LruCache::new(),
            max_entries,
        }
    }

    pub fn get(&mut self, key: &Path) -> Option<V> {
        let value = self.entries.get(key).cloned()?;
        self.lru.touch(&key.to_path_buf());
        Some(value)
    }

    pub fn insert(&mut self, key: PathBuf, value: V) {
        self.lru.touch(&key);
        self.entries.insert(key, value);

        if self.max_entries > 0 {
            while self.entries.len() > self.max_entries {
                match self.lru.pop_oldest() {
                    Some(evicted) => {
                        self.entries.remove(&evicted);
                    }
                    None => break,
                }
            }
        }
    }

    /// Drop `path` and its ancestors
    pub fn invalidate_entry(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if self.entries.remove(ancestor).is_some() {
                self.lru.remove(&ancestor.to_path_buf());
            }
        }
    }

    /// Drop `path`, its ancestors and its descendants
    pub fn invalidate(&mut self, path: &Path) {
        self.invalidate_entry(path);

        let doomed: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(path))
            .cloned()
            .collect();
        for key in doomed {
            self.entries.remove(&key);
            self.lru.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Tables<R, S> {
    resolve: MemoTable<R>,
    stat: MemoTable<S>,
    /// Bumped on every invalidation
    epoch: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub resolve_entries: usize,
    pub stat_entries: usize,
}

impl CacheStats {
    /// Hit ratio in percent
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Resolution and stat memo tables for one engine
pub struct PathCache<R, S> {
    enabled: AtomicBool,
    tables: Mutex<Tables<R, S>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<R: Clone, S: Clone> PathCache<R, S> {
    pub fn new(enabled: bool, max_entries: usize) -> Self {
        PathCache {
            enabled: AtomicBool::new(enabled),
            tables: Mutex::new(Tables {
                resolve: MemoTable::new(max_entries),
                stat: MemoTable::new(max_entries),
                epoch: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable memoization; disabling drops every entry
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.clear();
        }
    }

    /// Current invalidation epoch; read it before computing a value to cache
    pub fn epoch(&self) -> u64 {
        self.tables.lock().epoch
    }

    pub fn get_resolved(&self, key: &Path) -> Option<R> {
        if !self.is_enabled() {
            return None;
        }
        let hit = self.tables.lock().resolve.get(key);
        self.record(hit.is_some());
        hit
    }

    /// Store a resolution computed at `epoch`; dropped if an invalidation happened since
    pub fn put_resolved(&self, key: PathBuf, value: R, epoch: u64) {
        if !self.is_enabled() {
            return;
        }
        let mut tables = self.tables.lock();
        if tables.epoch == epoch {
            tables.resolve.insert(key, value);
        }
    }

    pub fn get_stat(&self, key: &Path) -> Option<S> {
        if !self.is_enabled() {
            return None;
        }
        let hit = self.tables.lock().stat.get(key);
        self.record(hit.is_some());
        hit
    }

    pub fn put_stat(&self, key: PathBuf, value: S, epoch: u64) {
        if !self.is_enabled() {
            return;
        }
        let mut tables = self.tables.lock();
        if tables.epoch == epoch {
            tables.stat.insert(key, value);
        }
    }

    /// Invalidate `path`, its ancestors and descendants in both tables
    pub fn invalidate(&self, path: &Path) {
        let mut tables = self.tables.lock();
        tables.epoch += 1;
        tables.resolve.invalidate(path);
        tables.stat.invalidate(path);
        debug!(path = %path.display(), "Invalidated cache entries");
    }

    /// Invalidate `path` and its ancestors only (content changed, shape did not)
    pub fn invalidate_entry(&self, path: &Path) {
        let mut tables = self.tables.lock();
        tables.epoch += 1;
        tables.resolve.invalidate_entry(path);
        tables.stat.invalidate_entry(path);
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.epoch += 1;
        tables.resolve.clear();
        tables.stat.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let tables = self.tables.lock();
        CacheStats {
            enabled: self.is_enabled(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            resolve_entries: tables.resolve.len(),
            stat_entries: tables.stat.len(),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_memo_table_eviction() {
        let mut table = MemoTable::new(2);
        table.insert(p("a"), 1);
        table.insert(p("b"), 2);
        assert_eq!(table.get(&p("a")), Some(1));

        // 'b' is now the least recently used
        table.insert(p("c"), 3);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&p("b")), None);
        assert_eq!(table.get(&p("a")), Some(1));
        assert_eq!(table.get(&p("c")), Some(3));
    }

    #[test]
    fn test_invalidate_ancestors_and_descendants() {
        let mut table = MemoTable::new(0);
        for key in ["", "a", "a/b", "a/b/c", "a/b/c/d", "a/bb", "x"] {
            table.insert(p(key), key.len());
        }

        table.invalidate(&p("a/b/c"));

        assert_eq!(table.get(&p("")), None);
        assert_eq!(table.get(&p("a")), None);
        assert_eq!(table.get(&p("a/b")), None);
        assert_eq!(table.get(&p("a/b/c")), None);
        assert_eq!(table.get(&p("a/b/c/d")), None);
        // siblings and unrelated keys survive
        assert_eq!(table.get(&p("a/bb")), Some(4));
        assert_eq!(table.get(&p("x")), Some(1));
    }

    #[test]
    fn test_stale_put_rejected() {
        let cache: PathCache<Option<u32>, u32> = PathCache::new(true, 0);
        let epoch = cache.epoch();
        cache.invalidate(&p("a"));
        cache.put_resolved(p("a"), Some(1), epoch);
        assert_eq!(cache.get_resolved(&p("a")), None);

        let epoch = cache.epoch();
        cache.put_resolved(p("a"), Some(2), epoch);
        assert_eq!(cache.get_resolved(&p("a")), Some(Some(2)));
    }

    #[test]
    fn test_negative_results_are_cached() {
        let cache: PathCache<Option<u32>, u32> = PathCache::new(true, 0);
        let epoch = cache.epoch();
        cache.put_resolved(p("missing"), None, epoch);
        assert_eq!(cache.get_resolved(&p("missing")), Some(None));
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache: PathCache<Option<u32>, u32> = PathCache::new(false, 0);
        let epoch = cache.epoch();
        cache.put_resolved(p("a"), Some(1), epoch);
        cache.put_stat(p("a"), 1, epoch);
        assert_eq!(cache.get_resolved(&p("a")), None);
        assert_eq!(cache.get_stat(&p("a")), None);
        assert_eq!(cache.stats().resolve_entries, 0);
    }

    #[test]
    fn test_stats() {
        let cache: PathCache<Option<u32>, u32> = PathCache::new(true, 0);
        let epoch = cache.epoch();
        cache.put_stat(p("a"), 7, epoch);
        assert_eq!(cache.get_stat(&p("a")), Some(7));
        assert_eq!(cache.get_stat(&p("b")), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stat_entries, 1);
        assert!((stats.hit_rate() - 50.0).abs() < f64::EPSILON);

        cache.set_enabled(false);
        assert_eq!(cache.stats().stat_entries, 0);
        assert!(!cache.stats().enabled);
    }
}
