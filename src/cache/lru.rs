//! LRU (Least Recently Used) tracking

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Recency tracker for cache keys
///
/// Each access stamps the key with a fresh generation; the oldest key is the
/// one with the smallest live stamp.
pub struct LruCache<K: Clone + Eq + Hash> {
    /// Generation -> key, ordered oldest first
    order: BTreeMap<u64, K>,
    /// Key -> its current generation
    positions: HashMap<K, u64>,
    /// Monotonic generation counter
    generation: u64,
}

impl<K: Clone + Eq + Hash> LruCache<K> {
    /// Create a new LRU tracker
    pub fn new() -> Self {
        LruCache {
            order: BTreeMap::new(),
            positions: HashMap::new(),
            generation: 0,
        }
    }

    /// Record an access (inserting the key if it is new)
    pub fn touch(&mut self, key: &K) {
        self.generation += 1;
        if let Some(old) = self.positions.insert(key.clone(), self.generation) {
            self.order.remove(&old);
        }
        self.order.insert(self.generation, key.clone());
    }

    /// Stop tracking a key
    pub fn remove(&mut self, key: &K) {
        if let Some(gen) = self.positions.remove(key) {
            self.order.remove(&gen);
        }
    }

    /// Pop the least recently used key
    pub fn pop_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.positions.remove(&key);
        Some(key)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Get count of tracked keys
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Clear all keys
    pub fn clear(&mut self) {
        self.order.clear();
        self.positions.clear();
        self.generation = 0;
    }
}

impl<K: Clone + Eq + Hash> Default for LruCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn key(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_oldest_key_leaves_first() {
        let mut lru = LruCache::new();
        for p in ["etc", "etc/hosts", "usr"] {
            lru.touch(&key(p));
        }

        assert_eq!(lru.pop_oldest(), Some(key("etc")));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_retouch_moves_key_to_back() {
        let mut lru = LruCache::new();
        lru.touch(&key("a"));
        lru.touch(&key("b"));
        lru.touch(&key("a"));

        // re-touching does not duplicate the key
        assert_eq!(lru.len(), 2);
        let drained: Vec<PathBuf> = std::iter::from_fn(|| lru.pop_oldest()).collect();
        assert_eq!(drained, vec![key("b"), key("a")]);
    }

    #[test]
    fn test_forgotten_key_is_not_evicted() {
        let mut lru = LruCache::new();
        lru.touch(&key("x/1"));
        lru.touch(&key("x/2"));
        lru.remove(&key("x/1"));
        lru.remove(&key("never/seen"));

        assert_eq!(lru.pop_oldest(), Some(key("x/2")));
        assert!(lru.is_empty());

        lru.touch(&key("y"));
        lru.clear();
        assert_eq!(lru.pop_oldest(), None);
    }
}
