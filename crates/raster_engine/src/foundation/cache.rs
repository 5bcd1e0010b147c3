//! Bounded caches and their concurrency wrapper
//!
//! The routine caches are LRU maps from pipeline state keys to compiled
//! routines. [`BoundedCache`] abstracts over the eviction policy so the same
//! synchronized wrapper serves both the per-stage LRU caches and the
//! unbounded device-level sampling cache. [`SyncCache`] adds the at-most-once
//! build guarantee: concurrent lookups of a missing key run the builder on
//! exactly one thread while the others wait on a manual-reset event.

use crate::task::Event;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const NIL: usize = usize::MAX;

/// Capacity-bounded key→value mapping with recency tracking
pub trait BoundedCache<K, V: Clone> {
    /// Returns the value for `key`, promoting the entry to most recent
    fn lookup(&mut self, key: &K) -> Option<V>;
    /// Inserts or replaces the entry for `key`, evicting the least recently
    /// used entry if at capacity
    fn add(&mut self, key: K, value: V);
    /// Removes the entry for `key`
    fn remove(&mut self, key: &K) -> Option<V>;
    /// Drops all entries
    fn clear(&mut self);
    /// Number of live entries
    fn len(&self) -> usize;
    /// Whether the cache is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Visits every entry, most recent first where the policy defines order
    fn for_each(&self, visit: &mut dyn FnMut(&K, &V));
}

struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Least-recently-used cache over a fixed slot array.
///
/// Entries live in preallocated slots linked into a recency list; the map
/// resolves keys to slot indices. Lookup and add are O(1).
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries (clamped to ≥ 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let slot = self.slots[index].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.slots[p].as_mut().unwrap().next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.slots[n].as_mut().unwrap().prev = prev,
        }
    }

    fn link_front(&mut self, index: usize) {
        {
            let slot = self.slots[index].as_mut().unwrap();
            slot.prev = NIL;
            slot.next = self.head;
        }
        match self.head {
            NIL => self.tail = index,
            h => self.slots[h].as_mut().unwrap().prev = index,
        }
        self.head = index;
    }

    fn evict_tail(&mut self) {
        let index = self.tail;
        debug_assert_ne!(index, NIL);
        self.unlink(index);
        let slot = self.slots[index].take().unwrap();
        self.map.remove(&slot.key);
        self.free.push(index);
    }
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> for LruCache<K, V> {
    fn lookup(&mut self, key: &K) -> Option<V> {
        let index = *self.map.get(key)?;
        self.unlink(index);
        self.link_front(index);
        Some(self.slots[index].as_ref().unwrap().value.clone())
    }

    fn add(&mut self, key: K, value: V) {
        if let Some(&index) = self.map.get(&key) {
            self.unlink(index);
            self.link_front(index);
            self.slots[index].as_mut().unwrap().value = value;
            return;
        }

        if self.free.is_empty() {
            self.evict_tail();
        }
        let index = self.free.pop().unwrap();
        self.slots[index] = Some(Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.map.insert(key, index);
        self.link_front(index);
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.unlink(index);
        let slot = self.slots[index].take().unwrap();
        self.free.push(index);
        Some(slot.value)
    }

    fn clear(&mut self) {
        self.map.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.take().is_some() {
                self.free.push(index);
            }
        }
        self.head = NIL;
        self.tail = NIL;
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn for_each(&self, visit: &mut dyn FnMut(&K, &V)) {
        let mut index = self.head;
        while index != NIL {
            let slot = self.slots[index].as_ref().unwrap();
            visit(&slot.key, &slot.value);
            index = slot.next;
        }
    }
}

/// Unbounded map with the same interface as [`LruCache`]; capacity ∞, no
/// recency tracking.
#[derive(Default)]
pub struct UnboundedCache<K, V> {
    map: HashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> UnboundedCache<K, V> {
    /// Creates an empty cache
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> for UnboundedCache<K, V> {
    fn lookup(&mut self, key: &K) -> Option<V> {
        self.map.get(key).cloned()
    }

    fn add(&mut self, key: K, value: V) {
        self.map.insert(key, value);
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn for_each(&self, visit: &mut dyn FnMut(&K, &V)) {
        for (key, value) in &self.map {
            visit(key, value);
        }
    }
}

struct SyncEntry<V> {
    ready: Event,
    value: Mutex<Option<V>>,
}

impl<V> SyncEntry<V> {
    fn new() -> Self {
        Self {
            ready: Event::new(),
            value: Mutex::new(None),
        }
    }
}

/// Lookup statistics, exposed for cache-behavior assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an entry (including in-flight builds)
    pub hits: u64,
    /// Lookups that started a build
    pub misses: u64,
}

/// Thread-safe wrapper adding at-most-once construction to a cache.
///
/// `get_or_create` guarantees that concurrent callers with the same missing
/// key run the builder exactly once; losers wait on the entry's event and
/// observe the winner's value. The builder runs without the cache lock held.
pub struct SyncCache<K, V> {
    cache: Mutex<Box<dyn BoundedCache<K, Arc<SyncEntry<V>>> + Send>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone + Send + 'static, V: Clone + Send + 'static> SyncCache<K, V> {
    /// Creates a synchronized LRU cache of the given capacity
    pub fn lru(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(Box::new(LruCache::new(capacity))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a synchronized unbounded cache
    pub fn unbounded() -> Self {
        Self {
            cache: Mutex::new(Box::new(UnboundedCache::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the value for `key`, waiting out an in-flight build if needed
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.cache.lock().unwrap().lookup(key)?;
        entry.ready.wait();
        let value = entry.value.lock().unwrap().clone();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Inserts a ready entry, replacing any existing one
    pub fn add(&self, key: K, value: V) {
        let entry = Arc::new(SyncEntry::new());
        *entry.value.lock().unwrap() = Some(value);
        entry.ready.signal();
        self.cache.lock().unwrap().add(key, entry);
    }

    /// Returns the value for `key`, building it on this thread if absent.
    ///
    /// On build failure the placeholder entry is removed and the error is
    /// returned; threads that were waiting on the failed build retry, so a
    /// failure is never cached.
    pub fn get_or_create<E>(
        &self,
        key: &K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let mut build = Some(build);
        loop {
            let (entry, winner) = {
                let mut cache = self.cache.lock().unwrap();
                match cache.lookup(key) {
                    Some(entry) => (entry, false),
                    None => {
                        let entry = Arc::new(SyncEntry::new());
                        cache.add(key.clone(), Arc::clone(&entry));
                        (entry, true)
                    }
                }
            };

            if winner {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let build = build
                    .take()
                    .expect("builder consumed by an earlier winning round");
                match build() {
                    Ok(value) => {
                        *entry.value.lock().unwrap() = Some(value.clone());
                        entry.ready.signal();
                        return Ok(value);
                    }
                    Err(error) => {
                        let mut cache = self.cache.lock().unwrap();
                        // Only remove our own placeholder; a retrying loser
                        // may have installed a fresh entry already.
                        if let Some(current) = cache.lookup(key) {
                            if Arc::ptr_eq(&current, &entry) {
                                cache.remove(key);
                            }
                        }
                        drop(cache);
                        entry.ready.signal();
                        return Err(error);
                    }
                }
            }

            entry.ready.wait();
            let cached = entry.value.lock().unwrap().clone();
            if let Some(value) = cached {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            // The winning thread's build failed and removed its placeholder;
            // loop to either become the winner ourselves or wait on a
            // replacement entry.
        }
    }

    /// Drops every entry
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Number of live entries (including in-flight builds)
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every ready entry
    pub fn for_each(&self, mut visit: impl FnMut(&K, &V)) {
        let cache = self.cache.lock().unwrap();
        cache.for_each(&mut |key, entry| {
            if entry.ready.test() {
                if let Some(value) = entry.value.lock().unwrap().as_ref() {
                    visit(key, value);
                }
            }
        });
    }

    /// Snapshot of hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lru_lookup_after_add() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4);
        cache.add(1, 10);
        cache.add(2, 20);
        assert_eq!(cache.lookup(&1), Some(10));
        assert_eq!(cache.lookup(&2), Some(20));
        assert_eq!(cache.lookup(&3), None);
    }

    #[test]
    fn test_lru_never_exceeds_capacity() {
        let mut cache: LruCache<u32, u32> = LruCache::new(8);
        for i in 0..1000 {
            cache.add(i, i);
            assert!(cache.len() <= 8);
        }
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let mut cache: LruCache<u32, u32> = LruCache::new(2);
        cache.add(1, 10);
        cache.add(2, 20);
        // Touch 1 so 2 becomes the eviction candidate.
        assert_eq!(cache.lookup(&1), Some(10));
        cache.add(3, 30);
        assert_eq!(cache.lookup(&2), None);
        assert_eq!(cache.lookup(&1), Some(10));
        assert_eq!(cache.lookup(&3), Some(30));
    }

    #[test]
    fn test_lru_replace_promotes() {
        let mut cache: LruCache<u32, u32> = LruCache::new(2);
        cache.add(1, 10);
        cache.add(2, 20);
        cache.add(1, 11);
        cache.add(3, 30);
        // 2 was least recent after 1's replacement promoted it.
        assert_eq!(cache.lookup(&2), None);
        assert_eq!(cache.lookup(&1), Some(11));
        assert_eq!(cache.lookup(&3), Some(30));
    }

    #[test]
    fn test_lru_order_via_for_each() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4);
        cache.add(1, 10);
        cache.add(2, 20);
        cache.add(3, 30);
        cache.lookup(&1);

        let mut order = Vec::new();
        cache.for_each(&mut |&k, _| order.push(k));
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[test]
    fn test_sync_cache_add_then_get() {
        let cache: SyncCache<u32, u32> = SyncCache::lru(16);
        cache.add(5, 50);
        assert_eq!(cache.get(&5), Some(50));
        assert_eq!(cache.get(&6), None);
    }

    #[test]
    fn test_get_or_create_builds_exactly_once_concurrently() {
        let cache: Arc<SyncCache<u32, u32>> = Arc::new(SyncCache::lru(16));
        let builds = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                std::thread::spawn(move || {
                    cache
                        .get_or_create(&42, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok::<_, ()>(420)
                        })
                        .unwrap()
                })
            })
            .collect();

        for thread in threads {
            assert_eq!(thread.join().unwrap(), 420);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_or_create_failure_is_not_cached() {
        let cache: SyncCache<u32, u32> = SyncCache::lru(16);
        let result: Result<u32, &str> = cache.get_or_create(&1, || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());

        let result: Result<u32, &str> = cache.get_or_create(&1, || Ok(7));
        assert_eq!(result, Ok(7));
    }
}
