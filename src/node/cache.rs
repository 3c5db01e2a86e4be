//! In-memory caches in front of the shard store
//!
//! Each implementation keeps its state behind a single mutex, so every call is
//! one critical section. When a new key arrives and the cache is full, one
//! entry is evicted first; a capacity of 0 stores nothing.

use crate::common::CacheStrategy;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bounded key-value cache
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: String);

    fn remove(&self, key: &str) -> Option<String>;

    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn clear(&self);

    fn strategy(&self) -> CacheStrategy;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the cache for a configured strategy.
pub fn build_cache(strategy: CacheStrategy, capacity: usize) -> Box<dyn Cache> {
    match strategy {
        CacheStrategy::Lru => Box::new(LruCache::new(capacity)),
        CacheStrategy::Fifo => Box::new(FifoCache::new(capacity)),
        CacheStrategy::Lfu => Box::new(LfuCache::new(capacity)),
        CacheStrategy::None => Box::new(NoCache),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// FIFO
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FifoInner {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

/// Evicts the earliest inserted key; reads and updates keep the order.
pub struct FifoCache {
    capacity: usize,
    inner: Mutex<FifoInner>,
}

impl FifoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(FifoInner::default()),
        }
    }
}

impl Cache for FifoCache {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.inner).map.get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = lock(&self.inner);
        if let Some(existing) = inner.map.get_mut(key) {
            *existing = value;
            return;
        }
        if inner.map.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
        inner.order.push_back(key.to_string());
        inner.map.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<String> {
        let mut inner = lock(&self.inner);
        let value = inner.map.remove(key)?;
        inner.order.retain(|k| k != key);
        Some(value)
    }

    fn len(&self) -> usize {
        lock(&self.inner).map.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.map.clear();
        inner.order.clear();
    }

    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Fifo
    }
}

// ---------------------------------------------------------------------------
// LRU
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LruInner {
    map: HashMap<String, (String, u64)>,
    /// access tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl LruInner {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, last)) = self.map.get_mut(key) {
            self.recency.remove(&*last);
            *last = tick;
            self.recency.insert(tick, key.to_string());
        }
    }
}

/// Evicts the least recently used key; gets and puts both count as use.
pub struct LruCache {
    capacity: usize,
    inner: Mutex<LruInner>,
}

impl LruCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruInner::default()),
        }
    }
}

impl Cache for LruCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut inner = lock(&self.inner);
        let value = inner.map.get(key).map(|(v, _)| v.clone())?;
        inner.touch(key);
        Some(value)
    }

    fn put(&self, key: &str, value: String) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = lock(&self.inner);
        if let Some((existing, _)) = inner.map.get_mut(key) {
            *existing = value;
            inner.touch(key);
            return;
        }
        if inner.map.len() >= self.capacity {
            if let Some((_, victim)) = inner.recency.pop_first() {
                inner.map.remove(&victim);
            }
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.recency.insert(tick, key.to_string());
        inner.map.insert(key.to_string(), (value, tick));
    }

    fn remove(&self, key: &str) -> Option<String> {
        let mut inner = lock(&self.inner);
        let (value, tick) = inner.map.remove(key)?;
        inner.recency.remove(&tick);
        Some(value)
    }

    fn len(&self) -> usize {
        lock(&self.inner).map.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.map.clear();
        inner.recency.clear();
    }

    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Lru
    }
}

// ---------------------------------------------------------------------------
// LFU
// ---------------------------------------------------------------------------

struct LfuEntry {
    value: String,
    hits: u64,
    tick: u64,
}

#[derive(Default)]
struct LfuInner {
    map: HashMap<String, LfuEntry>,
    /// (hits, last access tick, key); the first element is the victim
    order: BTreeSet<(u64, u64, String)>,
    tick: u64,
}

/// Evicts the least frequently used key, the least recently used among equals.
pub struct LfuCache {
    capacity: usize,
    inner: Mutex<LfuInner>,
}

impl LfuCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LfuInner::default()),
        }
    }
}

impl LfuInner {
    fn hit(&mut self, key: &str, value: Option<String>) -> Option<String> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.map.get_mut(key)?;
        self.order.remove(&(entry.hits, entry.tick, key.to_string()));
        entry.hits += 1;
        entry.tick = tick;
        if let Some(value) = value {
            entry.value = value;
        }
        self.order.insert((entry.hits, entry.tick, key.to_string()));
        Some(entry.value.clone())
    }
}

impl Cache for LfuCache {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.inner).hit(key, None)
    }

    fn put(&self, key: &str, value: String) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = lock(&self.inner);
        if inner.map.contains_key(key) {
            inner.hit(key, Some(value));
            return;
        }
        if inner.map.len() >= self.capacity {
            if let Some((_, _, victim)) = inner.order.pop_first() {
                inner.map.remove(&victim);
            }
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.order.insert((1, tick, key.to_string()));
        inner.map.insert(
            key.to_string(),
            LfuEntry {
                value,
                hits: 1,
                tick,
            },
        );
    }

    fn remove(&self, key: &str) -> Option<String> {
        let mut inner = lock(&self.inner);
        let entry = inner.map.remove(key)?;
        inner.order.remove(&(entry.hits, entry.tick, key.to_string()));
        Some(entry.value)
    }

    fn len(&self) -> usize {
        lock(&self.inner).map.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.map.clear();
        inner.order.clear();
    }

    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Lfu
    }
}

// ---------------------------------------------------------------------------
// None
// ---------------------------------------------------------------------------

/// Caches nothing; every read goes to storage.
pub struct NoCache;

impl Cache for NoCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn put(&self, _key: &str, _value: String) {}

    fn remove(&self, _key: &str) -> Option<String> {
        None
    }

    fn len(&self) -> usize {
        0
    }

    fn capacity(&self) -> usize {
        0
    }

    fn clear(&self) {}

    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn v(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let cache = LruCache::new(2);
        cache.put("a", v("1"));
        cache.put("b", v("2"));
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        cache.put("c", v("3"));

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_fifo_ignores_access() {
        let cache = FifoCache::new(2);
        cache.put("a", v("1"));
        cache.put("b", v("2"));
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        cache.put("c", v("3"));

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").as_deref(), Some("2"));
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_fifo_update_keeps_position() {
        let cache = FifoCache::new(2);
        cache.put("a", v("1"));
        cache.put("b", v("2"));
        cache.put("a", v("updated"));
        cache.put("c", v("3"));

        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        let cache = LfuCache::new(2);
        cache.put("a", v("1"));
        cache.put("b", v("2"));
        cache.get("a");
        cache.get("a");
        cache.get("b");
        cache.put("c", v("3"));

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").as_deref(), Some("1"));
    }

    #[test]
    fn test_lfu_tie_breaks_by_recency() {
        let cache = LfuCache::new(2);
        cache.put("a", v("1"));
        cache.put("b", v("2"));
        // equal counts: a was touched first
        cache.put("c", v("3"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_remove_and_clear() {
        for strategy in [CacheStrategy::Lru, CacheStrategy::Fifo, CacheStrategy::Lfu] {
            let cache = build_cache(strategy, 4);
            cache.put("a", v("1"));
            cache.put("b", v("2"));
            assert_eq!(cache.remove("a").as_deref(), Some("1"));
            assert!(cache.remove("a").is_none());
            assert_eq!(cache.len(), 1);
            cache.clear();
            assert!(cache.is_empty());
            assert_eq!(cache.strategy(), strategy);
        }
    }

    #[test]
    fn test_none_stores_nothing() {
        let cache = build_cache(CacheStrategy::None, 100);
        cache.put("a", v("1"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.capacity(), 0);
    }

    #[test]
    fn test_zero_capacity() {
        for strategy in [CacheStrategy::Lru, CacheStrategy::Fifo, CacheStrategy::Lfu] {
            let cache = build_cache(strategy, 0);
            cache.put("a", v("1"));
            assert!(cache.get("a").is_none());
            assert_eq!(cache.len(), 0);
        }
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut rng = rand::thread_rng();
        for strategy in [
            CacheStrategy::Lru,
            CacheStrategy::Fifo,
            CacheStrategy::Lfu,
            CacheStrategy::None,
        ] {
            let capacity = rng.gen_range(1..8);
            let cache = build_cache(strategy, capacity);
            for _ in 0..500 {
                let key = format!("k{}", rng.gen_range(0..20));
                match rng.gen_range(0..3) {
                    0 => cache.put(&key, key.clone()),
                    1 => {
                        if let Some(value) = cache.get(&key) {
                            assert_eq!(value, key);
                        }
                    }
                    _ => {
                        cache.remove(&key);
                    }
                }
                assert!(cache.len() <= cache.capacity());
            }
        }
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;

        let cache: Arc<dyn Cache> = Arc::from(build_cache(CacheStrategy::Lru, 16));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("{}-{}", t, i % 10);
                        cache.put(&key, v("x"));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }
}
