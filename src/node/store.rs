//! Cache + storage composition used by the node
//!
//! Reads go through the cache (a miss populates it); writes hit the shard
//! store first and then update or evict the cached copy. Every cache fill
//! or update happens while the key's shard stripe is still locked.

use crate::common::{KeyHasher, NodeConfig, Result, RingPosition};
use crate::node::cache::{build_cache, Cache};
use crate::node::storage::{PutOutcome, ShardStore};
use std::sync::Arc;

pub struct KvStore {
    storage: ShardStore,
    cache: Box<dyn Cache>,
}

impl KvStore {
    pub fn new(storage: ShardStore, cache: Box<dyn Cache>) -> Self {
        Self { storage, cache }
    }

    /// Open the shard store under `config.data_dir` with the configured cache.
    pub fn open(config: &NodeConfig, hasher: Arc<dyn KeyHasher>) -> Result<Self> {
        let storage = ShardStore::open(&config.data_dir, hasher, config.shard_prefix_len)?;
        let cache = build_cache(config.cache_strategy, config.cache_size);
        tracing::info!(
            "Store ready: {} cache with capacity {}",
            cache.strategy(),
            cache.capacity()
        );
        Ok(Self::new(storage, cache))
    }

    pub fn storage(&self) -> &ShardStore {
        &self.storage
    }

    pub fn cache(&self) -> &dyn Cache {
        self.cache.as_ref()
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }
        self.storage.get_then(key, |value| {
            let value = value.map(str::to_string);
            if let Some(value) = &value {
                self.cache.put(key, value.clone());
            }
            value
        })
    }

    /// Write-through put; `None` deletes.
    pub fn put(&self, key: &str, value: Option<&str>) -> Result<PutOutcome> {
        self.put_then(key, value, |_| {})
    }

    /// Write-through put that runs `on_ack` after a successful write, before
    /// the shard lock is released.
    pub fn put_then(
        &self,
        key: &str,
        value: Option<&str>,
        on_ack: impl FnOnce(&PutOutcome),
    ) -> Result<PutOutcome> {
        self.storage.put_then(key, value, |outcome| {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    // storage state unknown; do not serve a cached copy
                    self.cache.remove(key);
                    return Err(e);
                }
            };
            match value {
                Some(value) => self.cache.put(key, value.to_string()),
                None => {
                    self.cache.remove(key);
                }
            }
            on_ack(&outcome);
            Ok(outcome)
        })
    }

    pub fn entries_in_range(
        &self,
        start: &RingPosition,
        end: &RingPosition,
    ) -> Result<Vec<(String, String)>> {
        self.storage.entries_in_range(start, end)
    }

    pub fn remove_range(&self, start: &RingPosition, end: &RingPosition) -> Result<usize> {
        self.storage.remove_range_then(start, end, |key| {
            self.cache.remove(key);
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.storage.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.storage.is_empty()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CacheStrategy, DigestHasher};
    use tempfile::tempdir;

    fn open(dir: &std::path::Path, strategy: CacheStrategy, size: usize) -> KvStore {
        let config = NodeConfig {
            data_dir: dir.to_path_buf(),
            cache_strategy: strategy,
            cache_size: size,
            ..Default::default()
        };
        KvStore::open(&config, Arc::new(DigestHasher::default())).unwrap()
    }

    #[test]
    fn test_read_through_populates_cache() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheStrategy::Lru, 10);

        store.put("k", Some("v")).unwrap();
        store.clear_cache();
        assert!(store.cache().is_empty());

        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.cache().get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_write_through_updates_cache() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheStrategy::Fifo, 10);

        store.put("k", Some("v1")).unwrap();
        store.put("k", Some("v2")).unwrap();
        assert_eq!(store.cache().get("k").as_deref(), Some("v2"));
        assert_eq!(store.storage().get("k").unwrap().as_deref(), Some("v2"));

        assert_eq!(store.put("k", None).unwrap(), PutOutcome::Deleted);
        assert!(store.cache().get("k").is_none());
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn test_eviction_falls_back_to_storage() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheStrategy::Lru, 2);

        for i in 0..10 {
            store.put(&format!("k{}", i), Some(&format!("v{}", i))).unwrap();
        }
        assert_eq!(store.cache().len(), 2);
        for i in 0..10 {
            assert_eq!(
                store.get(&format!("k{}", i)).unwrap(),
                Some(format!("v{}", i))
            );
        }
    }

    #[test]
    fn test_no_cache_strategy() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheStrategy::None, 10);
        store.put("k", Some("v")).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.cache().is_empty());
    }

    #[test]
    fn test_cache_agrees_with_storage_under_contention() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open(dir.path(), CacheStrategy::Lru, 10));

        for round in 0..20 {
            store.clear_cache();
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        for i in 0..25 {
                            let value = format!("r{}-t{}-{}", round, t, i);
                            if t % 2 == 0 {
                                store.put("hot", Some(&value)).unwrap();
                            } else if i % 5 == 0 {
                                store.put("hot", None).unwrap();
                            } else {
                                store.get("hot").unwrap();
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let stored = store.storage().get("hot").unwrap();
            if let Some(cached) = store.cache().get("hot") {
                assert_eq!(Some(cached), stored, "round {}", round);
            }
            assert_eq!(store.get("hot").unwrap(), stored, "round {}", round);
        }
    }

    #[test]
    fn test_put_then_runs_only_on_success() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheStrategy::Lru, 10);

        let mut seen = Vec::new();
        store
            .put_then("k", Some("v"), |outcome| seen.push(*outcome))
            .unwrap();
        store.put_then("k", None, |outcome| seen.push(*outcome)).unwrap();
        assert_eq!(seen, vec![PutOutcome::Inserted, PutOutcome::Deleted]);
    }

    #[test]
    fn test_remove_range_drops_cached_copies() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), CacheStrategy::Lru, 100);
        for i in 0..20 {
            store.put(&format!("k{}", i), Some("v")).unwrap();
        }
        let whole = RingPosition::from_hex("00");
        assert_eq!(store.cache().len(), 20);
        assert_eq!(store.remove_range(&whole, &whole).unwrap(), 20);
        assert!(store.cache().is_empty());
        assert!(store.get("k3").unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }
}
