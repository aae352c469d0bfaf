use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use sequencer_types::{CacheEntry, CacheLevelConfig, EvictionPolicy};

use crate::compression::Stored;

/// One cache tier (§4.4). `entries` holds the actual data in a
/// concurrently-shardable map; `order` is a same-keyed `LruCache` used
/// purely to track eviction order — for `Lru` it is promoted on every
/// access, for `Fifo` it is only ever touched on insertion, so natural
/// insertion order survives as the eviction order.
pub(crate) struct Tier {
    pub(crate) config: CacheLevelConfig,
    entries: DashMap<Vec<u8>, CacheEntry<Stored>>,
    order: Mutex<LruCache<Vec<u8>, ()>>,
    compression_threshold_bytes: Option<usize>,
}

impl Tier {
    pub(crate) fn new(config: CacheLevelConfig, compression_threshold_bytes: Option<usize>) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap();
        Self {
            config,
            entries: DashMap::new(),
            order: Mutex::new(LruCache::new(capacity)),
            compression_threshold_bytes,
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        if self.config.eviction_policy == EvictionPolicy::Lru {
            self.order.lock().get(&key.to_vec());
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_access = now;
        }
        self.entries.get(key).map(|e| e.value.clone().into_plain())
    }

    /// Inserts `key`; if this pushes the tier past capacity, returns the
    /// evicted entry's plain (decompressed) value and metadata so the
    /// caller can spill it into the next tier (§4.4 `set`'s "spills to L2
    /// under pressure").
    #[allow(clippy::type_complexity)]
    pub(crate) fn set(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: Option<Duration>,
        dependencies: HashSet<Vec<u8>>,
    ) -> Option<(Vec<u8>, Vec<u8>, Option<Duration>, HashSet<Vec<u8>>)> {
        let stored = Stored::wrap(value, self.compression_threshold_bytes);
        let now = Instant::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                size_bytes: stored.stored_len(),
                value: stored,
                insertion_time: now,
                last_access: now,
                ttl: ttl.or(self.config.ttl),
                dependencies,
            },
        );
        if let Some((evicted_key, _)) = self.order.lock().push(key, ()) {
            if let Some((_, entry)) = self.entries.remove(&evicted_key) {
                return Some((evicted_key, entry.value.into_plain(), entry.ttl, entry.dependencies));
            }
        }
        None
    }

    pub(crate) fn remove(&self, key: &[u8]) -> Option<HashSet<Vec<u8>>> {
        self.order.lock().pop(key);
        self.entries.remove(key).map(|(_, entry)| entry.dependencies)
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn stored_size(&self, key: &[u8]) -> Option<usize> {
        self.entries.get(key).map(|e| e.size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, capacity: usize, policy: EvictionPolicy) -> CacheLevelConfig {
        CacheLevelConfig {
            name: name.to_string(),
            capacity,
            ttl: None,
            eviction_policy: policy,
        }
    }

    #[test]
    fn fifo_evicts_oldest_regardless_of_access() {
        let tier = Tier::new(config("l1", 2, EvictionPolicy::Fifo), None);
        tier.set(b"a".to_vec(), b"1".to_vec(), None, Default::default());
        tier.set(b"b".to_vec(), b"2".to_vec(), None, Default::default());
        // Touch "a" repeatedly; FIFO must not care.
        tier.get(b"a");
        tier.get(b"a");
        tier.set(b"c".to_vec(), b"3".to_vec(), None, Default::default());
        assert!(!tier.contains(b"a"));
        assert!(tier.contains(b"b"));
        assert!(tier.contains(b"c"));
    }

    #[test]
    fn lru_keeps_recently_touched_entry() {
        let tier = Tier::new(config("l1", 2, EvictionPolicy::Lru), None);
        tier.set(b"a".to_vec(), b"1".to_vec(), None, Default::default());
        tier.set(b"b".to_vec(), b"2".to_vec(), None, Default::default());
        tier.get(b"a"); // promotes "a"
        tier.set(b"c".to_vec(), b"3".to_vec(), None, Default::default());
        assert!(tier.contains(b"a"));
        assert!(!tier.contains(b"b"));
        assert!(tier.contains(b"c"));
    }

    #[test]
    fn expired_entry_is_absent_on_access() {
        let tier = Tier::new(config("l1", 4, EvictionPolicy::Lru), None);
        tier.set(b"a".to_vec(), b"1".to_vec(), Some(Duration::from_millis(1)), Default::default());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tier.get(b"a"), None);
        assert!(!tier.contains(b"a"));
    }
}
