use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sequencer_metrics::SequencerMetrics;
use sequencer_types::CacheLevelConfig;
use tracing::{debug, instrument};

use crate::error::LoadError;
use crate::prefetch::PrefetchTracker;
use crate::tier::Tier;

/// Supplies values on a cache miss (§4.4 `get`'s "loader" step). Errors
/// are propagated to the caller verbatim and never cached.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &[u8]) -> Result<Vec<u8>, LoadError>;
}

pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub dependencies: HashSet<Vec<u8>>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            dependencies: HashSet::new(),
        }
    }
}

pub struct MultiLevelCacheConfig {
    pub l1: CacheLevelConfig,
    pub l2: CacheLevelConfig,
    pub enable_compression: bool,
    pub compression_threshold_bytes: usize,
    pub enable_prefetch: bool,
    pub prefetch_threshold: f64,
}

/// Two-tier read-through cache in front of `StateStore` (§4.4). The
/// dependency graph (`key -> dependents`) is a `DashMap`, sharded the same
/// way the tiers are, so `invalidate`'s transitive closure does not
/// serialize readers touching unrelated keys (§4.4a).
pub struct MultiLevelCache<L: Loader> {
    l1: Tier,
    l2: Tier,
    dependents: DashMap<Vec<u8>, HashSet<Vec<u8>>>,
    prefetch: PrefetchTracker,
    loader: L,
    metrics: Option<Arc<SequencerMetrics>>,
}

impl<L: Loader> MultiLevelCache<L> {
    pub fn new(config: MultiLevelCacheConfig, loader: L) -> Self {
        let threshold = config.enable_compression.then_some(config.compression_threshold_bytes);
        let prefetch = if config.enable_prefetch {
            PrefetchTracker::enabled(config.prefetch_threshold)
        } else {
            PrefetchTracker::disabled()
        };
        Self {
            l1: Tier::new(config.l1, threshold),
            l2: Tier::new(config.l2, threshold),
            dependents: DashMap::new(),
            prefetch,
            loader,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SequencerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, tier: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.cache_results_total.with_label_values(&[tier, outcome]).inc();
        }
    }

    /// L1 -> L2 (promoting on hit) -> loader (§4.4 `get`). Misses are
    /// never errors; only a loader failure is.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>, LoadError> {
        if let Some(value) = self.l1.get(key) {
            self.record("l1", "hit");
            self.maybe_prefetch(key).await;
            return Ok(value);
        }
        self.record("l1", "miss");

        if let Some(value) = self.l2.get(key) {
            self.record("l2", "hit");
            debug!("promoting L2 hit into L1");
            self.spill_aware_l1_set(key.to_vec(), value.clone(), None, HashSet::new());
            self.maybe_prefetch(key).await;
            return Ok(value);
        }
        self.record("l2", "miss");

        let value = self.loader.load(key).await?;
        self.set(key.to_vec(), value.clone(), SetOptions::default());
        self.maybe_prefetch(key).await;
        Ok(value)
    }

    async fn maybe_prefetch(&self, key: &[u8]) {
        if !self.prefetch.is_enabled() {
            return;
        }
        if let Some(successor) = self.prefetch.record_and_predict(key) {
            if !self.l1.contains(&successor) && !self.l2.contains(&successor) {
                if let Ok(value) = self.loader.load(&successor).await {
                    self.set(successor, value, SetOptions::default());
                }
            }
        }
    }

    /// Inserts into L1; an entry L1 evicts under pressure spills into L2
    /// rather than being dropped (§4.4 `set`).
    #[instrument(skip(self, value, options))]
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>, options: SetOptions) {
        for dep in &options.dependencies {
            self.dependents.entry(dep.clone()).or_default().insert(key.clone());
        }
        self.spill_aware_l1_set(key, value, options.ttl, options.dependencies);
    }

    fn spill_aware_l1_set(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>, dependencies: HashSet<Vec<u8>>) {
        if let Some((evicted_key, evicted_value, evicted_ttl, evicted_deps)) = self.l1.set(key, value, ttl, dependencies) {
            debug!("L1 eviction spilling into L2");
            self.l2.set(evicted_key, evicted_value, evicted_ttl, evicted_deps);
        }
    }

    /// Invalidates `key` and, when `cascade` is true, every key that
    /// transitively declared `key` as a dependency (§4.4 `invalidate`).
    #[instrument(skip(self))]
    pub fn invalidate(&self, key: &[u8], cascade: bool) {
        let mut queue = VecDeque::new();
        queue.push_back(key.to_vec());
        let mut visited = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            self.l1.remove(&current);
            self.l2.remove(&current);

            if cascade {
                if let Some((_, dependents)) = self.dependents.remove(&current) {
                    for dependent in dependents {
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    pub fn l2_len(&self) -> usize {
        self.l2.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_types::EvictionPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader for CountingLoader {
        async fn load(&self, key: &[u8]) -> Result<Vec<u8>, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("value-for-{}", String::from_utf8_lossy(key)).into_bytes())
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl Loader for FailingLoader {
        async fn load(&self, key: &[u8]) -> Result<Vec<u8>, LoadError> {
            Err(LoadError(format!("no such key: {}", String::from_utf8_lossy(key))))
        }
    }

    fn test_config() -> MultiLevelCacheConfig {
        MultiLevelCacheConfig {
            l1: CacheLevelConfig {
                name: "l1".into(),
                capacity: 4,
                ttl: None,
                eviction_policy: EvictionPolicy::Lru,
            },
            l2: CacheLevelConfig {
                name: "l2".into(),
                capacity: 16,
                ttl: None,
                eviction_policy: EvictionPolicy::Lru,
            },
            enable_compression: false,
            compression_threshold_bytes: 0,
            enable_prefetch: false,
            prefetch_threshold: 1.0,
        }
    }

    #[tokio::test]
    async fn l1_eviction_spills_into_l2_instead_of_being_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = MultiLevelCache::new(test_config(), CountingLoader { calls: calls.clone() });

        // L1 capacity is 4; the 5th distinct key evicts the oldest.
        for i in 0..5 {
            cache.set(format!("k{i}").into_bytes(), format!("v{i}").into_bytes(), SetOptions::default());
        }
        assert_eq!(cache.l1_len(), 4);
        assert_eq!(cache.l2_len(), 1);

        // The evicted key is still reachable, now served from L2.
        let value = cache.get(b"k0").await.unwrap();
        assert_eq!(value, b"v0".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "spilled entry must not re-trigger the loader");
    }

    #[tokio::test]
    async fn miss_loads_once_then_hits_are_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = MultiLevelCache::new(test_config(), CountingLoader { calls: calls.clone() });

        let v1 = cache.get(b"account-a").await.unwrap();
        let v2 = cache.get(b"account-a").await.unwrap();
        assert_eq!(v1, v2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_error_is_propagated_and_not_cached() {
        let cache = MultiLevelCache::new(test_config(), FailingLoader);
        let err = cache.get(b"missing").await.unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert_eq!(cache.l1_len(), 0);
    }

    #[tokio::test]
    async fn cascading_invalidate_follows_dependency_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = MultiLevelCache::new(test_config(), CountingLoader { calls });

        cache.set(b"base".to_vec(), b"1".to_vec(), SetOptions::default());
        cache.set(
            b"derived".to_vec(),
            b"2".to_vec(),
            SetOptions {
                ttl: None,
                dependencies: HashSet::from([b"base".to_vec()]),
            },
        );
        cache.set(
            b"derived2".to_vec(),
            b"3".to_vec(),
            SetOptions {
                ttl: None,
                dependencies: HashSet::from([b"derived".to_vec()]),
            },
        );

        cache.invalidate(b"base", true);
        assert_eq!(cache.l1_len(), 0);
    }

    #[tokio::test]
    async fn non_cascading_invalidate_only_removes_the_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = MultiLevelCache::new(test_config(), CountingLoader { calls });

        cache.set(b"base".to_vec(), b"1".to_vec(), SetOptions::default());
        cache.set(
            b"derived".to_vec(),
            b"2".to_vec(),
            SetOptions {
                ttl: None,
                dependencies: HashSet::from([b"base".to_vec()]),
            },
        );

        cache.invalidate(b"base", false);
        assert_eq!(cache.l1_len(), 1); // "derived" survives
    }
}
