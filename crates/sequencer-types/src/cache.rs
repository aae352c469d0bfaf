use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Eviction strategy recognized by a `MultiLevelCache` tier (§4.4).
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Fifo,
}

/// Per-tier configuration (`cacheLevels[]`, §6).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheLevelConfig {
    pub name: String,
    pub capacity: usize,
    #[serde(with = "humantime_secs", default)]
    pub ttl: Option<Duration>,
    pub eviction_policy: EvictionPolicy,
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(v.map(|d| d.as_secs()).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        })
    }
}

/// One resident cache entry (§3 `CacheEntry`). `dependencies` are the keys
/// whose invalidation must cascade to invalidate this entry (§4.4).
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub key: Vec<u8>,
    pub value: V,
    pub size_bytes: usize,
    pub insertion_time: Instant,
    pub last_access: Instant,
    pub ttl: Option<Duration>,
    pub dependencies: HashSet<Vec<u8>>,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.insertion_time) >= ttl,
            None => false,
        }
    }
}
