//! Pluggable shard-routing strategies (spec §4.1 "Routing strategy",
//! §9 REDESIGN FLAGS "Dynamic dispatch on option bags"). Modeled as a trait
//! object rather than a tagged enum purely for symmetry with
//! [`sequencer_crypto::SignatureVerifier`]'s pluggable-capability pattern
//! elsewhere in the workspace; the underlying vocabulary is still exactly
//! the spec's three named strategies.

use std::collections::BTreeMap;
use std::fmt;

/// A shard-routing strategy. `rebalanced` returns a new policy sized for
/// `new_shard_count`; callers compare `shard_for` under the old and new
/// policy to find which keys actually need to move (§4.1 "on shard-set
/// change, only keys whose virtual-node owner changed are remapped").
pub trait PartitionPolicy: Send + Sync + fmt::Debug {
    fn shard_for(&self, key: &[u8]) -> usize;
    fn shard_count(&self) -> usize;
    fn rebalanced(&self, new_shard_count: usize) -> Box<dyn PartitionPolicy>;
}

fn fxhash64(bytes: &[u8]) -> u64 {
    fxhash::hash64(bytes)
}

/// Plain `hash(key) mod shard_count`. Simple, but a shard-count change
/// remaps nearly every key.
#[derive(Debug, Clone)]
pub struct HashPolicy {
    shard_count: usize,
}

impl HashPolicy {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count > 0, "shard_count must be positive");
        Self { shard_count }
    }
}

impl PartitionPolicy for HashPolicy {
    fn shard_for(&self, key: &[u8]) -> usize {
        (fxhash64(key) % self.shard_count as u64) as usize
    }

    fn shard_count(&self) -> usize {
        self.shard_count
    }

    fn rebalanced(&self, new_shard_count: usize) -> Box<dyn PartitionPolicy> {
        Box::new(HashPolicy::new(new_shard_count))
    }
}

/// Splits the keyspace into `shard_count` contiguous ranges keyed by the
/// first byte of the key. Good for range-scan-friendly workloads; a
/// shard-count change remaps a contiguous band of the keyspace.
#[derive(Debug, Clone)]
pub struct RangePolicy {
    shard_count: usize,
}

impl RangePolicy {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count > 0, "shard_count must be positive");
        Self { shard_count }
    }
}

impl PartitionPolicy for RangePolicy {
    fn shard_for(&self, key: &[u8]) -> usize {
        let lead_byte = key.first().copied().unwrap_or(0) as usize;
        (lead_byte * self.shard_count) / 256
    }

    fn shard_count(&self) -> usize {
        self.shard_count
    }

    fn rebalanced(&self, new_shard_count: usize) -> Box<dyn PartitionPolicy> {
        Box::new(RangePolicy::new(new_shard_count))
    }
}

/// Consistent-hash ring with ≥128 virtual nodes per physical shard (§4.1):
/// growing or shrinking the shard set only remaps keys whose nearest
/// virtual node on the ring changed owner, instead of most of the
/// keyspace.
#[derive(Debug, Clone)]
pub struct ConsistentHashPolicy {
    shard_count: usize,
    virtual_nodes_per_shard: usize,
    ring: BTreeMap<u64, usize>,
}

const DEFAULT_VIRTUAL_NODES_PER_SHARD: usize = 128;

impl ConsistentHashPolicy {
    pub fn new(shard_count: usize) -> Self {
        Self::with_virtual_nodes(shard_count, DEFAULT_VIRTUAL_NODES_PER_SHARD)
    }

    pub fn with_virtual_nodes(shard_count: usize, virtual_nodes_per_shard: usize) -> Self {
        assert!(shard_count > 0, "shard_count must be positive");
        assert!(
            virtual_nodes_per_shard >= 128,
            "spec requires at least 128 virtual nodes per physical shard"
        );
        let mut ring = BTreeMap::new();
        for shard in 0..shard_count {
            for vnode in 0..virtual_nodes_per_shard {
                let label = format!("shard-{shard}-vnode-{vnode}");
                ring.insert(fxhash64(label.as_bytes()), shard);
            }
        }
        Self {
            shard_count,
            virtual_nodes_per_shard,
            ring,
        }
    }
}

impl PartitionPolicy for ConsistentHashPolicy {
    fn shard_for(&self, key: &[u8]) -> usize {
        let position = fxhash64(key);
        self.ring
            .range(position..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, shard)| *shard)
            .expect("ring is never empty for shard_count > 0")
    }

    fn shard_count(&self) -> usize {
        self.shard_count
    }

    fn rebalanced(&self, new_shard_count: usize) -> Box<dyn PartitionPolicy> {
        Box::new(ConsistentHashPolicy::with_virtual_nodes(
            new_shard_count,
            self.virtual_nodes_per_shard,
        ))
    }
}
