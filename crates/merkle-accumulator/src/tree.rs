use lru::LruCache;
use parking_lot::Mutex;
use sequencer_crypto::{hash_inner, Hash32};
use worker_pool::WorkerPool;

use crate::proof::{Proof, ProofError, ProofStep, Side};

const EMPTY_ROOT: Hash32 = [0u8; 32];

/// Append-oriented binary Merkle tree (§4.3). Levels are stored densely
/// (`levels[0]` is the leaves); this is the tree's canonical state, so the
/// write-back/dirty-node language in §4.3 "Caching" collapses for a
/// single-process implementation to: `levels` itself is always the
/// flushed state, and `node_cache` exists purely as a read-through cache
/// for repeatedly-requested proof siblings (see DESIGN.md).
///
/// **Carry rule (§4.3a):** when a level has an odd number of nodes, the
/// last one is passed up to the next level unchanged instead of being
/// hashed against a duplicate of itself. This keeps `append_batch`
/// amortized O(B) hash operations: only the "dirty tail" of each level —
/// at most one previously-carried node plus the newly formed pairs — is
/// ever recomputed, the same amortized argument as a binary counter
/// increment.
pub struct MerkleAccumulator {
    levels: Vec<Vec<Hash32>>,
    leaf_count: u64,
    node_cache: Mutex<LruCache<(u32, u64), Hash32>>,
}

impl MerkleAccumulator {
    pub fn new() -> Self {
        Self::with_cache_capacity(4096)
    }

    pub fn with_cache_capacity(cache_capacity: usize) -> Self {
        Self {
            levels: vec![Vec::new()],
            leaf_count: 0,
            node_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(cache_capacity.max(1)).unwrap(),
            )),
        }
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    pub fn root(&self) -> Hash32 {
        self.levels
            .last()
            .and_then(|level| level.last().copied())
            .unwrap_or(EMPTY_ROOT)
    }

    /// Appends a single leaf (§4.3 `append`). Small enough that parallel
    /// dispatch through `WorkerPool` would cost more than it saves, so this
    /// reduces the dirty tail synchronously.
    pub fn append(&mut self, leaf: Hash32) -> Hash32 {
        self.push_leaves(&[leaf]);
        let mut level = 0;
        loop {
            let below_len = self.levels[level].len();
            if below_len <= 1 {
                break;
            }
            let (start_pair_index, _target_len, has_carry) = self.prepare_level(level);
            let below = self.levels[level].clone();
            let full_pairs = below_len / 2;
            let mut computed = Vec::with_capacity(full_pairs.saturating_sub(start_pair_index));
            for pair_idx in start_pair_index..full_pairs {
                computed.push(hash_inner(&below[pair_idx * 2], &below[pair_idx * 2 + 1]));
            }
            self.apply_level(level, start_pair_index, computed, has_carry, &below, below_len);
            level += 1;
        }
        self.root()
    }

    /// Appends many leaves at once (§4.3 `appendBatch`, the primary path).
    /// Contiguous sibling pairs at each level are recomputed in parallel
    /// through `pool`, with a barrier between levels (§4.3 "Parallelism").
    pub async fn append_batch(&mut self, leaves: &[Hash32], pool: &WorkerPool) -> Hash32 {
        if leaves.is_empty() {
            return self.root();
        }
        self.push_leaves(leaves);
        let mut level = 0;
        loop {
            let below_len = self.levels[level].len();
            if below_len <= 1 {
                break;
            }
            let (start_pair_index, _target_len, has_carry) = self.prepare_level(level);
            let below = self.levels[level].clone();
            let full_pairs = below_len / 2;
            let tasks: Vec<_> = (start_pair_index..full_pairs)
                .map(|pair_idx| {
                    let left = below[pair_idx * 2];
                    let right = below[pair_idx * 2 + 1];
                    move |_token: worker_pool::CancellationToken| async move { hash_inner(&left, &right) }
                })
                .collect();
            let computed = if tasks.is_empty() {
                Vec::new()
            } else {
                pool.execute_parallel(tasks)
                    .await
                    .expect("worker pool must stay available through append_batch")
            };
            self.apply_level(level, start_pair_index, computed, has_carry, &below, below_len);
            level += 1;
        }
        self.root()
    }

    /// Updates one leaf's hash and recomputes only its O(log n) path to
    /// the root (§4.3 `updateLeaf`).
    pub fn update_leaf(&mut self, index: u64, new_leaf: Hash32) -> Result<Hash32, ProofError> {
        if index >= self.leaf_count {
            return Err(ProofError::IndexOutOfBounds {
                index,
                leaf_count: self.leaf_count,
            });
        }
        self.levels[0][index as usize] = new_leaf;
        let mut idx = index as usize;
        let mut level = 0;
        loop {
            let len = self.levels[level].len();
            if len <= 1 {
                break;
            }
            let parent_idx = idx / 2;
            let parent_value = if idx % 2 == 0 {
                if idx + 1 < len {
                    hash_inner(&self.levels[level][idx], &self.levels[level][idx + 1])
                } else {
                    self.levels[level][idx]
                }
            } else {
                hash_inner(&self.levels[level][idx - 1], &self.levels[level][idx])
            };
            self.ensure_level_len(level + 1);
            if self.levels[level + 1].len() <= parent_idx {
                self.levels[level + 1].resize(parent_idx + 1, EMPTY_ROOT);
            }
            self.levels[level + 1][parent_idx] = parent_value;
            self.node_cache.lock().put((level as u32 + 1, parent_idx as u64), parent_value);
            idx = parent_idx;
            level += 1;
        }
        Ok(self.root())
    }

    /// Builds an inclusion proof for leaf `index` (§4.3 `generateProof`).
    pub fn generate_proof(&self, index: u64) -> Result<Proof, ProofError> {
        if index >= self.leaf_count {
            return Err(ProofError::IndexOutOfBounds {
                index,
                leaf_count: self.leaf_count,
            });
        }
        let leaf = self.levels[0][index as usize];
        let mut steps = Vec::new();
        let mut idx = index as usize;
        for level in 0..self.levels.len() {
            let len = self.levels[level].len();
            if len <= 1 {
                break;
            }
            let is_left = idx % 2 == 0;
            let sibling_idx = if is_left { idx + 1 } else { idx - 1 };
            if is_left && sibling_idx >= len {
                // Lone carried node: no sibling at this level, hash passes
                // through unchanged (§4.3a).
            } else {
                let sibling = self.node_at(level, sibling_idx);
                steps.push(ProofStep {
                    sibling,
                    side: if is_left { Side::Right } else { Side::Left },
                });
            }
            idx /= 2;
        }
        Ok(Proof {
            leaf,
            steps,
            root: self.root(),
        })
    }

    fn node_at(&self, level: usize, position: usize) -> Hash32 {
        let key = (level as u32, position as u64);
        if let Some(hash) = self.node_cache.lock().get(&key) {
            return *hash;
        }
        let hash = self.levels[level][position];
        self.node_cache.lock().put(key, hash);
        hash
    }

    fn push_leaves(&mut self, leaves: &[Hash32]) {
        self.levels[0].extend_from_slice(leaves);
        self.leaf_count += leaves.len() as u64;
    }

    fn ensure_level_len(&mut self, level: usize) -> usize {
        if self.levels.len() == level {
            self.levels.push(Vec::new());
        }
        self.levels[level].len()
    }

    /// Computes `(start_pair_index, target_above_len, has_carry)` for
    /// recomputing level `level + 1` from `level`'s current contents.
    fn prepare_level(&mut self, level: usize) -> (usize, usize, bool) {
        let below_len = self.levels[level].len();
        let full_pairs = below_len / 2;
        let has_carry = below_len % 2 == 1;
        let target_above_len = full_pairs + has_carry as usize;
        let existing_above_len = self.ensure_level_len(level + 1);
        let start_pair_index = existing_above_len.saturating_sub(1).min(full_pairs);
        (start_pair_index, target_above_len, has_carry)
    }

    fn apply_level(
        &mut self,
        level: usize,
        start_pair_index: usize,
        computed: Vec<Hash32>,
        has_carry: bool,
        below: &[Hash32],
        below_len: usize,
    ) {
        self.levels[level + 1].truncate(start_pair_index);
        for (offset, hash) in computed.iter().enumerate() {
            let position = start_pair_index + offset;
            self.node_cache.lock().put((level as u32 + 1, position as u64), *hash);
        }
        self.levels[level + 1].extend(computed);
        if has_carry {
            self.levels[level + 1].push(below[below_len - 1]);
        }
    }
}

impl Default for MerkleAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
