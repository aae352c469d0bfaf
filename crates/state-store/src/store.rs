use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sequencer_crypto::Hash32;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{instrument, warn};

use crate::error::StateStoreError;
use crate::partition::{ConsistentHashPolicy, PartitionPolicy};
use crate::shard::{Shard, ShardMap};

/// Replica-level consistency knobs (§4.1 "Consistency knobs"). `StateStore`
/// here models one node's local shard set; cross-node replication of the
/// committed log is `RaftCore`/`StateReplication`'s job (§4.7), so these
/// are carried for API fidelity with the spec rather than driving any
/// quorum logic of their own at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReadConsistency {
    One,
    Quorum,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WriteConsistency {
    One,
    Quorum,
    All,
}

#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    pub shard_count: usize,
    pub read_consistency: ReadConsistency,
    pub write_consistency: WriteConsistency,
    /// Cap on `multi_shard_txn` retries after a `ShardUnavailable` (§4.1
    /// "Failure semantics").
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            read_consistency: ReadConsistency::One,
            write_consistency: WriteConsistency::All,
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }
}

struct Topology {
    shards: Vec<Shard>,
    policy: Box<dyn PartitionPolicy>,
}

/// Sharded key-value store (§4.1). Cheaply cloneable; every clone shares
/// the same underlying shards.
#[derive(Clone)]
pub struct StateStore {
    topology: Arc<RwLock<Topology>>,
    config: StateStoreConfig,
}

impl StateStore {
    pub fn new(config: StateStoreConfig) -> Self {
        let policy: Box<dyn PartitionPolicy> = Box::new(ConsistentHashPolicy::new(config.shard_count));
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: StateStoreConfig, policy: Box<dyn PartitionPolicy>) -> Self {
        let shards = (0..config.shard_count).map(Shard::new).collect();
        Self {
            topology: Arc::new(RwLock::new(Topology { shards, policy })),
            config,
        }
    }

    /// Exposes a shard handle for fault injection in tests
    /// (`mark_unavailable`/`mark_available`).
    pub async fn shard_handle(&self, key: &[u8]) -> Shard {
        let topo = self.topology.read().await;
        let shard_id = topo.policy.shard_for(key);
        topo.shards[shard_id].clone()
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateStoreError> {
        let (shard, _) = self.route(key).await;
        shard.get(key).await
    }

    #[instrument(skip(self, value))]
    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StateStoreError> {
        let (shard, _) = self.route(&key).await;
        shard.put(key, value).await
    }

    async fn route(&self, key: &[u8]) -> (Shard, usize) {
        let topo = self.topology.read().await;
        let shard_id = topo.policy.shard_for(key);
        (topo.shards[shard_id].clone(), shard_id)
    }

    /// Single-shard transaction (§4.1 `txn`), routed by `key`.
    pub async fn txn<F, T>(&self, key: &[u8], callback: F) -> Result<T, StateStoreError>
    where
        F: FnOnce(&mut ShardTxnHandle) -> Result<T, StateStoreError>,
    {
        self.multi_shard_txn(std::slice::from_ref(&key.to_vec()), callback).await
    }

    /// Two-phase-commit-style multi-shard transaction (§4.1
    /// `multiShardTxn`): locks are acquired in ascending shard-id order;
    /// on lock acquisition failure (a shard marked unavailable), the whole
    /// attempt aborts and retries with exponential backoff up to
    /// `config.max_retries`, then surfaces `CommitFailed`. On a callback
    /// error, shard contents are rolled back to their pre-transaction
    /// state before the error is returned.
    #[instrument(skip(self, callback))]
    pub async fn multi_shard_txn<F, T>(&self, keys: &[Vec<u8>], callback: F) -> Result<T, StateStoreError>
    where
        F: FnOnce(&mut ShardTxnHandle) -> Result<T, StateStoreError>,
    {
        let (shards, shard_ids) = {
            let topo = self.topology.read().await;
            let mut ids: Vec<usize> = keys.iter().map(|k| topo.policy.shard_for(k)).collect();
            ids.sort_unstable();
            ids.dedup();
            let shards: Vec<Shard> = ids.iter().map(|&id| topo.shards[id].clone()).collect();
            (shards, ids)
        };

        let mut attempt = 0u32;
        let mut backoff = self.config.initial_backoff;
        let guards = loop {
            attempt += 1;
            match Self::lock_all(&shards).await {
                Ok(guards) => break guards,
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        return Err(StateStoreError::CommitFailed {
                            attempts: attempt,
                            reason: err.to_string(),
                        });
                    }
                    warn!(attempt, ?err, "multi_shard_txn retrying after lock failure");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f64(self.config.backoff_multiplier);
                }
            }
        };

        let snapshots: Vec<ShardMap> = guards.iter().map(|(_, g)| (**g).clone()).collect();
        let mut handle = ShardTxnHandle {
            shard_ids: shard_ids.clone(),
            guards,
        };

        match callback(&mut handle) {
            Ok(value) => Ok(value),
            Err(err) => {
                for ((_, guard), snapshot) in handle.guards.iter_mut().zip(snapshots) {
                    **guard = snapshot;
                }
                Err(err)
            }
        }
    }

    async fn lock_all(shards: &[Shard]) -> Result<Vec<(usize, OwnedRwLockWriteGuard<ShardMap>)>, StateStoreError> {
        let mut guards = Vec::with_capacity(shards.len());
        for shard in shards {
            guards.push((shard.id, shard.lock_owned().await?));
        }
        Ok(guards)
    }

    /// Copies all shards' contents plus the domain-separated `stateDigest`
    /// (§4.1a). The returned bytes are a simple length-prefixed encoding,
    /// not a `prost` message, since state keys/values are opaque bytes
    /// with no fixed schema of their own.
    pub async fn snapshot(&self) -> Result<(Vec<u8>, Hash32), StateStoreError> {
        let topo = self.topology.read().await;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for shard in &topo.shards {
            merged.extend(shard.snapshot().await?);
        }
        let digest = sequencer_crypto::hash_state(merged.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
        Ok((encode_state(&merged), digest))
    }

    /// Replaces all shards' contents with `state_bytes`, re-routing every
    /// key through the current partition policy.
    pub async fn restore(&self, state_bytes: &[u8]) -> Result<(), StateStoreError> {
        let decoded = decode_state(state_bytes);
        let topo = self.topology.read().await;
        let mut per_shard: Vec<ShardMap> = vec![BTreeMap::new(); topo.shards.len()];
        for (key, value) in decoded {
            let shard_id = topo.policy.shard_for(&key);
            per_shard[shard_id].insert(key, value);
        }
        for (shard, entries) in topo.shards.iter().zip(per_shard) {
            shard.restore(entries).await?;
        }
        Ok(())
    }

    /// Changes the shard count (and therefore the policy's internal
    /// layout), moving only the keys whose owning shard actually changed.
    pub async fn rebalance(&self, new_shard_count: usize) -> Result<(), StateStoreError> {
        let mut topo = self.topology.write().await;
        let new_policy = topo.policy.rebalanced(new_shard_count);

        let mut moved: Vec<ShardMap> = vec![BTreeMap::new(); new_shard_count];
        for old_shard in &topo.shards {
            let entries = old_shard.snapshot().await?;
            for (key, value) in entries {
                let new_id = new_policy.shard_for(&key);
                moved[new_id].insert(key, value);
            }
        }

        let new_shards: Vec<Shard> = (0..new_shard_count).map(Shard::new).collect();
        for (shard, entries) in new_shards.iter().zip(moved) {
            shard.restore(entries).await?;
        }

        topo.shards = new_shards;
        topo.policy = new_policy;
        Ok(())
    }
}

fn encode_state(map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, value) in map {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
    buf
}

fn decode_state(bytes: &[u8]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut map = BTreeMap::new();
    let mut cursor = 0usize;
    while cursor + 4 <= bytes.len() {
        let klen = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        let key = bytes[cursor..cursor + klen].to_vec();
        cursor += klen;
        let vlen = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        let value = bytes[cursor..cursor + vlen].to_vec();
        cursor += vlen;
        map.insert(key, value);
    }
    map
}

/// View into the shards locked for an in-flight transaction. `get`/`put`
/// only succeed for keys whose shard is part of this transaction's locked
/// set — any other key is a programmer error in how `keys` was computed.
pub struct ShardTxnHandle {
    shard_ids: Vec<usize>,
    guards: Vec<(usize, OwnedRwLockWriteGuard<ShardMap>)>,
}

impl ShardTxnHandle {
    pub fn get(&self, shard_id: usize, key: &[u8]) -> Option<Vec<u8>> {
        self.find(shard_id).and_then(|g| g.get(key).cloned())
    }

    pub fn put(&mut self, shard_id: usize, key: Vec<u8>, value: Vec<u8>) -> Result<(), StateStoreError> {
        match self.find_mut(shard_id) {
            Some(g) => {
                g.insert(key, value);
                Ok(())
            }
            None => Err(StateStoreError::Rejected(format!(
                "shard {shard_id} is not part of this transaction's locked set {:?}",
                self.shard_ids
            ))),
        }
    }

    fn find(&self, shard_id: usize) -> Option<&ShardMap> {
        self.guards.iter().find(|(id, _)| *id == shard_id).map(|(_, g)| &**g)
    }

    fn find_mut(&mut self, shard_id: usize) -> Option<&mut ShardMap> {
        self.guards
            .iter_mut()
            .find(|(id, _)| *id == shard_id)
            .map(|(_, g)| &mut **g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_put_round_trip() {
        let store = StateStore::new(StateStoreConfig::default());
        store.put(b"k1".to_vec(), b"v1".to_vec()).await.unwrap();
        assert_eq!(store.get(b"k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn multi_shard_txn_commits_atomically() {
        let store = StateStore::new(StateStoreConfig::default());
        let topo = store.topology.read().await;
        let shard_a = topo.policy.shard_for(b"account-a");
        let shard_b = topo.policy.shard_for(b"account-b");
        drop(topo);

        let keys = vec![b"account-a".to_vec(), b"account-b".to_vec()];
        store
            .multi_shard_txn(&keys, |txn| {
                txn.put(shard_a, b"account-a".to_vec(), b"100".to_vec())?;
                txn.put(shard_b, b"account-b".to_vec(), b"200".to_vec())?;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(store.get(b"account-a").await.unwrap(), Some(b"100".to_vec()));
        assert_eq!(store.get(b"account-b").await.unwrap(), Some(b"200".to_vec()));
    }

    #[tokio::test]
    async fn multi_shard_txn_rolls_back_on_callback_error() {
        let store = StateStore::new(StateStoreConfig::default());
        store.put(b"account-a".to_vec(), b"100".to_vec()).await.unwrap();

        let topo = store.topology.read().await;
        let shard_a = topo.policy.shard_for(b"account-a");
        drop(topo);

        let keys = vec![b"account-a".to_vec()];
        let err = store
            .multi_shard_txn(&keys, |txn: &mut ShardTxnHandle| -> Result<(), StateStoreError> {
                txn.put(shard_a, b"account-a".to_vec(), b"999".to_vec())?;
                Err(StateStoreError::Rejected("insufficient balance downstream".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StateStoreError::Rejected(_)));
        assert_eq!(store.get(b"account-a").await.unwrap(), Some(b"100".to_vec()));
    }

    #[tokio::test]
    async fn unavailable_shard_surfaces_commit_failed_after_retries() {
        let store = StateStore::new(StateStoreConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            ..StateStoreConfig::default()
        });
        let shard = store.shard_handle(b"account-a").await;
        shard.mark_unavailable();

        let keys = vec![b"account-a".to_vec()];
        let err = store
            .multi_shard_txn(&keys, |_txn| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::CommitFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn snapshot_and_restore_round_trip_with_stable_digest() {
        let store = StateStore::new(StateStoreConfig::default());
        store.put(b"a".to_vec(), b"1".to_vec()).await.unwrap();
        store.put(b"b".to_vec(), b"2".to_vec()).await.unwrap();

        let (bytes, digest) = store.snapshot().await.unwrap();

        let restored = StateStore::new(StateStoreConfig::default());
        restored.restore(&bytes).await.unwrap();
        let (_, restored_digest) = restored.snapshot().await.unwrap();

        assert_eq!(digest, restored_digest);
        assert_eq!(restored.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(restored.get(b"b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn rebalance_preserves_all_entries() {
        let store = StateStore::new(StateStoreConfig {
            shard_count: 4,
            ..StateStoreConfig::default()
        });
        for i in 0..100 {
            store
                .put(format!("key-{i}").into_bytes(), format!("val-{i}").into_bytes())
                .await
                .unwrap();
        }
        store.rebalance(6).await.unwrap();
        for i in 0..100 {
            assert_eq!(
                store.get(format!("key-{i}").as_bytes()).await.unwrap(),
                Some(format!("val-{i}").into_bytes())
            );
        }
    }
}
