//! Wires `MultiLevelCache` into the commit path (§2's leader/follower data
//! flow: "... StateReplication applies to StateStore + MerkleAccumulator ->
//! MultiLevelCache updated/invalidated -> receipts emitted"). `sequencer-core`
//! itself never touches the cache — `StagedView`'s base-store-plus-overlay
//! reads need to stay purely against `StateStore` for staging/replay
//! determinism — so the invalidation step is composed in at the node level
//! instead.

use std::sync::Arc;

use async_trait::async_trait;
use multi_level_cache::{LoadError, Loader, MultiLevelCache};
use raft_core::CommitListener;
use sequencer_core::{StateReplication, TransactionExecutor};
use sequencer_types::LogEntry;
use state_store::StateStore;

/// Reads the authoritative value straight out of `StateStore` on a cache
/// miss. A missing key is a legitimate value (a fresh account), not a
/// loader failure, so it resolves to an empty byte string rather than an
/// error.
pub struct StateStoreLoader(pub StateStore);

#[async_trait]
impl Loader for StateStoreLoader {
    async fn load(&self, key: &[u8]) -> Result<Vec<u8>, LoadError> {
        self.0
            .get(key)
            .await
            .map(|value| value.unwrap_or_default())
            .map_err(|error| LoadError(error.to_string()))
    }
}

/// Composite `CommitListener` `raft-core` actually holds: apply the commit
/// through `StateReplication` exactly as before, then invalidate every
/// account key the batch touched. `RaftCore::spawn` only accepts a single
/// listener slot, so both behaviors live in one type rather than being
/// registered independently.
pub struct CacheInvalidatingListener<E: TransactionExecutor, L: Loader> {
    replication: Arc<StateReplication<E>>,
    cache: Arc<MultiLevelCache<L>>,
}

impl<E: TransactionExecutor, L: Loader> CacheInvalidatingListener<E, L> {
    pub fn new(replication: Arc<StateReplication<E>>, cache: Arc<MultiLevelCache<L>>) -> Self {
        Self { replication, cache }
    }
}

#[async_trait]
impl<E, L> CommitListener for CacheInvalidatingListener<E, L>
where
    E: TransactionExecutor,
    L: Loader + 'static,
{
    async fn on_entry_committed(&self, entry: &LogEntry) {
        self.replication.on_entry_committed(entry).await;

        for tx in &entry.batch.transactions {
            self.cache.invalidate(tx.sender.as_bytes(), true);
            self.cache.invalidate(tx.recipient.as_bytes(), true);
        }
    }
}
