use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use merkle_accumulator::{MerkleAccumulator, Proof, ProofError};
use node_sync::SnapshotSource;
use raft_core::{CommitListener, SnapshotApplier};
use sequencer_crypto::{hash_leaf, Hash32};
use sequencer_metrics::SequencerMetrics;
use sequencer_types::{LogEntry, ReceiptOutcome, Snapshot};
use state_store::{StateStore, StateStoreError};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, instrument};
use worker_pool::WorkerPool;

use crate::conflict::schedule_levels;
use crate::executor::{StagedView, TransactionExecutor};

/// Binds RaftCore's commit stream to `StateStore` and `MerkleAccumulator`
/// (§4.7). Every node, leader and follower alike, runs exactly one of
/// these; it is the only place either data structure is mutated, which is
/// what makes the determinism invariant checkable: every node replays the
/// identical deterministic computation over the identical committed input,
/// so `(stateDigest, merkleRoot)` always matches across the cluster without
/// ever needing to ship raw write deltas over the wire.
pub struct StateReplication<E: TransactionExecutor> {
    store: StateStore,
    accumulator: Mutex<MerkleAccumulator>,
    pool: Arc<WorkerPool>,
    executor: Arc<E>,
    last_applied: AtomicU64,
    /// Number of accumulator leaves that existed immediately before each
    /// committed log index's batch was appended. Lets `getProof` translate
    /// a transaction's position within its batch into the accumulator's
    /// flat, cross-batch leaf index.
    leaf_offsets: DashMap<u64, u64>,
    latest_snapshot: RwLock<Option<Snapshot>>,
    metrics: Option<Arc<SequencerMetrics>>,
}

impl<E: TransactionExecutor> StateReplication<E> {
    pub fn new(store: StateStore, accumulator: MerkleAccumulator, pool: Arc<WorkerPool>, executor: Arc<E>) -> Self {
        Self {
            store,
            accumulator: Mutex::new(accumulator),
            pool,
            executor,
            last_applied: AtomicU64::new(0),
            leaf_offsets: DashMap::new(),
            latest_snapshot: RwLock::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SequencerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub async fn root(&self) -> Hash32 {
        self.accumulator.lock().await.root()
    }

    pub fn leaf_offset(&self, log_index: u64) -> Option<u64> {
        self.leaf_offsets.get(&log_index).map(|v| *v)
    }

    pub async fn generate_proof(&self, leaf_index: u64) -> Result<Proof, ProofError> {
        self.accumulator.lock().await.generate_proof(leaf_index)
    }

    /// Re-derives and applies each `Included` transaction's write set,
    /// level by level, from the now-durable `entry.batch` (§4.7
    /// `onEntryCommitted`). `Failed` transactions contribute no writes;
    /// their outcome was already decided by `ParallelSequencer`'s staging
    /// pass before the batch was ever proposed, so this never re-validates
    /// them, only re-executes what was already marked `Included`.
    async fn apply_entry(&self, entry: &LogEntry) {
        let levels = schedule_levels(&entry.batch.transactions);
        let overlay: DashMap<Vec<u8>, Vec<u8>> = DashMap::new();

        for level in levels {
            let writes_per_tx: Vec<Vec<(Vec<u8>, Vec<u8>)>> = futures::future::join_all(level.iter().map(|&idx| {
                let tx = &entry.batch.transactions[idx];
                let receipt = &entry.batch.receipts[idx];
                let view = StagedView::new(&self.store, &overlay);
                async move {
                    if matches!(receipt.outcome, ReceiptOutcome::Failed { .. }) {
                        return Vec::new();
                    }
                    self.executor.execute(tx, &view).await.unwrap_or_default()
                }
            }))
            .await;

            for writes in writes_per_tx {
                for (key, value) in writes {
                    overlay.insert(key, value);
                }
            }
        }

        // Keys are disjoint within a level by construction and a later
        // level's overlay entry for a shared key legitimately supersedes an
        // earlier one, so these can all commit independently.
        for (key, value) in overlay.into_iter() {
            if let Err(error) = self.store.put(key, value).await {
                error!(%error, index = entry.index, "failed to apply a committed write");
            }
        }

        let leaves: Vec<Hash32> = entry
            .batch
            .transactions
            .iter()
            .zip(entry.batch.receipts.iter())
            .map(|(tx, receipt)| {
                let included = matches!(receipt.outcome, ReceiptOutcome::Included);
                hash_leaf(&leaf_input(tx.id.as_bytes(), included))
            })
            .collect();

        let started = std::time::Instant::now();
        let mut accumulator = self.accumulator.lock().await;
        self.leaf_offsets.insert(entry.index, accumulator.leaf_count());
        accumulator.append_batch(&leaves, &self.pool).await;
        drop(accumulator);

        if let Some(metrics) = &self.metrics {
            metrics
                .merkle_append_latency_seconds
                .with_label_values(&[size_bucket(leaves.len())])
                .observe(started.elapsed().as_secs_f64());
        }

        self.last_applied.store(entry.index, Ordering::SeqCst);
    }

    /// Stamps a fresh `StateStore` snapshot with its Raft coordinates
    /// (§4.7a: `StateReplication` is the sole owner of
    /// `lastIncludedIndex`/`lastIncludedTerm`; `StateStore::snapshot` itself
    /// knows nothing about log positions).
    #[instrument(skip(self))]
    pub async fn create_snapshot(&self, last_included_term: u64) -> Result<Snapshot, StateStoreError> {
        let (state_bytes, state_digest) = self.store.snapshot().await?;
        let snapshot = Snapshot {
            last_included_index: self.last_applied(),
            last_included_term,
            state_digest,
            state_bytes,
        };
        *self.latest_snapshot.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }
}

fn size_bucket(batch_len: usize) -> &'static str {
    match batch_len {
        0..=9 => "0-9",
        10..=99 => "10-99",
        100..=499 => "100-499",
        _ => "500+",
    }
}

fn leaf_input(tx_id: &[u8; 32], included: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(33);
    buf.extend_from_slice(tx_id);
    buf.push(included as u8);
    buf
}

#[async_trait]
impl<E: TransactionExecutor> CommitListener for StateReplication<E> {
    async fn on_entry_committed(&self, entry: &LogEntry) {
        info!(index = entry.index, term = entry.term, batch_id = entry.batch.batch_id, "applying committed batch");
        self.apply_entry(entry).await;
    }
}

#[async_trait]
impl<E: TransactionExecutor> SnapshotApplier for StateReplication<E> {
    /// Atomically replaces `StateStore` contents to match an installed
    /// snapshot (§4.7 `applySnapshot`). Truncating the replication log's
    /// prefix is the caller's responsibility; `raft-core`'s
    /// `InstallSnapshot` handling already does this once this returns.
    async fn install_snapshot(&self, snapshot: Snapshot) {
        if let Err(error) = self.store.restore(&snapshot.state_bytes).await {
            error!(%error, "failed to restore state from snapshot");
            return;
        }
        // The accumulator has no "restore from digest" operation: proofs
        // need the full leaf history, not just the root, and the snapshot
        // only carries the former. Out of scope here (§1 Non-goals); a
        // production deployment ships the leaf set alongside the snapshot
        // or rebuilds it from an archival log. This leaves the accumulator
        // empty until replication replays forward past the snapshot point.
        *self.accumulator.lock().await = MerkleAccumulator::new();
        self.leaf_offsets.clear();
        self.last_applied.store(snapshot.last_included_index, Ordering::SeqCst);
        *self.latest_snapshot.write().await = Some(snapshot);
    }
}

#[async_trait]
impl<E: TransactionExecutor> SnapshotSource for StateReplication<E> {
    async fn latest_snapshot(&self) -> Option<Snapshot> {
        self.latest_snapshot.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TransferExecutor;
    use sequencer_types::{AccountId, Batch, Priority, Receipt, Transaction, TxId};
    use state_store::StateStoreConfig;
    use worker_pool::WorkerPoolConfig;

    fn tx(tag: &[u8], sender: AccountId, recipient: AccountId, amount: u64) -> Transaction {
        Transaction {
            id: TxId::from_tag(tag),
            sender,
            recipient,
            nonce: 1,
            priority: Priority::Medium,
            submitted_at: 0,
            signature: Vec::new(),
            payload: amount.to_le_bytes().to_vec(),
            conflict_set: Default::default(),
        }
        .with_default_conflict_set()
    }

    fn replication() -> StateReplication<TransferExecutor> {
        StateReplication::new(
            StateStore::new(StateStoreConfig::default()),
            MerkleAccumulator::new(),
            Arc::new(WorkerPool::new(WorkerPoolConfig::default())),
            Arc::new(TransferExecutor),
        )
    }

    #[tokio::test]
    async fn committing_an_entry_applies_included_writes_and_advances_the_accumulator() {
        let replication = replication();
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");
        replication.store.put(alice.as_bytes().to_vec(), 100u64.to_le_bytes().to_vec()).await.unwrap();

        let transfer = tx(b"t1", alice, bob, 30);
        let mut batch = Batch::new(0, vec![transfer.clone()]);
        batch.receipts = vec![Receipt { tx_id: transfer.id, outcome: ReceiptOutcome::Included }];
        let entry = LogEntry { term: 1, index: 1, batch, checksum: 0 };

        replication.on_entry_committed(&entry).await;

        let alice_balance = replication.store.get(alice.as_bytes()).await.unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(alice_balance.try_into().unwrap()), 70);
        assert_eq!(replication.last_applied(), 1);
        assert_eq!(replication.accumulator.lock().await.leaf_count(), 1);
    }

    #[tokio::test]
    async fn a_failed_receipt_contributes_no_writes() {
        let replication = replication();
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");

        let transfer = tx(b"t1", alice, bob, 30);
        let mut batch = Batch::new(0, vec![transfer.clone()]);
        batch.receipts = vec![Receipt { tx_id: transfer.id, outcome: ReceiptOutcome::Failed { reason: "insufficient balance".into() } }];
        let entry = LogEntry { term: 1, index: 1, batch, checksum: 0 };

        replication.on_entry_committed(&entry).await;

        assert!(replication.store.get(alice.as_bytes()).await.unwrap().is_none());
        assert_eq!(replication.accumulator.lock().await.leaf_count(), 1);
    }

    #[tokio::test]
    async fn leaf_offset_tracks_cumulative_leaves_across_batches() {
        let replication = replication();
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");

        let first = tx(b"t1", alice, bob, 0);
        let mut batch_one = Batch::new(0, vec![first.clone()]);
        batch_one.receipts = vec![Receipt { tx_id: first.id, outcome: ReceiptOutcome::Included }];
        replication.on_entry_committed(&LogEntry { term: 1, index: 1, batch: batch_one, checksum: 0 }).await;

        let second = tx(b"t2", alice, bob, 0);
        let mut batch_two = Batch::new(1, vec![second.clone()]);
        batch_two.receipts = vec![Receipt { tx_id: second.id, outcome: ReceiptOutcome::Included }];
        replication.on_entry_committed(&LogEntry { term: 1, index: 2, batch: batch_two, checksum: 0 }).await;

        assert_eq!(replication.leaf_offset(1), Some(0));
        assert_eq!(replication.leaf_offset(2), Some(1));
    }

    #[tokio::test]
    async fn create_snapshot_stamps_raft_coordinates() {
        let replication = replication();
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");
        let transfer = tx(b"t1", alice, bob, 0);
        let mut batch = Batch::new(0, vec![transfer.clone()]);
        batch.receipts = vec![Receipt { tx_id: transfer.id, outcome: ReceiptOutcome::Included }];
        replication.on_entry_committed(&LogEntry { term: 3, index: 5, batch, checksum: 0 }).await;

        let snapshot = replication.create_snapshot(3).await.unwrap();
        assert_eq!(snapshot.last_included_index, 5);
        assert_eq!(snapshot.last_included_term, 3);
    }

    #[tokio::test]
    async fn install_snapshot_restores_state_and_resets_applied_index() {
        let replication = replication();
        let alice = AccountId::from_tag(b"alice");
        replication.store.put(alice.as_bytes().to_vec(), 50u64.to_le_bytes().to_vec()).await.unwrap();
        let (state_bytes, digest) = replication.store.snapshot().await.unwrap();

        let fresh = replication();
        fresh
            .install_snapshot(Snapshot { last_included_index: 7, last_included_term: 2, state_digest: digest, state_bytes })
            .await;

        assert_eq!(fresh.last_applied(), 7);
        let restored = fresh.store.get(alice.as_bytes()).await.unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(restored.try_into().unwrap()), 50);
        assert_eq!(fresh.latest_snapshot().await.unwrap().last_included_index, 7);
    }
}
