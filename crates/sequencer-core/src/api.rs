use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use merkle_accumulator::Proof;
use raft_core::RaftHandle;
use replication_log::ReplicationLog;
use sequencer_crypto::{Hash32, SignatureVerifier};
use sequencer_types::{Batch, NodeId, RoleTag, Transaction, TransactionStatus, TxId};

use crate::admission::{AdmissionController, NonceSource};
use crate::capability::ReceiptSink;
use crate::error::SequencerError;
use crate::executor::TransactionExecutor;
use crate::replication::StateReplication;
use crate::sequencer::ParallelSequencer;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitAck {
    pub id: TxId,
    pub accepted_at: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionProof {
    pub leaf: Hash32,
    pub proof: Proof,
    pub root: Hash32,
    pub batch_index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: RoleTag,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<NodeId>,
}

/// The external client surface (§6): submit, poll, fetch a committed
/// batch, and fetch/verify a Merkle inclusion proof. Implementations are
/// expected to downgrade every component error purely through `.kind()`
/// (§7a) so a new variant on `RaftError`/`StateStoreError` never needs a
/// matching arm here.
#[async_trait]
pub trait SequencerApi: Send + Sync {
    async fn submit_transaction(&self, tx: Transaction) -> Result<SubmitAck, SequencerError>;
    async fn get_transaction_status(&self, id: TxId) -> Result<TransactionStatus, SequencerError>;
    async fn get_batch(&self, index: u64) -> Result<Batch, SequencerError>;
    async fn get_proof(&self, tx_id: TxId) -> Result<TransactionProof, SequencerError>;
    fn verify_proof(&self, leaf: Hash32, proof: &Proof, root: Hash32) -> bool;
    async fn get_status(&self) -> NodeStatus;
}

/// Tracks each admitted transaction's terminal state (§7: "there is no
/// unknown terminal state") by acting as the `ReceiptSink` the pipeline
/// reports into. `get_transaction_status`/`get_proof` are pure reads of
/// this map; neither ever scans the replication log directly.
#[derive(Default)]
pub struct StatusTracker {
    status: DashMap<TxId, TransactionStatus>,
}

impl StatusTracker {
    pub fn mark_pending(&self, id: TxId) {
        self.status.entry(id).or_insert(TransactionStatus::Pending);
    }

    pub fn status_of(&self, id: TxId) -> Option<TransactionStatus> {
        self.status.get(&id).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ReceiptSink for StatusTracker {
    async fn on_batch_started(&self, batch: &Batch) {
        for tx in &batch.transactions {
            self.status.insert(tx.id, TransactionStatus::Processing);
        }
    }

    async fn on_batch_committed(&self, batch: &Batch, index: u64) {
        for receipt in &batch.receipts {
            let status = match &receipt.outcome {
                sequencer_types::ReceiptOutcome::Included => TransactionStatus::Committed { batch_index: index },
                sequencer_types::ReceiptOutcome::Failed { reason } => TransactionStatus::Failed { reason: reason.clone() },
            };
            self.status.insert(receipt.tx_id, status);
        }
    }

    async fn on_batch_failed(&self, batch: &Batch, reason: &str) {
        for tx in &batch.transactions {
            self.status.insert(tx.id, TransactionStatus::Failed { reason: reason.to_string() });
        }
    }
}

/// Ties admission, the execution pipeline, replication, and the replicated
/// log together behind [`SequencerApi`]. This is the only sequencer-core
/// type an out-of-scope gRPC/HTTP surface is expected to depend on.
pub struct SequencerNode<E, V, N>
where
    E: TransactionExecutor,
    V: SignatureVerifier + Send + Sync,
    N: NonceSource,
{
    admission: Arc<AdmissionController<V, N>>,
    sequencer: Arc<ParallelSequencer<E>>,
    replication: Arc<StateReplication<E>>,
    log: Arc<ReplicationLog>,
    raft: RaftHandle,
    status: Arc<StatusTracker>,
}

impl<E, V, N> SequencerNode<E, V, N>
where
    E: TransactionExecutor,
    V: SignatureVerifier + Send + Sync,
    N: NonceSource,
{
    pub fn new(
        admission: Arc<AdmissionController<V, N>>,
        sequencer: Arc<ParallelSequencer<E>>,
        replication: Arc<StateReplication<E>>,
        log: Arc<ReplicationLog>,
        raft: RaftHandle,
        status: Arc<StatusTracker>,
    ) -> Self {
        Self { admission, sequencer, replication, log, raft, status }
    }
}

#[async_trait]
impl<E, V, N> SequencerApi for SequencerNode<E, V, N>
where
    E: TransactionExecutor,
    V: SignatureVerifier + Send + Sync,
    N: NonceSource,
{
    async fn submit_transaction(&self, tx: Transaction) -> Result<SubmitAck, SequencerError> {
        let id = tx.id;
        let accepted_at = self.admission.admit(&tx).await?;
        self.status.mark_pending(id);
        self.sequencer.admit(tx).await?;
        Ok(SubmitAck { id, accepted_at })
    }

    async fn get_transaction_status(&self, id: TxId) -> Result<TransactionStatus, SequencerError> {
        self.status.status_of(id).ok_or(SequencerError::NotFound)
    }

    async fn get_batch(&self, index: u64) -> Result<Batch, SequencerError> {
        match self.log.get(index).await {
            Some(entry) => Ok(entry.batch),
            None if index < self.log.first_index().await => Err(SequencerError::Truncated),
            None => Err(SequencerError::NotFound),
        }
    }

    async fn get_proof(&self, tx_id: TxId) -> Result<TransactionProof, SequencerError> {
        // A real deployment indexes tx_id -> (batch_index, position)
        // durably as batches commit; here `StatusTracker` doubles as that
        // index since both status and proof lookups need the same
        // committed batch index.
        let batch_index = match self.status.status_of(tx_id) {
            Some(TransactionStatus::Committed { batch_index }) => batch_index,
            Some(_) | None => return Err(SequencerError::NotFound),
        };

        let entry = self.log.get(batch_index).await.ok_or(SequencerError::Truncated)?;
        let position = entry
            .batch
            .transactions
            .iter()
            .position(|tx| tx.id == tx_id)
            .ok_or(SequencerError::NotFound)? as u64;

        let leaf_offset = self.replication.leaf_offset(batch_index).ok_or(SequencerError::NotFound)?;
        let proof = self
            .replication
            .generate_proof(leaf_offset + position)
            .await
            .map_err(|_| SequencerError::Pruned)?;

        Ok(TransactionProof { leaf: proof.leaf, root: proof.root, proof, batch_index })
    }

    fn verify_proof(&self, leaf: Hash32, proof: &Proof, root: Hash32) -> bool {
        merkle_accumulator::verify_proof(leaf, proof, root)
    }

    async fn get_status(&self) -> NodeStatus {
        let view = self.raft.state_view();
        NodeStatus {
            node_id: view.node_id,
            role: view.role,
            term: view.current_term,
            commit_index: view.commit_index,
            last_applied: self.replication.last_applied(),
            leader_id: view.leader_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_types::ReceiptOutcome;

    #[test]
    fn status_tracker_marks_committed_and_failed_receipts() {
        let tracker = StatusTracker::default();
        let committed_id = TxId::from_tag(b"a");
        let failed_id = TxId::from_tag(b"b");
        tracker.mark_pending(committed_id);
        tracker.mark_pending(failed_id);

        assert_eq!(tracker.status_of(committed_id), Some(TransactionStatus::Pending));

        let batch = Batch {
            batch_id: 0,
            term: 1,
            index: 4,
            transactions: Vec::new(),
            receipts: vec![
                sequencer_types::Receipt { tx_id: committed_id, outcome: ReceiptOutcome::Included },
                sequencer_types::Receipt { tx_id: failed_id, outcome: ReceiptOutcome::Failed { reason: "bad".into() } },
            ],
            root_after: [0u8; 32],
        };

        futures::executor::block_on(tracker.on_batch_committed(&batch, 4));
        assert_eq!(tracker.status_of(committed_id), Some(TransactionStatus::Committed { batch_index: 4 }));
        assert_eq!(tracker.status_of(failed_id), Some(TransactionStatus::Failed { reason: "bad".into() }));
    }

    #[test]
    fn unknown_transaction_has_no_status() {
        let tracker = StatusTracker::default();
        assert_eq!(tracker.status_of(TxId::from_tag(b"missing")), None);
    }

    #[test]
    fn a_pending_transaction_moves_to_processing_once_its_batch_starts() {
        use sequencer_types::AccountId;

        let tracker = StatusTracker::default();
        let id = TxId::from_tag(b"a");
        tracker.mark_pending(id);
        assert_eq!(tracker.status_of(id), Some(TransactionStatus::Pending));

        let tx = Transaction {
            id,
            sender: AccountId::from_tag(b"alice"),
            recipient: AccountId::from_tag(b"bob"),
            nonce: 1,
            priority: sequencer_types::Priority::Medium,
            submitted_at: 0,
            signature: Vec::new(),
            payload: Vec::new(),
            conflict_set: Default::default(),
        }
        .with_default_conflict_set();
        let batch = Batch { batch_id: 0, term: 1, index: 4, transactions: vec![tx], receipts: Vec::new(), root_after: [0u8; 32] };

        futures::executor::block_on(tracker.on_batch_started(&batch));
        assert_eq!(tracker.status_of(id), Some(TransactionStatus::Processing));
    }
}
