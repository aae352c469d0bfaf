use async_trait::async_trait;
use sequencer_types::Batch;

use crate::error::SequencerError;

/// The slice of `RaftCore`/`ReplicationLog` that `ParallelSequencer` actually
/// needs: append a batch and wait for quorum commit (§4.9a). Taking this
/// instead of a full `RaftHandle` means the sequencer never has to know
/// about terms, peers, or elections, and can be unit-tested against a fake
/// that never stands up real consensus.
#[async_trait]
pub trait LogAppender: Send + Sync {
    /// Resolves once `batch` is durably committed, with the committed log
    /// index, or fails once the underlying commit deadline elapses.
    async fn append(&self, batch: Batch) -> Result<u64, SequencerError>;
}

/// Observer notified as batches resolve (§4.9 step 5/6 `onBatchCommitted`).
/// `StateReplication::on_entry_committed` (a `raft_core::CommitListener`)
/// drives the actual state application; this trait is the sequencer's own
/// narrower view used only to fan out receipts to submitters.
#[async_trait]
pub trait ReceiptSink: Send + Sync {
    /// Called once a batch is pulled off the pending queue and is about to
    /// be staged/appended (§6 `getTransactionStatus`'s `processing` state) —
    /// after this point a transaction is no longer `Pending` but hasn't yet
    /// reached a terminal state.
    async fn on_batch_started(&self, batch: &Batch);
    async fn on_batch_committed(&self, batch: &Batch, index: u64);
    async fn on_batch_failed(&self, batch: &Batch, reason: &str);
}

/// A `ReceiptSink` that does nothing; useful for tests exercising admission
/// and scheduling logic in isolation.
pub struct NoopReceiptSink;

#[async_trait]
impl ReceiptSink for NoopReceiptSink {
    async fn on_batch_started(&self, _batch: &Batch) {}
    async fn on_batch_committed(&self, _batch: &Batch, _index: u64) {}
    async fn on_batch_failed(&self, _batch: &Batch, _reason: &str) {}
}

/// The production `LogAppender`: `RaftHandle::propose` already folds "append
/// to my own log" and "wait for quorum ack or commitTimeout" into one call
/// (§4.9a), so this is a thin error-taxonomy translation and nothing more.
#[async_trait]
impl LogAppender for raft_core::RaftHandle {
    async fn append(&self, batch: Batch) -> Result<u64, SequencerError> {
        self.propose(batch)
            .await
            .map_err(|e| SequencerError::from_kind(e.kind(), e.to_string()))
    }
}
