use async_trait::async_trait;
use sequencer_types::{LogEntry, Snapshot};

/// Bound to `StateReplication::onEntryCommitted` (§4.7): invoked once per
/// entry, strictly in index order, after that entry's index has reached
/// `commit_index` — never before.
#[async_trait]
pub trait CommitListener: Send + Sync {
    async fn on_entry_committed(&self, entry: &LogEntry);
}

/// Bound to `StateReplication::applySnapshot` (§4.7): invoked once a
/// complete snapshot has been assembled from an `InstallSnapshot` RPC
/// stream (§4.8 NodeSync).
#[async_trait]
pub trait SnapshotApplier: Send + Sync {
    async fn install_snapshot(&self, snapshot: Snapshot);
}

/// A `CommitListener`/`SnapshotApplier` that does nothing; useful for
/// standing up a bare `RaftCore` in tests that only care about leader
/// election and log replication, not state application.
pub struct NoopListener;

#[async_trait]
impl CommitListener for NoopListener {
    async fn on_entry_committed(&self, _entry: &LogEntry) {}
}

#[async_trait]
impl SnapshotApplier for NoopListener {
    async fn install_snapshot(&self, _snapshot: Snapshot) {}
}
