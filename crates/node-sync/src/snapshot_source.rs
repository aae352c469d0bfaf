use async_trait::async_trait;
use sequencer_types::Snapshot;

/// The leader's current point-in-time state snapshot, as maintained by
/// `StateReplication` (§4.7a: `StateReplication::create_snapshot` is the
/// sole owner of stamping `lastIncludedIndex`/`lastIncludedTerm`). `node-sync`
/// only ever reads the latest one; it never triggers snapshot creation.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn latest_snapshot(&self) -> Option<Snapshot>;
}

/// A `SnapshotSource` that always returns a fixed snapshot; useful for
/// tests that don't need a running `StateReplication`.
pub struct StaticSnapshotSource(pub Snapshot);

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn latest_snapshot(&self) -> Option<Snapshot> {
        Some(self.0.clone())
    }
}
