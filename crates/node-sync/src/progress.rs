use async_trait::async_trait;
use sequencer_types::NodeId;

/// A point-in-time report of how far a single peer's snapshot push has
/// gotten (§4.8 "Progress is reportable").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncProgress {
    pub peer: NodeId,
    pub last_included_index: u64,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

#[async_trait]
pub trait SyncProgressSink: Send + Sync {
    async fn on_progress(&self, progress: SyncProgress);
}

pub struct NoopProgressSink;

#[async_trait]
impl SyncProgressSink for NoopProgressSink {
    async fn on_progress(&self, _progress: SyncProgress) {}
}
