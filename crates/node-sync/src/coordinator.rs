use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use raft_core::{RaftHandle, RaftTransport};
use replication_log::ReplicationLog;
use sequencer_proto::InstallSnapshotRequest;
use sequencer_types::NodeId;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::NodeSyncError;
use crate::progress::{SyncProgress, SyncProgressSink};
use crate::snapshot_source::SnapshotSource;

/// Frames above 8 MiB are rejected for `InstallSnapshot` (§6 "Frames above
/// `maxFrameSize` ... default 8 MiB for InstallSnapshot"); chunks stay well
/// under that to leave headroom for the rest of the gRPC frame.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct NodeSyncConfig {
    pub poll_interval: Duration,
    pub chunk_size: usize,
}

impl Default for NodeSyncConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(500), chunk_size: DEFAULT_CHUNK_SIZE }
    }
}

/// Leader-side onboarding for followers whose replication needs have
/// outrun the log's retained window (§4.8 NodeSync). Runs alongside
/// `raft-core`'s own steady-state `AppendEntries` replication rather than
/// replacing it: once a peer's `next_index` is patched past
/// `last_included_index`, ordinary heartbeats take back over and stream
/// the remaining log tail until `match_index` reaches `commit_index`.
pub struct SyncCoordinator<T: RaftTransport> {
    raft: RaftHandle,
    log: Arc<ReplicationLog>,
    transport: Arc<T>,
    snapshot_source: Arc<dyn SnapshotSource>,
    progress: Arc<dyn SyncProgressSink>,
    config: NodeSyncConfig,
    in_flight: Mutex<HashSet<NodeId>>,
}

impl<T: RaftTransport + 'static> SyncCoordinator<T> {
    pub fn new(
        raft: RaftHandle,
        log: Arc<ReplicationLog>,
        transport: Arc<T>,
        snapshot_source: Arc<dyn SnapshotSource>,
        progress: Arc<dyn SyncProgressSink>,
        config: NodeSyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self { raft, log, transport, snapshot_source, progress, config, in_flight: Mutex::new(HashSet::new()) })
    }

    /// Spawns the polling loop; returns immediately. The loop exits only
    /// when every clone of the returned `Arc` has been dropped — there is
    /// no explicit shutdown handle, since a leader that steps down simply
    /// stops needing this (peers it isn't leading are never selected).
    pub fn spawn(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.tick().await;
                tokio::time::sleep(this.config.poll_interval).await;
            }
        });
    }

    #[instrument(skip(self))]
    pub(crate) async fn tick(self: &Arc<Self>) {
        if self.raft.state_view().role != sequencer_types::RoleTag::Leader {
            return;
        }
        let first_retained = self.log.first_index().await;
        if first_retained <= 1 {
            return; // nothing has been truncated yet; no peer can be behind the window
        }

        for (peer, next_index) in self.raft.peer_next_indices().await {
            if next_index >= first_retained {
                continue;
            }
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(peer) {
                continue; // already syncing this peer
            }
            drop(in_flight);

            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.sync_peer(peer).await {
                    warn!(peer = ?peer, error = %e, "snapshot sync attempt failed, will retry with a fresh snapshot");
                }
                this.in_flight.lock().await.remove(&peer);
            });
        }
    }

    #[instrument(skip(self))]
    async fn sync_peer(&self, peer: NodeId) -> Result<(), NodeSyncError> {
        let snapshot =
            self.snapshot_source.latest_snapshot().await.ok_or(NodeSyncError::NoSnapshotAvailable { peer })?;
        let proto_snapshot = sequencer_proto::Snapshot::from(&snapshot);
        let payload = proto_snapshot.encode_to_vec();
        let total_bytes = payload.len() as u64;
        let view = self.raft.state_view();

        info!(peer = ?peer, last_included_index = snapshot.last_included_index, total_bytes, "starting snapshot push");

        let mut offset = 0usize;
        loop {
            let end = (offset + self.config.chunk_size).min(payload.len());
            let done = end == payload.len();
            let req = InstallSnapshotRequest {
                term: view.current_term,
                leader_id: view.node_id.0,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                offset: offset as u64,
                data: payload[offset..end].to_vec(),
                done,
            };
            self.transport
                .install_snapshot(peer, req)
                .await
                .map_err(|source| NodeSyncError::Aborted { peer, source })?;

            offset = end;
            self.progress
                .on_progress(SyncProgress {
                    peer,
                    last_included_index: snapshot.last_included_index,
                    bytes_sent: offset as u64,
                    total_bytes,
                })
                .await;

            if done {
                break;
            }
        }

        self.raft.report_snapshot_installed(peer, snapshot.last_included_index);
        info!(peer = ?peer, "snapshot push complete, handing back to steady-state replication");
        Ok(())
    }
}
