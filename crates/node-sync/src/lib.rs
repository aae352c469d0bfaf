//! Onboards new and lagging followers by pushing a chunked snapshot and
//! then handing replication back to `raft-core`'s steady-state
//! `AppendEntries` loop (§4.8).

mod coordinator;
mod error;
mod progress;
mod snapshot_source;

pub use coordinator::{NodeSyncConfig, SyncCoordinator, DEFAULT_CHUNK_SIZE};
pub use error::NodeSyncError;
pub use progress::{NoopProgressSink, SyncProgress, SyncProgressSink};
pub use snapshot_source::{SnapshotSource, StaticSnapshotSource};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use raft_core::{InProcessNetwork, NoopListener, RaftConfig, RaftCore, RaftRpcHandler};
    use sequencer_proto::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
        RequestVoteRequest, RequestVoteResponse, SyncRequest, SyncResponse,
    };
    use sequencer_types::{AccountId, Batch, NodeId, Priority, Transaction, TxId};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    fn sample_batch(tag: u8) -> Batch {
        let tx = Transaction {
            id: TxId::from_tag(&[tag]),
            sender: AccountId::from_tag(b"sender"),
            recipient: AccountId::from_tag(b"recipient"),
            nonce: tag as u64,
            priority: Priority::Medium,
            submitted_at: tag as u64,
            signature: vec![tag],
            payload: vec![],
            conflict_set: Default::default(),
        }
        .with_default_conflict_set();
        Batch::new(tag as u64, vec![tx])
    }

    fn sample_snapshot(last_included_index: u64) -> sequencer_types::Snapshot {
        sequencer_types::Snapshot {
            last_included_index,
            last_included_term: 1,
            state_digest: [7u8; 32],
            state_bytes: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        }
    }

    struct RecordingProgressSink {
        calls: Arc<TokioMutex<Vec<SyncProgress>>>,
    }

    #[async_trait]
    impl SyncProgressSink for RecordingProgressSink {
        async fn on_progress(&self, progress: SyncProgress) {
            self.calls.lock().await.push(progress);
        }
    }

    /// Stands in for a brand-new follower with an empty log: grants every
    /// vote and, until it has received a complete snapshot, reports every
    /// `AppendEntries` as a conflict at index 0 (so the leader's
    /// `next_index` for it collapses below the retained window almost
    /// immediately). Once `InstallSnapshot` delivers a `done` chunk it
    /// behaves like a caught-up follower, so the leader's `next_index`
    /// doesn't immediately regress back down after the push completes.
    struct FakeEmptyFollower {
        install_calls: TokioMutex<Vec<InstallSnapshotRequest>>,
        caught_up: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RaftRpcHandler for FakeEmptyFollower {
        async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
            RequestVoteResponse { term: req.term, vote_granted: true }
        }

        async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
            if self.caught_up.load(std::sync::atomic::Ordering::SeqCst) {
                AppendEntriesResponse { term: req.term, success: true, conflict_index: None, conflict_term: None }
            } else {
                AppendEntriesResponse { term: req.term, success: false, conflict_index: Some(0), conflict_term: None }
            }
        }

        async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
            let term = req.term;
            let done = req.done;
            self.install_calls.lock().await.push(req);
            if done {
                self.caught_up.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            InstallSnapshotResponse { term }
        }

        async fn handle_sync(&self, _req: SyncRequest) -> SyncResponse {
            SyncResponse { accepted: true, snapshot_available: false, from_index: 0 }
        }
    }

    #[tokio::test]
    async fn pushes_chunked_snapshot_and_unblocks_lagging_peer() {
        let network = InProcessNetwork::new();

        let leader_dir = tempfile::tempdir().unwrap();
        let leader_log = Arc::new(
            replication_log::ReplicationLog::open(leader_dir.path(), replication_log::ReplicationLogConfig::default())
                .await
                .unwrap(),
        );
        // Three committed entries, then a compaction that purges index 1-2 —
        // exactly the situation a brand-new follower can never catch up from
        // via ordinary AppendEntries replay.
        leader_log.append(1, sample_batch(1)).await.unwrap();
        leader_log.append(1, sample_batch(2)).await.unwrap();
        leader_log.append(1, sample_batch(3)).await.unwrap();
        leader_log.truncate_prefix(3).await.unwrap();
        assert_eq!(leader_log.first_index().await, 3);

        let mut config = RaftConfig::default();
        config.election_timeout_min = Duration::from_millis(30);
        config.election_timeout_max = Duration::from_millis(50);
        config.heartbeat_interval = Duration::from_millis(10);

        let leader_handle = RaftCore::spawn(
            NodeId(1),
            vec![NodeId(2)],
            Arc::clone(&leader_log),
            Arc::new(network.transport()),
            Arc::new(NoopListener),
            Arc::new(NoopListener),
            config,
        );
        network.register(NodeId(1), Arc::new(leader_handle.clone()));

        let follower = Arc::new(FakeEmptyFollower {
            install_calls: TokioMutex::new(Vec::new()),
            caught_up: std::sync::atomic::AtomicBool::new(false),
        });
        network.register(NodeId(2), follower.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while leader_handle.state_view().role != sequencer_types::RoleTag::Leader {
            assert!(tokio::time::Instant::now() < deadline, "node never became leader");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Let at least one heartbeat round run so the fake follower's
        // conflict response collapses its tracked next_index.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let indices = leader_handle.peer_next_indices().await;
            if indices.iter().any(|&(peer, next)| peer == NodeId(2) && next < 3) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "peer next_index never fell behind retained window");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let progress_calls = Arc::new(TokioMutex::new(Vec::new()));
        let progress_sink = Arc::new(RecordingProgressSink { calls: Arc::clone(&progress_calls) });
        let snapshot = sample_snapshot(3);
        let snapshot_source = Arc::new(StaticSnapshotSource(snapshot.clone()));

        let coordinator = SyncCoordinator::new(
            leader_handle.clone(),
            Arc::clone(&leader_log),
            Arc::new(network.transport()),
            snapshot_source,
            progress_sink,
            // A tiny chunk size forces the chunking loop to run more than once.
            NodeSyncConfig { poll_interval: Duration::from_millis(20), chunk_size: 8 },
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            coordinator.tick().await;
            if !follower.install_calls.lock().await.is_empty()
                && follower.install_calls.lock().await.last().unwrap().done
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "snapshot push never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let calls = follower.install_calls.lock().await;
        assert!(calls.len() > 1, "expected the small chunk size to split the snapshot into multiple frames");
        let reassembled: Vec<u8> = calls.iter().flat_map(|c| c.data.clone()).collect();
        let expected = prost::Message::encode_to_vec(&sequencer_proto::Snapshot::from(&snapshot));
        assert_eq!(reassembled, expected);
        assert!(calls.iter().all(|c| c.last_included_index == 3));
        drop(calls);

        let progress = progress_calls.lock().await;
        assert!(!progress.is_empty());
        assert_eq!(progress.last().unwrap().bytes_sent, progress.last().unwrap().total_bytes);
        drop(progress);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let indices = leader_handle.peer_next_indices().await;
            if indices.iter().any(|&(peer, next)| peer == NodeId(2) && next == 4) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "leader never recorded the peer's snapshot install");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
