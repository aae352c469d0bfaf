//! Assembles every component crate into one running node (§2 crate layout,
//! §6a). This is the only place all of `sequencer-core`, `raft-core`,
//! `node-sync`, `multi-level-cache`, `state-store`, `replication-log`,
//! `merkle-accumulator`, and `worker-pool` are wired together; every crate
//! it touches is otherwise usable standalone.

use std::collections::HashMap;
use std::sync::Arc;

use merkle_accumulator::MerkleAccumulator;
use multi_level_cache::{MultiLevelCache, MultiLevelCacheConfig};
use node_sync::{NodeSyncConfig, NoopProgressSink, SyncCoordinator};
use raft_core::{GrpcTransport, RaftConfig, RaftCore, RaftHandle};
use replication_log::{ReplicationLog, ReplicationLogConfig};
use sequencer_core::{
    AdmissionConfig, AdmissionController, BundleConfig, ParallelSequencer, PipelineConfig, SequencerNode,
    StateReplication, StateStoreNonceSource, StatusTracker, TransferExecutor,
};
use sequencer_crypto::Ed25519Verifier;
use sequencer_metrics::SequencerMetrics;
use sequencer_types::NodeId;
use state_store::{StateStore, StateStoreConfig};
use worker_pool::{WorkerPool, WorkerPoolConfig};

use crate::cache::{CacheInvalidatingListener, StateStoreLoader};
use crate::config::SequencerConfig;

/// The production type parameterization of `SequencerNode`: ed25519
/// signatures, `StateStore`-backed nonce tracking.
pub type Node = SequencerNode<TransferExecutor, Ed25519Verifier, StateStoreNonceSource>;

/// Everything a running process needs to hold onto: the gRPC-facing
/// `RaftHandle`, the internal `SequencerNode` driving client-visible state,
/// and `ParallelSequencer`, which `main`'s leader-only loop calls into
/// directly.
pub struct RunningNode {
    pub raft: RaftHandle,
    pub node: Arc<Node>,
    pub sequencer: Arc<ParallelSequencer<TransferExecutor>>,
    pub worker_pool: Arc<WorkerPool>,
}

pub async fn bootstrap(config: &SequencerConfig, metrics: Arc<SequencerMetrics>) -> anyhow::Result<RunningNode> {
    std::fs::create_dir_all(&config.data_dir)?;
    let log = Arc::new(
        ReplicationLog::open(config.data_dir.join("log"), ReplicationLogConfig::default())
            .await
            .map_err(|e| anyhow::anyhow!("failed to open replication log: {e}"))?,
    );

    let store = StateStore::new(StateStoreConfig {
        shard_count: config.shard_count,
        read_consistency: config.read_consistency,
        write_consistency: config.write_consistency,
        ..StateStoreConfig::default()
    });

    let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
        max_workers: config.max_parallel_tasks,
        ..WorkerPoolConfig::default()
    }));

    let replication = Arc::new(
        StateReplication::new(store.clone(), MerkleAccumulator::new(), Arc::clone(&pool), Arc::new(TransferExecutor))
            .with_metrics(Arc::clone(&metrics)),
    );

    let mut levels = config.cache_levels.iter();
    let l1 = levels.next().cloned().unwrap_or_else(|| SequencerConfig::default_cache_levels()[0].clone());
    let l2 = levels.next().cloned().unwrap_or_else(|| SequencerConfig::default_cache_levels()[1].clone());
    let cache = Arc::new(
        MultiLevelCache::new(
            MultiLevelCacheConfig {
                l1,
                l2,
                enable_compression: config.enable_compression,
                compression_threshold_bytes: 4096,
                enable_prefetch: config.enable_prefetching,
                prefetch_threshold: 0.5,
            },
            StateStoreLoader(store.clone()),
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    let listener = Arc::new(CacheInvalidatingListener::new(Arc::clone(&replication), cache));

    let peer_ids: Vec<NodeId> = config.peers.keys().copied().collect();
    let addresses: HashMap<NodeId, String> = config.peers.clone();
    let transport = Arc::new(GrpcTransport::new(addresses));

    let raft_config = RaftConfig {
        election_timeout_min: config.election_timeout_min,
        election_timeout_max: config.election_timeout_max,
        heartbeat_interval: config.heartbeat_interval,
        snapshot_threshold: config.snapshot_threshold,
        commit_timeout: config.commit_timeout,
        ..RaftConfig::default()
    };

    let raft = RaftCore::spawn(
        config.node_id,
        peer_ids,
        Arc::clone(&log),
        Arc::clone(&transport),
        listener,
        Arc::clone(&replication) as Arc<dyn raft_core::SnapshotApplier>,
        raft_config,
    );

    let sync_coordinator = SyncCoordinator::new(
        raft.clone(),
        Arc::clone(&log),
        transport,
        Arc::clone(&replication) as Arc<dyn node_sync::SnapshotSource>,
        Arc::new(NoopProgressSink),
        NodeSyncConfig::default(),
    );
    sync_coordinator.spawn();

    let admission = Arc::new(
        AdmissionController::new(Ed25519Verifier, StateStoreNonceSource(store.clone()), AdmissionConfig::default())
            .with_metrics(Arc::clone(&metrics)),
    );

    let status = Arc::new(StatusTracker::default());

    let pipeline_config = PipelineConfig {
        bundle: BundleConfig { max_batch_size: config.max_batch_size, max_batch_bytes: config.max_batch_bytes, ..BundleConfig::default() },
        ..PipelineConfig::default()
    };
    let sequencer = Arc::new(
        ParallelSequencer::new(pipeline_config, store, Arc::new(TransferExecutor), Arc::new(raft.clone()), status.clone())
            .with_metrics(Arc::clone(&metrics)),
    );

    let node = Arc::new(SequencerNode::new(admission, Arc::clone(&sequencer), replication, log, raft.clone(), status));

    Ok(RunningNode { raft, node, sequencer, worker_pool: pool })
}
