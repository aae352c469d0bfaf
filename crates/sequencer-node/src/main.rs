mod bootstrap;
mod cache;
mod config;
mod grpc;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::{Cli, SequencerConfig};
use prometheus::Registry;
use sequencer_proto::RaftRpcServer;
use sequencer_types::RoleTag;
use tonic::transport::Server;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SequencerConfig::load(&cli)?;

    sequencer_logger::init(config.log_json);
    info!(node_id = ?config.node_id, "starting sequencer node");

    let registry = Registry::new();
    let metrics = Arc::new(sequencer_metrics::SequencerMetrics::register(&config.metrics_namespace, &registry)?);

    let running = bootstrap::bootstrap(&config, Arc::clone(&metrics)).await?;

    let listen_addr: std::net::SocketAddr = config.listen_addr.parse()?;
    let raft_for_grpc = running.raft.clone();
    let grpc_server = tokio::spawn(async move {
        let service = grpc::RaftRpcService::new(raft_for_grpc);
        if let Err(error) = Server::builder().add_service(RaftRpcServer::new(service)).serve(listen_addr).await {
            error!(%error, "gRPC server exited");
        }
    });

    let pipeline = tokio::spawn(run_leader_pipeline(
        running.raft.clone(),
        running.sequencer.clone(),
        running.worker_pool.clone(),
        metrics,
    ));
    let status_logger = tokio::spawn(log_status_periodically(running.node.clone()));

    tokio::select! {
        _ = grpc_server => {}
        _ = pipeline => {}
        _ = status_logger => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            running.raft.shutdown();
        }
    }

    Ok(())
}

/// Periodically logs `SequencerApi::get_status` (§6 `getStatus`), the only
/// observability this binary adds beyond the Prometheus gauges `raft-core`
/// and `sequencer-core` already drive.
async fn log_status_periodically(node: Arc<bootstrap::Node>) {
    loop {
        let status = sequencer_core::SequencerApi::get_status(node.as_ref()).await;
        info!(
            node_id = ?status.node_id,
            role = ?status.role,
            term = status.term,
            commit_index = status.commit_index,
            last_applied = status.last_applied,
            "status"
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

/// Drives `ParallelSequencer::run_once` exactly while this node holds
/// leadership (§2's leader data flow; §4.9's pipeline is leader-only). A
/// follower just sits idle here, replaying commits through the
/// `CommitListener` registered at bootstrap instead.
async fn run_leader_pipeline(
    raft: raft_core::RaftHandle,
    sequencer: Arc<sequencer_core::ParallelSequencer<sequencer_core::TransferExecutor>>,
    worker_pool: Arc<worker_pool::WorkerPool>,
    metrics: Arc<sequencer_metrics::SequencerMetrics>,
) {
    loop {
        let view = raft.state_view();
        metrics.raft_term.set(view.current_term as i64);
        metrics.raft_role.set(role_gauge(view.role));
        metrics.worker_pool_queue_depth.set(worker_pool.queue_depth() as i64);

        if view.role != RoleTag::Leader {
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        if sequencer.pending_len() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        }

        if let Err(error) = sequencer.run_once().await {
            error!(%error, "batch pipeline iteration failed");
        }
    }
}

fn role_gauge(tag: RoleTag) -> i64 {
    match tag {
        RoleTag::Follower => 0,
        RoleTag::Candidate => 1,
        RoleTag::Leader => 2,
    }
}
